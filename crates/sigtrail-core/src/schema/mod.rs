//! Embedded DDL for the supported schema generations.
//!
//! The signature table has a single shape. The audit table exists in two
//! generations: [`SchemaGeneration::Current`] carries dedicated
//! `digital_signature_id` / `digital_signature` columns,
//! [`SchemaGeneration::Legacy`] does not. The writer detects which one it is
//! talking to at runtime, so installing the legacy shape is how older
//! deployments (and the fallback tests) are reproduced.

use rusqlite::Connection;

const SIGNATURES_SQL: &str = include_str!("signatures.sql");
const AUDIT_CURRENT_SQL: &str = include_str!("audit_current.sql");
const AUDIT_LEGACY_SQL: &str = include_str!("audit_legacy.sql");
const AUDIT_GUARDS_SQL: &str = include_str!("audit_guards.sql");
const ENTITIES_SQL: &str = include_str!("entities.sql");

/// Audit table generation to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaGeneration {
    /// Audit table with dedicated signature columns.
    #[default]
    Current,
    /// Audit table without signature columns.
    Legacy,
}

/// Installs the signature and audit tables for `generation`.
///
/// Every statement is `IF NOT EXISTS`, so installing over an existing
/// database leaves its tables (and their generation) untouched.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn install(conn: &Connection, generation: SchemaGeneration) -> rusqlite::Result<()> {
    conn.execute_batch(SIGNATURES_SQL)?;
    match generation {
        SchemaGeneration::Current => conn.execute_batch(AUDIT_CURRENT_SQL)?,
        SchemaGeneration::Legacy => conn.execute_batch(AUDIT_LEGACY_SQL)?,
    }
    conn.execute_batch(AUDIT_GUARDS_SQL)
}

/// Installs reference tables for the built-in entity kinds.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn install_entity_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(ENTITIES_SQL)
}

/// Returns `true` if `table` has a column named `column`.
///
/// # Errors
///
/// Returns an error if the table info cannot be read.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        [table, column],
        |row| row.get(0),
    )
}
