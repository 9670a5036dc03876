//! `SQLite` reference implementation of [`RelationalExecutor`].
//!
//! One connection is shared behind a mutex and every statement runs on
//! tokio's blocking pool. This is the only place that looks at driver error
//! text: `no such column: …` and `… has no column named …` become
//! [`ExecutorError::SchemaCompatibility`], everything else becomes
//! [`ExecutorError::Storage`].

// SQLite reports affected-row counts as usize; they always fit in u64.
#![allow(clippy::cast_possible_truncation)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, ToSql};
use tracing::{debug, info};

use super::{ExecutorError, Params, RelationalExecutor, Row, SqlValue};
use crate::cancel::Cancellation;
use crate::schema::{self, SchemaGeneration};

/// Default busy timeout applied to file-backed databases.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite`-backed executor.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// Owned copy of a statement and its parameters, moved into the blocking
/// pool.
struct OwnedStatement {
    sql: String,
    params: Vec<(String, Value)>,
}

impl OwnedStatement {
    fn new(sql: &str, params: &Params) -> Self {
        Self {
            sql: sql.to_string(),
            params: params
                .iter()
                .map(|(name, value)| (name.to_string(), to_sqlite_value(value)))
                .collect(),
        }
    }

    fn bound(&self) -> Vec<(&str, &dyn ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect()
    }
}

impl SqliteExecutor {
    /// Opens (or creates) a database file and installs the schema for
    /// `generation` if its tables are missing.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Storage`] if the file cannot be opened or the
    /// schema cannot be installed.
    pub fn open(
        path: impl AsRef<Path>,
        generation: SchemaGeneration,
        busy_timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(classify)?;
        conn.busy_timeout(busy_timeout).map_err(classify)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(classify)?;
        schema::install(&conn, generation).map_err(classify)?;

        info!(path = %path.display(), ?generation, "opened signature database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory database with the schema for `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Storage`] if the schema cannot be installed.
    pub fn in_memory(generation: SchemaGeneration) -> Result<Self, ExecutorError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        schema::install(&conn, generation).map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an already prepared connection. No schema is installed.
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        }
    }

    /// Shared handle to the underlying connection.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Database file path, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn run_blocking<T, F>(&self, cancel: &Cancellation, op: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| ExecutorError::Storage(format!("connection mutex poisoned: {e}")))?;
            op(&guard).map_err(classify)
        })
        .await
        .map_err(|e| ExecutorError::Storage(format!("spawn_blocking failed: {e}")))?
    }
}

#[async_trait]
impl RelationalExecutor for SqliteExecutor {
    async fn execute_non_query(
        &self,
        sql: &str,
        params: &Params,
        cancel: &Cancellation,
    ) -> Result<u64, ExecutorError> {
        let owned = OwnedStatement::new(sql, params);
        self.run_blocking(cancel, move |conn| {
            let mut stmt = conn.prepare(&owned.sql)?;
            let affected = stmt.execute(owned.bound().as_slice())?;
            Ok(affected as u64)
        })
        .await
    }

    async fn execute_scalar(
        &self,
        sql: &str,
        params: &Params,
        cancel: &Cancellation,
    ) -> Result<Option<SqlValue>, ExecutorError> {
        let owned = OwnedStatement::new(sql, params);
        self.run_blocking(cancel, move |conn| {
            let mut stmt = conn.prepare(&owned.sql)?;
            let mut rows = stmt.query(owned.bound().as_slice())?;
            match rows.next()? {
                Some(row) => Ok(Some(from_sqlite_value(row.get::<_, Value>(0)?))),
                None => Ok(None),
            }
        })
        .await
    }

    async fn execute_select(
        &self,
        sql: &str,
        params: &Params,
        cancel: &Cancellation,
    ) -> Result<Vec<Row>, ExecutorError> {
        let owned = OwnedStatement::new(sql, params);
        let rows = self
            .run_blocking(cancel, move |conn| {
                let mut stmt = conn.prepare(&owned.sql)?;
                let names: Vec<String> = stmt
                    .column_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let mut rows = stmt.query(owned.bound().as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut columns = Vec::with_capacity(names.len());
                    for (index, name) in names.iter().enumerate() {
                        columns.push((name.clone(), from_sqlite_value(row.get::<_, Value>(index)?)));
                    }
                    out.push(Row::new(columns));
                }
                Ok(out)
            })
            .await?;

        // A read that finished after cancellation is discarded.
        if cancel.is_cancelled() {
            debug!(rows = rows.len(), "discarding select result after cancellation");
            return Err(ExecutorError::Cancelled);
        }
        Ok(rows)
    }
}

fn to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Real(v) => Value::Real(*v),
        SqlValue::Text(v) => Value::Text(v.clone()),
    }
}

fn from_sqlite_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(v),
        Value::Real(v) => SqlValue::Real(v),
        Value::Text(v) => SqlValue::Text(v),
        Value::Blob(v) => SqlValue::Text(String::from_utf8_lossy(&v).into_owned()),
    }
}

/// Maps a driver error onto the executor taxonomy.
///
/// Prepare-time failures arrive as `SqlInputError`, step-time failures as
/// `SqliteFailure`; both carry the driver message.
fn classify(err: rusqlite::Error) -> ExecutorError {
    let message = match &err {
        rusqlite::Error::SqliteFailure(_, Some(message))
        | rusqlite::Error::SqlInputError { msg: message, .. } => Some(message),
        _ => None,
    };
    if let Some(message) = message.filter(|m| is_unknown_column(m)) {
        return ExecutorError::SchemaCompatibility {
            detail: message.clone(),
        };
    }
    ExecutorError::Storage(format!("database error: {err}"))
}

fn is_unknown_column(message: &str) -> bool {
    message.starts_with("no such column") || message.contains("has no column named")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_column_messages_are_recognized() {
        assert!(is_unknown_column("no such column: digital_signature_id"));
        assert!(is_unknown_column(
            "table system_event_log has no column named digital_signature_id"
        ));
        assert!(!is_unknown_column("no such table: system_event_log"));
        assert!(!is_unknown_column("UNIQUE constraint failed: t.id"));
    }

    #[tokio::test]
    async fn insert_into_missing_column_is_schema_compatibility() {
        let exec = SqliteExecutor::in_memory(SchemaGeneration::Legacy).unwrap();
        let params = Params::new()
            .with(":t", "2024-01-01T00:00:00.000000Z")
            .with(":sig", 1);

        let err = exec
            .execute_scalar(
                "INSERT INTO system_event_log (event_time, event_type, table_name, digital_signature_id) \
                 VALUES (:t, 'E', 'system', :sig) RETURNING id",
                &params,
                &Cancellation::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::SchemaCompatibility { .. }));
    }

    #[tokio::test]
    async fn select_of_missing_column_is_schema_compatibility() {
        let exec = SqliteExecutor::in_memory(SchemaGeneration::Legacy).unwrap();

        let err = exec
            .execute_select(
                "SELECT digital_signature_id FROM system_event_log",
                &Params::new(),
                &Cancellation::new(),
            )
            .await
            .unwrap_err();

        assert!(
            matches!(err, ExecutorError::SchemaCompatibility { ref detail } if detail.contains("digital_signature_id")),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn missing_table_is_storage_error() {
        let exec = SqliteExecutor::from_connection(Connection::open_in_memory().unwrap());
        let err = exec
            .execute_select("SELECT id FROM nowhere", &Params::new(), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Storage(_)));
    }

    #[tokio::test]
    async fn cancelled_token_blocks_dispatch() {
        let exec = SqliteExecutor::in_memory(SchemaGeneration::Current).unwrap();
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = exec
            .execute_non_query(
                "INSERT INTO system_event_log (event_time, event_type, table_name) \
                 VALUES ('2024-01-01T00:00:00.000000Z', 'E', 'system')",
                &Params::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Cancelled);

        let count = exec
            .execute_scalar(
                "SELECT COUNT(*) FROM system_event_log",
                &Params::new(),
                &Cancellation::new(),
            )
            .await
            .unwrap();
        assert_eq!(count, Some(SqlValue::Integer(0)));
    }

    #[tokio::test]
    async fn select_returns_named_columns() {
        let exec = SqliteExecutor::in_memory(SchemaGeneration::Current).unwrap();
        let rows = exec
            .execute_select(
                "SELECT :a AS a, :b AS b",
                &Params::new().with(":a", 7).with(":b", Option::<String>::None),
                &Cancellation::new(),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("a"), Some(7));
        assert_eq!(rows[0].get("b"), Some(&SqlValue::Null));
    }
}
