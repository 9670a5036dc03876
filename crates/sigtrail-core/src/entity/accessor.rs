//! Read-only access to the current state of signed records.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{EntitySnapshot, Signable, kind_for_table};
use crate::cancel::Cancellation;
use crate::executor::{ExecutorError, Params, RelationalExecutor};

/// Loads a record's current identity fields.
///
/// `Ok(None)` means the record no longer exists. Implementations must honour
/// `cancel` before touching storage.
#[async_trait]
pub trait EntityAccessor: Send + Sync {
    /// Loads `table`/`record_id`.
    async fn load(
        &self,
        table: &str,
        record_id: i64,
        cancel: &Cancellation,
    ) -> Result<Option<EntitySnapshot>, ExecutorError>;
}

/// Accessor backed by an in-process map.
#[derive(Debug, Default)]
pub struct InMemoryEntityAccessor {
    records: RwLock<HashMap<(String, i64), EntitySnapshot>>,
}

impl InMemoryEntityAccessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) a snapshot of `entity`. Records without a
    /// primary key are ignored.
    pub fn put(&self, entity: &dyn Signable) {
        let Some(record_id) = entity.record_id() else {
            debug!(table = entity.table_name(), "ignoring record without primary key");
            return;
        };
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (entity.table_name().to_string(), record_id),
                EntitySnapshot::capture(entity),
            );
    }

    /// Removes a record. Returns `true` if it was present.
    pub fn remove(&self, table: &str, record_id: i64) -> bool {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(table.to_string(), record_id))
            .is_some()
    }
}

#[async_trait]
impl EntityAccessor for InMemoryEntityAccessor {
    async fn load(
        &self,
        table: &str,
        record_id: i64,
        cancel: &Cancellation,
    ) -> Result<Option<EntitySnapshot>, ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(table.to_string(), record_id))
            .cloned())
    }
}

/// Accessor that reads the built-in entity kinds from their tables.
pub struct TableEntityAccessor {
    executor: Arc<dyn RelationalExecutor>,
}

impl std::fmt::Debug for TableEntityAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableEntityAccessor").finish_non_exhaustive()
    }
}

impl TableEntityAccessor {
    #[must_use]
    pub fn new(executor: Arc<dyn RelationalExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl EntityAccessor for TableEntityAccessor {
    async fn load(
        &self,
        table: &str,
        record_id: i64,
        cancel: &Cancellation,
    ) -> Result<Option<EntitySnapshot>, ExecutorError> {
        let Some(kind) = kind_for_table(table) else {
            warn!(table, record_id, "no entity kind registered for table");
            return Ok(None);
        };

        // Table and column names come from the static kind registry.
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = :record_id",
            kind.fields.join(", "),
            kind.table,
            kind.key
        );
        let rows = self
            .executor
            .execute_select(&sql, &Params::new().with(":record_id", record_id), cancel)
            .await?;

        Ok(rows.first().map(|row| {
            let values = kind.fields.iter().map(|name| row.get_text(name));
            EntitySnapshot::new(kind.table, Some(record_id), kind.bind(values))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Machine, Part};
    use crate::executor::sqlite::SqliteExecutor;
    use crate::schema::{self, SchemaGeneration};

    #[tokio::test]
    async fn in_memory_put_load_remove() {
        let accessor = InMemoryEntityAccessor::new();
        accessor.put(&Machine::new(7, "MX-7"));
        let cancel = Cancellation::new();

        let loaded = accessor.load("machines", 7, &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.field("code"), Some("MX-7"));
        assert!(accessor.load("parts", 7, &cancel).await.unwrap().is_none());

        assert!(accessor.remove("machines", 7));
        assert!(accessor.load("machines", 7, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn table_accessor_matches_typed_record() {
        let exec = SqliteExecutor::in_memory(SchemaGeneration::Current).unwrap();
        {
            let conn = exec.connection();
            let conn = conn.lock().unwrap();
            schema::install_entity_tables(&conn).unwrap();
            conn.execute(
                "INSERT INTO parts (id, code, name) VALUES (12, 'P-12', NULL)",
                [],
            )
            .unwrap();
        }
        let accessor = TableEntityAccessor::new(Arc::new(exec));
        let cancel = Cancellation::new();

        let loaded = accessor.load("parts", 12, &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.canonical_fields(), Part::new(12, "P-12").canonical_fields());
        assert!(accessor.load("parts", 13, &cancel).await.unwrap().is_none());
        assert!(accessor.load("work_orders", 1, &cancel).await.unwrap().is_none());
    }
}
