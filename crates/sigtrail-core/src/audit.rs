//! Append-only audit events.
//!
//! Events go to `system_event_log` through a [`SchemaAdaptiveExecutor`].
//! On the current schema the signature reference lands in
//! `digital_signature_id` / `digital_signature`; on the legacy schema those
//! columns do not exist and the values are folded into `description` as
//! `sigId=<id> sigHash=<hash>`. Reads recover exactly what the writer folded
//! (see [`unfold_signature`]), so an event carries a signature reference on
//! either generation only if one was written with it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::adaptive::{
    FoldedParam, SchemaAdaptiveExecutor, SchemaLevel, VersionedStatement,
};
use crate::executor::{ExecutorError, Params, RelationalExecutor, Row};
use crate::payload::{canonical_timestamp, parse_canonical_timestamp};
use crate::session::SessionContext;

/// Table holding audit events.
pub const AUDIT_TABLE: &str = "system_event_log";

/// A signature was created.
pub const SIG_CREATE: &str = "SIG_CREATE";
/// A signature was revoked.
pub const SIG_REVOKE: &str = "SIG_REVOKE";
/// Verification found a signature that is not valid.
pub const SIG_VERIFY_FAIL: &str = "SIG_VERIFY_FAIL";
/// Verification succeeded (only written when enabled in config).
pub const SIG_VERIFY_OK: &str = "SIG_VERIFY_OK";

const SIG_ID_LABEL: &str = "sigId";
const SIG_HASH_LABEL: &str = "sigHash";

const SIGNATURE_FOLDS: &[FoldedParam] = &[
    FoldedParam {
        param: ":signature_id",
        label: SIG_ID_LABEL,
    },
    FoldedParam {
        param: ":signature_hash",
        label: SIG_HASH_LABEL,
    },
];

const INSERT_EVENT: VersionedStatement = VersionedStatement {
    name: "audit.insert",
    preferred: "INSERT INTO system_event_log \
         (event_time, user_id, event_type, table_name, related_module, record_id, field_name, \
          old_value, new_value, description, source_ip, device_info, session_id, severity, \
          digital_signature_id, digital_signature) \
         VALUES (:event_time, :user_id, :event_type, :table_name, :module, :record_id, \
          :field_name, :old_value, :new_value, :description, :ip_address, :device_info, \
          :session_id, :severity, :signature_id, :signature_hash) \
         RETURNING id",
    fallbacks: &[SchemaLevel {
        sql: "INSERT INTO system_event_log \
             (event_time, user_id, event_type, table_name, related_module, record_id, field_name, \
              old_value, new_value, description, source_ip, device_info, session_id, severity) \
             VALUES (:event_time, :user_id, :event_type, :table_name, :module, :record_id, \
              :field_name, :old_value, :new_value, :description, :ip_address, :device_info, \
              :session_id, :severity) \
             RETURNING id",
        omits: SIGNATURE_FOLDS,
    }],
    fold_into: ":description",
};

const SELECT_RECENT: VersionedStatement = VersionedStatement {
    name: "audit.recent",
    preferred: "SELECT id, event_time, user_id, event_type, table_name, related_module, \
         record_id, field_name, old_value, new_value, description, source_ip, device_info, \
         session_id, severity, digital_signature_id, digital_signature \
         FROM system_event_log ORDER BY id DESC LIMIT :limit",
    fallbacks: &[SchemaLevel {
        sql: "SELECT id, event_time, user_id, event_type, table_name, related_module, \
             record_id, field_name, old_value, new_value, description, source_ip, device_info, \
             session_id, severity \
             FROM system_event_log ORDER BY id DESC LIMIT :limit",
        omits: &[],
    }],
    fold_into: ":description",
};

const SELECT_FOR_RECORD: VersionedStatement = VersionedStatement {
    name: "audit.for_record",
    preferred: "SELECT id, event_time, user_id, event_type, table_name, related_module, \
         record_id, field_name, old_value, new_value, description, source_ip, device_info, \
         session_id, severity, digital_signature_id, digital_signature \
         FROM system_event_log WHERE table_name = :table_name AND record_id = :record_id \
         ORDER BY id DESC",
    fallbacks: &[SchemaLevel {
        sql: "SELECT id, event_time, user_id, event_type, table_name, related_module, \
             record_id, field_name, old_value, new_value, description, source_ip, device_info, \
             session_id, severity \
             FROM system_event_log WHERE table_name = :table_name AND record_id = :record_id \
             ORDER BY id DESC",
        omits: &[],
    }],
    fold_into: ":description",
};

// On the legacy schema the reference only exists inside the description,
// either as the whole text or as a trailing bracketed suffix. LIKE narrows
// the candidates; `for_signature` keeps only rows that unfold to the id.
const SELECT_FOR_SIGNATURE: VersionedStatement = VersionedStatement {
    name: "audit.for_signature",
    preferred: "SELECT id, event_time, user_id, event_type, table_name, related_module, \
         record_id, field_name, old_value, new_value, description, source_ip, device_info, \
         session_id, severity, digital_signature_id, digital_signature \
         FROM system_event_log WHERE digital_signature_id = :signature_id \
         ORDER BY id DESC",
    fallbacks: &[SchemaLevel {
        sql: "SELECT id, event_time, user_id, event_type, table_name, related_module, \
             record_id, field_name, old_value, new_value, description, source_ip, device_info, \
             session_id, severity \
             FROM system_event_log \
             WHERE description = 'sigId=' || :signature_id \
                OR description LIKE 'sigId=' || :signature_id || ' sigHash=%' \
                OR description LIKE '% [sigId=' || :signature_id || ']' \
                OR description LIKE '% [sigId=' || :signature_id || ' sigHash=%]' \
             ORDER BY id DESC",
        omits: &[],
    }],
    fold_into: ":description",
};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(EngineError::validation(
                "severity",
                format!("unknown severity '{s}'"),
            )),
        }
    }
}

/// One audit row.
///
/// Only `event_type` and `table_name` are required. Events read back from
/// storage have `id`, `severity` and `timestamp` set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuditEvent {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub event_type: String,
    pub table_name: String,
    pub module: Option<String>,
    pub record_id: Option<i64>,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub description: Option<String>,
    pub ip_address: Option<String>,
    pub severity: Option<Severity>,
    pub device_info: Option<String>,
    pub session_id: Option<String>,
    pub signature_id: Option<i64>,
    pub signature_hash: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    /// Copies user, session, device and address from the acting context.
    #[must_use]
    pub fn with_context(mut self, ctx: &SessionContext) -> Self {
        self.user_id = Some(ctx.user_id);
        self.session_id.clone_from(&ctx.session_id);
        self.device_info.clone_from(&ctx.device_info);
        self.ip_address.clone_from(&ctx.ip_address);
        self
    }

    #[must_use]
    pub const fn with_record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// References a signature.
    #[must_use]
    pub fn with_signature(mut self, signature_id: i64, signature_hash: impl Into<String>) -> Self {
        self.signature_id = Some(signature_id);
        self.signature_hash = Some(signature_hash.into());
        self
    }

    /// Records a single field change.
    #[must_use]
    pub fn with_field_change(
        mut self,
        field: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        self.field_name = Some(field.into());
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn from_row(row: &Row) -> Result<Self, EngineError> {
        let id = row.get_i64("id");
        let corrupt = |column: &str| {
            EngineError::Storage(ExecutorError::Storage(format!(
                "{AUDIT_TABLE} row {id:?} has a missing or invalid {column}"
            )))
        };

        let timestamp = row
            .get_text("event_time")
            .map(|t| parse_canonical_timestamp(&t))
            .transpose()
            .map_err(|_| corrupt("event_time"))?;
        let severity = row
            .get_text("severity")
            .map(|s| s.parse::<Severity>())
            .transpose()
            .map_err(|_| corrupt("severity"))?;

        let description = row.get_text("description");
        let (mut signature_id, mut signature_hash) = (
            row.get_i64("digital_signature_id"),
            row.get_text("digital_signature"),
        );
        if row.get("digital_signature_id").is_none() {
            let (folded_id, folded_hash) = unfold_signature(description.as_deref());
            signature_id = folded_id;
            signature_hash = folded_hash;
        }

        Ok(Self {
            id,
            user_id: row.get_i64("user_id"),
            event_type: row.get_text("event_type").ok_or_else(|| corrupt("event_type"))?,
            table_name: row.get_text("table_name").ok_or_else(|| corrupt("table_name"))?,
            module: row.get_text("related_module"),
            record_id: row.get_i64("record_id"),
            field_name: row.get_text("field_name"),
            old_value: row.get_text("old_value"),
            new_value: row.get_text("new_value"),
            description,
            ip_address: row.get_text("source_ip"),
            severity,
            device_info: row.get_text("device_info"),
            session_id: row.get_text("session_id"),
            signature_id,
            signature_hash,
            timestamp,
        })
    }
}

/// Recovers `sigId=` / `sigHash=` pairs folded into a description.
///
/// Only the exact shapes the writer produces are recognised: the whole
/// description, or a trailing ` [..]` suffix, consisting of nothing but
/// `sigId=<id>`, `sigHash=<hash>` or both in that order. Anything else,
/// including such tokens inside free text, yields `(None, None)`.
#[must_use]
pub fn unfold_signature(description: Option<&str>) -> (Option<i64>, Option<String>) {
    let Some(text) = description else {
        return (None, None);
    };
    let folded = match text.rfind(" [") {
        Some(start) if text.ends_with(']') => &text[start + 2..text.len() - 1],
        _ => text,
    };
    parse_folded(folded).unwrap_or((None, None))
}

fn parse_folded(folded: &str) -> Option<(Option<i64>, Option<String>)> {
    let id = |token: &str| {
        token
            .strip_prefix("sigId=")
            .and_then(|v| v.parse::<i64>().ok())
    };
    let hash = |token: &str| {
        token
            .strip_prefix("sigHash=")
            .filter(|h| !h.is_empty())
            .map(str::to_string)
    };
    match folded.split(' ').collect::<Vec<_>>().as_slice() {
        [a, b] => Some((Some(id(*a)?), Some(hash(*b)?))),
        [a] => id(*a)
            .map(|i| (Some(i), None))
            .or_else(|| hash(*a).map(|h| (None, Some(h)))),
        _ => None,
    }
}

/// Writes and reads audit events.
#[derive(Debug, Clone)]
pub struct AuditEventWriter {
    executor: Arc<SchemaAdaptiveExecutor>,
    default_severity: Severity,
    default_module: Option<String>,
}

impl AuditEventWriter {
    /// Creates a writer with its own capability cache.
    #[must_use]
    pub fn new(executor: Arc<dyn RelationalExecutor>, config: &EngineConfig) -> Self {
        Self::with_adaptive(
            Arc::new(SchemaAdaptiveExecutor::new(
                executor,
                config.schema.cache_negotiated_capability,
            )),
            config,
        )
    }

    /// Creates a writer over an existing adaptive executor, sharing its
    /// capability cache.
    #[must_use]
    pub fn with_adaptive(executor: Arc<SchemaAdaptiveExecutor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            default_severity: config.audit.default_severity,
            default_module: config.audit.default_module.clone(),
        }
    }

    /// Schema level the insert statement has negotiated: 0 for the current
    /// schema, 1 once it has fallen back to the legacy one.
    #[must_use]
    pub fn schema_level(&self) -> usize {
        self.executor.negotiated_level(INSERT_EVENT.name)
    }

    /// Appends an event and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if `event_type` or `table_name`
    /// is empty, [`EngineError::Storage`] if the insert fails on every
    /// schema level, or [`EngineError::Cancelled`].
    pub async fn write(&self, event: &AuditEvent, cancel: &Cancellation) -> Result<i64, EngineError> {
        if event.event_type.trim().is_empty() {
            return Err(EngineError::validation("event_type", "audit event"));
        }
        if event.table_name.trim().is_empty() {
            return Err(EngineError::validation("table_name", "audit event"));
        }

        let timestamp = event.timestamp.unwrap_or_else(Utc::now);
        let severity = event.severity.unwrap_or(self.default_severity);
        let module = event.module.clone().or_else(|| self.default_module.clone());

        let params = Params::new()
            .with(":event_time", canonical_timestamp(&timestamp))
            .with(":user_id", event.user_id)
            .with(":event_type", event.event_type.as_str())
            .with(":table_name", event.table_name.as_str())
            .with(":module", module)
            .with(":record_id", event.record_id)
            .with(":field_name", event.field_name.clone())
            .with(":old_value", event.old_value.clone())
            .with(":new_value", event.new_value.clone())
            .with(":description", event.description.clone())
            .with(":ip_address", event.ip_address.clone())
            .with(":device_info", event.device_info.clone())
            .with(":session_id", event.session_id.clone())
            .with(":severity", severity.as_str())
            .with(":signature_id", event.signature_id)
            .with(":signature_hash", event.signature_hash.clone());

        let id = self
            .executor
            .execute_with_fallback(&INSERT_EVENT, params, cancel)
            .await?
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                EngineError::Storage(ExecutorError::Storage(
                    "audit insert returned no id".to_string(),
                ))
            })?;

        debug!(
            event_id = id,
            event_type = %event.event_type,
            table = %event.table_name,
            severity = %severity,
            "audit event written"
        );
        Ok(id)
    }

    /// Most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] or [`EngineError::Cancelled`].
    pub async fn recent(&self, limit: u32, cancel: &Cancellation) -> Result<Vec<AuditEvent>, EngineError> {
        let params = Params::new().with(":limit", i64::from(limit));
        self.select(&SELECT_RECENT, params, cancel).await
    }

    /// Events about one business record, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] or [`EngineError::Cancelled`].
    pub async fn for_record(
        &self,
        table: &str,
        record_id: i64,
        cancel: &Cancellation,
    ) -> Result<Vec<AuditEvent>, EngineError> {
        let params = Params::new()
            .with(":table_name", table)
            .with(":record_id", record_id);
        self.select(&SELECT_FOR_RECORD, params, cancel).await
    }

    /// Events referencing a signature, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] or [`EngineError::Cancelled`].
    pub async fn for_signature(
        &self,
        signature_id: i64,
        cancel: &Cancellation,
    ) -> Result<Vec<AuditEvent>, EngineError> {
        let params = Params::new().with(":signature_id", signature_id);
        let mut events = self.select(&SELECT_FOR_SIGNATURE, params, cancel).await?;
        events.retain(|e| e.signature_id == Some(signature_id));
        Ok(events)
    }

    async fn select(
        &self,
        stmt: &VersionedStatement,
        params: Params,
        cancel: &Cancellation,
    ) -> Result<Vec<AuditEvent>, EngineError> {
        let (level, rows) = self.executor.select_with_fallback(stmt, params, cancel).await?;
        debug!(statement = stmt.name, level, rows = rows.len(), "audit events read");
        rows.iter().map(AuditEvent::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::sqlite::SqliteExecutor;
    use crate::schema::SchemaGeneration;

    fn writer(generation: SchemaGeneration) -> AuditEventWriter {
        let exec = Arc::new(SqliteExecutor::in_memory(generation).unwrap());
        AuditEventWriter::new(exec, &EngineConfig::default())
    }

    #[test]
    fn unfold_handles_both_shapes() {
        assert_eq!(
            unfold_signature(Some("sigId=777 sigHash=ABC123")),
            (Some(777), Some("ABC123".into()))
        );
        assert_eq!(
            unfold_signature(Some("signature revoked [sigId=5 sigHash=a+b/c=]")),
            (Some(5), Some("a+b/c=".into()))
        );
        assert_eq!(unfold_signature(Some("sigId=9")), (Some(9), None));
        assert_eq!(unfold_signature(Some("plain text")), (None, None));
        assert_eq!(unfold_signature(None), (None, None));
    }

    #[test]
    fn free_text_does_not_unfold() {
        for text in [
            "operator typed sigId=5 sigHash=FAKE",
            "sigId=5 sigHash=FAKE and more",
            "note [see sigId=5 sigHash=FAKE] later",
            "sigHash=FAKE sigId=5",
            "sigId=five",
            "[sigId=5 sigHash=FAKE]",
        ] {
            assert_eq!(unfold_signature(Some(text)), (None, None), "{text}");
        }
    }

    #[tokio::test]
    async fn legacy_reads_ignore_references_typed_by_users() {
        let writer = writer(SchemaGeneration::Legacy);
        let cancel = Cancellation::new();
        writer
            .write(
                &AuditEvent::new("NOTE", "machines")
                    .with_description("operator typed sigId=5 sigHash=FAKE"),
                &cancel,
            )
            .await
            .unwrap();
        writer
            .write(
                &AuditEvent::new(SIG_REVOKE, "digital_signatures")
                    .with_description("signature revoked: reason=dup of sigId=5 sigHash=X [sigId=6 sigHash=H6]"),
                &cancel,
            )
            .await
            .unwrap();

        let recent = writer.recent(10, &cancel).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].signature_id, None);
        assert_eq!(recent[0].signature_id, Some(6));

        assert!(writer.for_signature(5, &cancel).await.unwrap().is_empty());
        assert_eq!(writer.for_signature(6, &cancel).await.unwrap().len(), 1);
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("loud".parse::<Severity>().is_err());
    }

    #[tokio::test]
    async fn write_applies_defaults() {
        let writer = writer(SchemaGeneration::Current);
        let cancel = Cancellation::new();

        let id = writer
            .write(&AuditEvent::new("LOGIN", "users"), &cancel)
            .await
            .unwrap();
        let events = writer.recent(10, &cancel).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, Some(id));
        assert_eq!(events[0].severity, Some(Severity::Info));
        assert_eq!(events[0].module.as_deref(), Some("signatures"));
        assert!(events[0].timestamp.is_some());
        assert_eq!(writer.schema_level(), 0);
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let writer = writer(SchemaGeneration::Current);
        let err = writer
            .write(&AuditEvent::new(" ", "users"), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "event_type"));
    }

    #[tokio::test]
    async fn legacy_schema_folds_and_recovers_signature() {
        let writer = writer(SchemaGeneration::Legacy);
        let cancel = Cancellation::new();
        let event = AuditEvent::new(SIG_CREATE, "machines")
            .with_record(7)
            .with_description("signature created")
            .with_signature(777, "ABC123");

        writer.write(&event, &cancel).await.unwrap();
        assert_eq!(writer.schema_level(), 1);

        let events = writer.for_signature(777, &cancel).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].description.as_deref(),
            Some("signature created [sigId=777 sigHash=ABC123]")
        );
        assert_eq!(events[0].signature_id, Some(777));
        assert_eq!(events[0].signature_hash.as_deref(), Some("ABC123"));

        assert!(writer.for_signature(77, &cancel).await.unwrap().is_empty());
        assert_eq!(writer.for_record("machines", 7, &cancel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn current_schema_uses_dedicated_columns() {
        let writer = writer(SchemaGeneration::Current);
        let cancel = Cancellation::new();
        writer
            .write(
                &AuditEvent::new(SIG_CREATE, "machines").with_signature(1, "H"),
                &cancel,
            )
            .await
            .unwrap();

        let events = writer.for_signature(1, &cancel).await.unwrap();
        assert_eq!(events[0].description, None);
        assert_eq!(events[0].signature_hash.as_deref(), Some("H"));
    }
}
