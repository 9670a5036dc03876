//! Signature persistence.
//!
//! Rows in `digital_signatures` are inserted once and only ever change
//! through [`SignatureStore::revoke`], which flips `status` from `valid` to
//! `revoked` with a conditional update. The hash column is immutable.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::error::EngineError;
use crate::executor::{ExecutorError, Params, RelationalExecutor, Row};
use crate::payload::{canonical_timestamp, parse_canonical_timestamp};

/// Table holding signature records.
pub const SIGNATURE_TABLE: &str = "digital_signatures";

const INSERT_SQL: &str = "INSERT INTO digital_signatures \
     (table_name, record_id, user_id, signature_hash, method, status, signed_at, \
      device_info, ip_address, session_id, note) \
     VALUES (:table_name, :record_id, :user_id, :signature_hash, :method, 'valid', :signed_at, \
      :device_info, :ip_address, :session_id, :note) \
     RETURNING id";

const SELECT_COLUMNS: &str = "id, table_name, record_id, user_id, signature_hash, method, status, \
     signed_at, device_info, ip_address, session_id, note";

const REVOKE_SQL: &str = "UPDATE digital_signatures \
     SET status = 'revoked', note = :reason \
     WHERE id = :id AND status = 'valid'";

/// Lifecycle state of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    Revoked,
}

impl SignatureStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "revoked" => Ok(Self::Revoked),
            other => Err(EngineError::validation(
                "status",
                format!("unknown signature status '{other}'"),
            )),
        }
    }
}

/// A persisted signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub id: i64,
    pub table_name: String,
    pub record_id: i64,
    pub user_id: i64,
    pub signature_hash: String,
    pub method: String,
    pub status: SignatureStatus,
    pub signed_at: DateTime<Utc>,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    pub note: Option<String>,
}

impl SignatureRecord {
    /// Returns `true` while the signature has not been revoked.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == SignatureStatus::Valid
    }

    fn from_row(row: &Row) -> Result<Self, EngineError> {
        let required_text = |column: &str| {
            row.get_text(column).ok_or_else(|| corrupt_row(row, column))
        };
        let required_i64 = |column: &str| row.get_i64(column).ok_or_else(|| corrupt_row(row, column));

        let signed_at = parse_canonical_timestamp(&required_text("signed_at")?)
            .map_err(|_| corrupt_row(row, "signed_at"))?;
        let status: SignatureStatus = required_text("status")?
            .parse()
            .map_err(|_| corrupt_row(row, "status"))?;

        Ok(Self {
            id: required_i64("id")?,
            table_name: required_text("table_name")?,
            record_id: required_i64("record_id")?,
            user_id: required_i64("user_id")?,
            signature_hash: required_text("signature_hash")?,
            method: required_text("method")?,
            status,
            signed_at,
            device_info: row.get_text("device_info"),
            ip_address: row.get_text("ip_address"),
            session_id: row.get_text("session_id"),
            note: row.get_text("note"),
        })
    }
}

fn corrupt_row(row: &Row, column: &str) -> EngineError {
    EngineError::Storage(ExecutorError::Storage(format!(
        "{SIGNATURE_TABLE} row {:?} has a missing or invalid {column}",
        row.get_i64("id")
    )))
}

/// A signature about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSignature {
    pub table_name: String,
    pub record_id: i64,
    pub user_id: i64,
    pub signature_hash: String,
    pub method: String,
    pub signed_at: DateTime<Utc>,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    pub note: Option<String>,
}

impl NewSignature {
    /// The record this becomes once stored under `id`.
    #[must_use]
    pub fn into_record(self, id: i64) -> SignatureRecord {
        SignatureRecord {
            id,
            table_name: self.table_name,
            record_id: self.record_id,
            user_id: self.user_id,
            signature_hash: self.signature_hash,
            method: self.method,
            status: SignatureStatus::Valid,
            signed_at: self.signed_at,
            device_info: self.device_info,
            ip_address: self.ip_address,
            session_id: self.session_id,
            note: self.note,
        }
    }
}

/// Result of a revoke call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// This call moved the signature to `revoked`.
    Revoked,
    /// The signature was already revoked; nothing changed.
    AlreadyRevoked,
}

/// Reads and writes `digital_signatures`.
#[derive(Clone)]
pub struct SignatureStore {
    executor: Arc<dyn RelationalExecutor>,
}

impl fmt::Debug for SignatureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureStore").finish_non_exhaustive()
    }
}

impl SignatureStore {
    #[must_use]
    pub fn new(executor: Arc<dyn RelationalExecutor>) -> Self {
        Self { executor }
    }

    /// Inserts a signature and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the table name, hash or method
    /// is empty, [`EngineError::Storage`] if the insert fails, or
    /// [`EngineError::Cancelled`].
    pub async fn insert(
        &self,
        signature: &NewSignature,
        cancel: &Cancellation,
    ) -> Result<i64, EngineError> {
        for (field, value) in [
            ("table_name", &signature.table_name),
            ("signature_hash", &signature.signature_hash),
            ("method", &signature.method),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(field, "signature insert"));
            }
        }

        let params = Params::new()
            .with(":table_name", signature.table_name.as_str())
            .with(":record_id", signature.record_id)
            .with(":user_id", signature.user_id)
            .with(":signature_hash", signature.signature_hash.as_str())
            .with(":method", signature.method.as_str())
            .with(":signed_at", canonical_timestamp(&signature.signed_at))
            .with(":device_info", signature.device_info.clone())
            .with(":ip_address", signature.ip_address.clone())
            .with(":session_id", signature.session_id.clone())
            .with(":note", signature.note.clone());

        let id = self
            .executor
            .execute_scalar(INSERT_SQL, &params, cancel)
            .await?
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                EngineError::Storage(ExecutorError::Storage(
                    "signature insert returned no id".to_string(),
                ))
            })?;

        debug!(
            signature_id = id,
            table = %signature.table_name,
            record_id = signature.record_id,
            "signature stored"
        );
        Ok(id)
    }

    /// Fetches a signature by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the query fails or the row is
    /// malformed, or [`EngineError::Cancelled`].
    pub async fn find_by_id(
        &self,
        id: i64,
        cancel: &Cancellation,
    ) -> Result<Option<SignatureRecord>, EngineError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM digital_signatures WHERE id = :id");
        let rows = self
            .executor
            .execute_select(&sql, &Params::new().with(":id", id), cancel)
            .await?;
        rows.first().map(SignatureRecord::from_row).transpose()
    }

    /// Fetches a signature by id, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id, otherwise as
    /// [`Self::find_by_id`].
    pub async fn get_by_id(
        &self,
        id: i64,
        cancel: &Cancellation,
    ) -> Result<SignatureRecord, EngineError> {
        self.find_by_id(id, cancel)
            .await?
            .ok_or(EngineError::NotFound { signature_id: id })
    }

    /// Most recent signature for a record, if any.
    ///
    /// # Errors
    ///
    /// As [`Self::find_by_id`].
    pub async fn get_latest_for(
        &self,
        table: &str,
        record_id: i64,
        cancel: &Cancellation,
    ) -> Result<Option<SignatureRecord>, EngineError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM digital_signatures \
             WHERE table_name = :table_name AND record_id = :record_id \
             ORDER BY id DESC LIMIT 1"
        );
        let params = Params::new()
            .with(":table_name", table)
            .with(":record_id", record_id);
        let rows = self.executor.execute_select(&sql, &params, cancel).await?;
        rows.first().map(SignatureRecord::from_row).transpose()
    }

    /// All signatures for a record, newest first.
    ///
    /// # Errors
    ///
    /// As [`Self::find_by_id`].
    pub async fn list_for(
        &self,
        table: &str,
        record_id: i64,
        cancel: &Cancellation,
    ) -> Result<Vec<SignatureRecord>, EngineError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM digital_signatures \
             WHERE table_name = :table_name AND record_id = :record_id \
             ORDER BY id DESC"
        );
        let params = Params::new()
            .with(":table_name", table)
            .with(":record_id", record_id);
        self.executor
            .execute_select(&sql, &params, cancel)
            .await?
            .iter()
            .map(SignatureRecord::from_row)
            .collect()
    }

    /// Every stored signature, newest first.
    ///
    /// # Errors
    ///
    /// As [`Self::find_by_id`].
    pub async fn list_all(&self, cancel: &Cancellation) -> Result<Vec<SignatureRecord>, EngineError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM digital_signatures ORDER BY id DESC");
        self.executor
            .execute_select(&sql, &Params::new(), cancel)
            .await?
            .iter()
            .map(SignatureRecord::from_row)
            .collect()
    }

    /// Revokes a signature, storing `reason` in its note.
    ///
    /// Only a `valid` row is updated, so of two concurrent calls exactly one
    /// observes [`RevokeOutcome::Revoked`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for an empty reason,
    /// [`EngineError::NotFound`] for an unknown id, otherwise as
    /// [`Self::find_by_id`].
    pub async fn revoke(
        &self,
        id: i64,
        reason: &str,
        actor_user_id: i64,
        cancel: &Cancellation,
    ) -> Result<RevokeOutcome, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::validation("reason", "signature revoke"));
        }

        let params = Params::new().with(":id", id).with(":reason", reason);
        let affected = self
            .executor
            .execute_non_query(REVOKE_SQL, &params, cancel)
            .await?;

        if affected > 0 {
            info!(signature_id = id, actor = actor_user_id, reason, "signature revoked");
            return Ok(RevokeOutcome::Revoked);
        }

        // Zero rows: either the id is unknown or another caller got there first.
        if self.find_by_id(id, cancel).await?.is_none() {
            return Err(EngineError::NotFound { signature_id: id });
        }
        debug!(signature_id = id, actor = actor_user_id, "signature already revoked");
        Ok(RevokeOutcome::AlreadyRevoked)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::executor::sqlite::SqliteExecutor;
    use crate::schema::SchemaGeneration;

    fn store() -> SignatureStore {
        SignatureStore::new(Arc::new(
            SqliteExecutor::in_memory(SchemaGeneration::Current).unwrap(),
        ))
    }

    fn new_signature(record_id: i64) -> NewSignature {
        NewSignature {
            table_name: "machines".into(),
            record_id,
            user_id: 42,
            signature_hash: "H".repeat(44),
            method: "pin".into(),
            signed_at: Utc.timestamp_opt(1_700_000_000, 5_000).unwrap(),
            device_info: Some("Device-A".into()),
            ip_address: None,
            session_id: Some("sess-1".into()),
            note: None,
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_preserves_fields() {
        let store = store();
        let cancel = Cancellation::new();
        let new = new_signature(7);

        let id = store.insert(&new, &cancel).await.unwrap();
        let fetched = store.get_by_id(id, &cancel).await.unwrap();

        assert_eq!(fetched, new.into_record(id));
        assert!(fetched.is_valid());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = store();
        let cancel = Cancellation::new();

        assert!(store.find_by_id(99, &cancel).await.unwrap().is_none());
        assert!(matches!(
            store.get_by_id(99, &cancel).await,
            Err(EngineError::NotFound { signature_id: 99 })
        ));
        assert!(matches!(
            store.revoke(99, "typo", 1, &cancel).await,
            Err(EngineError::NotFound { signature_id: 99 })
        ));
    }

    #[tokio::test]
    async fn latest_and_list_are_newest_first() {
        let store = store();
        let cancel = Cancellation::new();
        let first = store.insert(&new_signature(7), &cancel).await.unwrap();
        let second = store.insert(&new_signature(7), &cancel).await.unwrap();
        store.insert(&new_signature(8), &cancel).await.unwrap();

        let latest = store.get_latest_for("machines", 7, &cancel).await.unwrap();
        assert_eq!(latest.map(|r| r.id), Some(second));

        let ids: Vec<_> = store
            .list_for("machines", 7, &cancel)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![second, first]);
        assert!(store.get_latest_for("parts", 7, &cancel).await.unwrap().is_none());

        let all: Vec<_> = store
            .list_all(&cancel)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.record_id))
            .collect();
        assert_eq!(all, vec![(second + 1, 8), (second, 7), (first, 7)]);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = store();
        let cancel = Cancellation::new();
        let id = store.insert(&new_signature(7), &cancel).await.unwrap();

        assert_eq!(
            store.revoke(id, "wrong record", 1, &cancel).await.unwrap(),
            RevokeOutcome::Revoked
        );
        assert_eq!(
            store.revoke(id, "again", 1, &cancel).await.unwrap(),
            RevokeOutcome::AlreadyRevoked
        );

        let record = store.get_by_id(id, &cancel).await.unwrap();
        assert_eq!(record.status, SignatureStatus::Revoked);
        assert_eq!(record.note.as_deref(), Some("wrong record"));
    }

    #[tokio::test]
    async fn empty_fields_are_rejected() {
        let store = store();
        let mut new = new_signature(7);
        new.method = "  ".into();

        let err = store.insert(&new, &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "method"));
    }

    #[test]
    fn status_parses() {
        assert_eq!("revoked".parse::<SignatureStatus>().unwrap(), SignatureStatus::Revoked);
        assert!("expired".parse::<SignatureStatus>().is_err());
    }
}
