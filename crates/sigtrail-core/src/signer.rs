//! Sign and revoke workflows.
//!
//! Signing and its `SIG_CREATE` event are two separate writes. If the audit
//! write fails the signature row stays and the error is returned, so callers
//! know the trail is incomplete.

use chrono::Utc;
use tracing::{error, info};

use crate::audit::{AuditEvent, AuditEventWriter, SIG_CREATE, SIG_REVOKE, Severity};
use crate::cancel::Cancellation;
use crate::digest::SignatureComputer;
use crate::entity::Signable;
use crate::error::EngineError;
use crate::payload::{CanonicalPayloadBuilder, normalize_timestamp};
use crate::session::{SessionContext, SessionContextProvider};
use crate::store::{NewSignature, RevokeOutcome, SIGNATURE_TABLE, SignatureRecord, SignatureStore};

/// Creates and revokes signatures.
#[derive(Debug, Clone)]
pub struct SignatureService {
    store: SignatureStore,
    writer: AuditEventWriter,
}

impl SignatureService {
    #[must_use]
    pub const fn new(store: SignatureStore, writer: AuditEventWriter) -> Self {
        Self { store, writer }
    }

    /// Signs `entity` as the user in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if `method` is empty or the
    /// entity lacks an identity field, [`EngineError::Storage`] if either
    /// write fails, or [`EngineError::Cancelled`].
    pub async fn sign(
        &self,
        entity: &dyn Signable,
        ctx: &SessionContext,
        method: &str,
        note: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<SignatureRecord, EngineError> {
        if method.trim().is_empty() {
            return Err(EngineError::validation("method", "signature"));
        }
        let record_id = entity
            .record_id()
            .ok_or_else(|| EngineError::validation("id", format!("{} signature", entity.table_name())))?;

        let signed_at = normalize_timestamp(&Utc::now());
        let payload = CanonicalPayloadBuilder::build_signing_payload(
            entity,
            ctx.user_id,
            ctx.session_id.as_deref(),
            ctx.device_info.as_deref(),
            &signed_at,
        )?;
        let digest = SignatureComputer::compute_signature(&payload);

        let new = NewSignature {
            table_name: entity.table_name().to_string(),
            record_id,
            user_id: ctx.user_id,
            signature_hash: digest.hash,
            method: method.to_string(),
            signed_at,
            device_info: ctx.device_info.clone(),
            ip_address: ctx.ip_address.clone(),
            session_id: ctx.session_id.clone(),
            note: note.map(str::to_string),
        };
        let id = self.store.insert(&new, cancel).await?;
        let record = new.into_record(id);

        let event = AuditEvent::new(SIG_CREATE, record.table_name.clone())
            .with_context(ctx)
            .with_record(record.record_id)
            .with_severity(Severity::Info)
            .with_description(format!("signature created: method={method}"))
            .with_signature(id, record.signature_hash.clone())
            .at(record.signed_at);
        if let Err(e) = self.writer.write(&event, cancel).await {
            error!(signature_id = id, error = %e, "signature stored but SIG_CREATE was not written");
            return Err(e);
        }

        info!(
            signature_id = id,
            table = %record.table_name,
            record_id,
            user_id = ctx.user_id,
            algorithm = digest.algorithm,
            "record signed"
        );
        Ok(record)
    }

    /// Signs `entity` as whoever `provider` says is acting.
    ///
    /// # Errors
    ///
    /// As [`Self::sign`].
    pub async fn sign_current(
        &self,
        entity: &dyn Signable,
        provider: &dyn SessionContextProvider,
        method: &str,
        note: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<SignatureRecord, EngineError> {
        let ctx = provider.current();
        self.sign(entity, &ctx, method, note, cancel).await
    }

    /// Revokes a signature on behalf of `actor`.
    ///
    /// A `SIG_REVOKE` event is written only when this call performed the
    /// revocation; revoking an already revoked signature is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for an empty reason,
    /// [`EngineError::NotFound`] for an unknown id, [`EngineError::Storage`]
    /// or [`EngineError::Cancelled`].
    pub async fn revoke(
        &self,
        signature_id: i64,
        reason: &str,
        actor: &SessionContext,
        cancel: &Cancellation,
    ) -> Result<RevokeOutcome, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::validation("reason", "signature revoke"));
        }
        let record = self.store.get_by_id(signature_id, cancel).await?;
        let outcome = self
            .store
            .revoke(signature_id, reason, actor.user_id, cancel)
            .await?;
        if outcome == RevokeOutcome::AlreadyRevoked {
            return Ok(outcome);
        }

        let event = AuditEvent::new(SIG_REVOKE, SIGNATURE_TABLE)
            .with_context(actor)
            .with_record(signature_id)
            .with_severity(Severity::Warning)
            .with_description(format!(
                "signature revoked: reason={reason} table={} recordId={}",
                record.table_name, record.record_id
            ))
            .with_signature(signature_id, record.signature_hash);
        self.writer.write(&event, cancel).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::entity::{CanonicalField, EntitySnapshot, Machine};
    use crate::executor::sqlite::SqliteExecutor;
    use crate::schema::SchemaGeneration;
    use crate::session::FixedSessionProvider;

    fn service() -> (SignatureService, AuditEventWriter) {
        let exec = Arc::new(SqliteExecutor::in_memory(SchemaGeneration::Current).unwrap());
        let writer = AuditEventWriter::new(exec.clone(), &EngineConfig::default());
        (SignatureService::new(SignatureStore::new(exec), writer.clone()), writer)
    }

    #[tokio::test]
    async fn sign_writes_record_and_event() {
        let (service, writer) = service();
        let cancel = Cancellation::new();
        let ctx = SessionContext::new(42).with_session("sess-1").with_device("Device-A");

        let record = service
            .sign(&Machine::new(7, "MX-7"), &ctx, "pin", Some("release"), &cancel)
            .await
            .unwrap();

        assert_eq!(record.table_name, "machines");
        assert_eq!(record.user_id, 42);
        assert_eq!(record.signature_hash.len(), 44);

        let events = writer.for_signature(record.id, &cancel).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SIG_CREATE);
        assert_eq!(events[0].record_id, Some(7));
        assert_eq!(events[0].session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn sign_current_uses_provider_context() {
        let (service, _) = service();
        let provider = FixedSessionProvider::new(SessionContext::new(5).with_ip("10.0.0.5"));

        let record = service
            .sign_current(&Machine::new(1, "M-1"), &provider, "password", None, &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(record.user_id, 5);
        assert_eq!(record.ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn sign_rejects_missing_key_and_method() {
        let (service, _) = service();
        let cancel = Cancellation::new();
        let ctx = SessionContext::new(1);
        let keyless = EntitySnapshot::new(
            "machines",
            None,
            vec![CanonicalField {
                name: "id",
                value: None,
                required: true,
            }],
        );

        assert!(matches!(
            service.sign(&keyless, &ctx, "pin", None, &cancel).await,
            Err(EngineError::Validation { .. })
        ));
        assert!(matches!(
            service.sign(&Machine::new(1, "M"), &ctx, "", None, &cancel).await,
            Err(EngineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn revoke_writes_event_once() {
        let (service, writer) = service();
        let cancel = Cancellation::new();
        let ctx = SessionContext::new(42);
        let record = service
            .sign(&Machine::new(7, "MX-7"), &ctx, "pin", None, &cancel)
            .await
            .unwrap();

        let admin = SessionContext::new(1);
        assert_eq!(
            service.revoke(record.id, "signed in error", &admin, &cancel).await.unwrap(),
            RevokeOutcome::Revoked
        );
        assert_eq!(
            service.revoke(record.id, "again", &admin, &cancel).await.unwrap(),
            RevokeOutcome::AlreadyRevoked
        );

        let revokes: Vec<_> = writer
            .for_signature(record.id, &cancel)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == SIG_REVOKE)
            .collect();
        assert_eq!(revokes.len(), 1);
        assert_eq!(revokes[0].user_id, Some(1));
    }
}
