//! Signature verification.
//!
//! Verification re-derives the payload from the record's *current* state
//! and the context stored with the signature, then compares hashes. The
//! checks run in a fixed order:
//!
//! 1. signature exists, else [`VerificationOutcome::NotFound`]
//! 2. status is `valid`, else [`VerificationOutcome::Revoked`]
//! 3. the signed record exists, else [`VerificationOutcome::EntityMissing`]
//! 4. the recomputed hash matches, else [`VerificationOutcome::HashMismatch`]
//!
//! Every outcome other than `Valid` writes a `SIG_VERIFY_FAIL` audit event
//! before it is returned. Outcomes are values, not errors: only storage
//! failures and cancellation surface as `Err`.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audit::{
    AuditEvent, AuditEventWriter, SIG_VERIFY_FAIL, SIG_VERIFY_OK, Severity,
};
use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::digest::SignatureComputer;
use crate::entity::EntityAccessor;
use crate::error::EngineError;
use crate::payload::{CanonicalPayloadBuilder, describe_fields};
use crate::session::SessionContext;
use crate::store::{SIGNATURE_TABLE, SignatureRecord, SignatureStore};

/// Why a verification did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    Status,
    EntityMissing,
    HashMismatch,
}

impl FailureReason {
    /// Value written as `reason=` in the audit description.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Status => "status",
            Self::EntityMissing => "entity_missing",
            Self::HashMismatch => "hash_mismatch",
        }
    }

    /// Audit severity for this failure.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::HashMismatch => Severity::Critical,
            Self::NotFound | Self::Status | Self::EntityMissing => Severity::Warning,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of verifying one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The record still matches what was signed.
    Valid { signature_id: i64 },
    /// No signature with this id.
    NotFound { signature_id: i64 },
    /// The signature was revoked.
    Revoked { signature_id: i64 },
    /// The record changed since it was signed.
    HashMismatch { signature_id: i64 },
    /// The signed record no longer exists.
    EntityMissing {
        signature_id: i64,
        table: String,
        record_id: i64,
    },
}

impl VerificationOutcome {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    #[must_use]
    pub const fn signature_id(&self) -> i64 {
        match self {
            Self::Valid { signature_id }
            | Self::NotFound { signature_id }
            | Self::Revoked { signature_id }
            | Self::HashMismatch { signature_id }
            | Self::EntityMissing { signature_id, .. } => *signature_id,
        }
    }

    /// The failure reason, `None` for `Valid`.
    #[must_use]
    pub const fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Valid { .. } => None,
            Self::NotFound { .. } => Some(FailureReason::NotFound),
            Self::Revoked { .. } => Some(FailureReason::Status),
            Self::HashMismatch { .. } => Some(FailureReason::HashMismatch),
            Self::EntityMissing { .. } => Some(FailureReason::EntityMissing),
        }
    }

    /// Converts a non-valid outcome into the matching [`EngineError`].
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Revoked`, `Tampered` or `EntityMissing` for the
    /// corresponding outcome.
    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            Self::Valid { .. } => Ok(()),
            Self::NotFound { signature_id } => Err(EngineError::NotFound { signature_id }),
            Self::Revoked { signature_id } => Err(EngineError::Revoked { signature_id }),
            Self::HashMismatch { signature_id } => Err(EngineError::Tampered { signature_id }),
            Self::EntityMissing {
                table, record_id, ..
            } => Err(EngineError::EntityMissing { table, record_id }),
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure_reason() {
            None => write!(f, "signature {} is valid", self.signature_id()),
            Some(reason) => write!(f, "signature {} failed: {reason}", self.signature_id()),
        }
    }
}

/// Outcome plus what the verifier saw on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub outcome: VerificationOutcome,
    /// The stored signature, when it exists.
    pub record: Option<SignatureRecord>,
    /// Id of the audit event written for this verification, if any.
    pub audit_event_id: Option<i64>,
}

impl VerificationReport {
    /// Returns the signature record when verification succeeded.
    ///
    /// # Errors
    ///
    /// As [`VerificationOutcome::into_result`].
    pub fn into_result(self) -> Result<SignatureRecord, EngineError> {
        let signature_id = self.outcome.signature_id();
        self.outcome.into_result()?;
        self.record.ok_or(EngineError::NotFound { signature_id })
    }
}

/// Verifies stored signatures against current record state.
pub struct SignatureVerifier {
    store: SignatureStore,
    writer: AuditEventWriter,
    accessor: Arc<dyn EntityAccessor>,
    log_successful: bool,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("log_successful", &self.log_successful)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(
        store: SignatureStore,
        writer: AuditEventWriter,
        accessor: Arc<dyn EntityAccessor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            writer,
            accessor,
            log_successful: config.audit.log_successful_verifications,
        }
    }

    /// Verifies a signature without recording who asked.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] or [`EngineError::Cancelled`]. A
    /// cancelled verification writes no audit event.
    pub async fn verify(
        &self,
        signature_id: i64,
        cancel: &Cancellation,
    ) -> Result<VerificationOutcome, EngineError> {
        Ok(self.verify_detailed(signature_id, None, cancel).await?.outcome)
    }

    /// Verifies a signature, recording `ctx` on any audit event written.
    ///
    /// # Errors
    ///
    /// As [`Self::verify`].
    pub async fn verify_as(
        &self,
        signature_id: i64,
        ctx: &SessionContext,
        cancel: &Cancellation,
    ) -> Result<VerificationOutcome, EngineError> {
        Ok(self
            .verify_detailed(signature_id, Some(ctx), cancel)
            .await?
            .outcome)
    }

    /// Verifies a signature and returns the full report.
    ///
    /// # Errors
    ///
    /// As [`Self::verify`].
    pub async fn verify_detailed(
        &self,
        signature_id: i64,
        ctx: Option<&SessionContext>,
        cancel: &Cancellation,
    ) -> Result<VerificationReport, EngineError> {
        let Some(record) = self.store.find_by_id(signature_id, cancel).await? else {
            let outcome = VerificationOutcome::NotFound { signature_id };
            return self.fail(outcome, None, ctx, cancel).await;
        };

        if !record.is_valid() {
            let outcome = VerificationOutcome::Revoked { signature_id };
            return self.fail(outcome, Some(record), ctx, cancel).await;
        }

        let Some(entity) = self
            .accessor
            .load(&record.table_name, record.record_id, cancel)
            .await?
        else {
            let outcome = VerificationOutcome::EntityMissing {
                signature_id,
                table: record.table_name.clone(),
                record_id: record.record_id,
            };
            return self.fail(outcome, Some(record), ctx, cancel).await;
        };

        let payload = match CanonicalPayloadBuilder::build_signing_payload(
            &entity,
            record.user_id,
            record.session_id.as_deref(),
            record.device_info.as_deref(),
            &record.signed_at,
        ) {
            Ok(payload) => Some(payload),
            // The record lost an identity field, so it cannot match.
            Err(EngineError::Validation { field, .. }) => {
                warn!(signature_id, field = %field, "current record is missing an identity field");
                None
            },
            Err(other) => return Err(other),
        };

        let matches = payload
            .as_deref()
            .is_some_and(|p| SignatureComputer::verify_digest(p, &record.signature_hash));
        if !matches {
            debug!(signature_id, current = %describe_fields(&entity), "hash mismatch");
            let outcome = VerificationOutcome::HashMismatch { signature_id };
            return self.fail(outcome, Some(record), ctx, cancel).await;
        }

        let outcome = VerificationOutcome::Valid { signature_id };
        let audit_event_id = if self.log_successful {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let event = self
                .event_for(SIG_VERIFY_OK, Some(&record), signature_id, ctx)
                .with_severity(Severity::Info)
                .with_description(format!("signature verified: signatureId={signature_id}"));
            Some(self.writer.write(&event, cancel).await?)
        } else {
            None
        };

        debug!(signature_id, "signature valid");
        Ok(VerificationReport {
            outcome,
            record: Some(record),
            audit_event_id,
        })
    }

    async fn fail(
        &self,
        outcome: VerificationOutcome,
        record: Option<SignatureRecord>,
        ctx: Option<&SessionContext>,
        cancel: &Cancellation,
    ) -> Result<VerificationReport, EngineError> {
        let Some(reason) = outcome.failure_reason() else {
            return Ok(VerificationReport {
                outcome,
                record,
                audit_event_id: None,
            });
        };
        let signature_id = outcome.signature_id();

        let mut description =
            format!("signature verification failed: reason={reason} signatureId={signature_id}");
        if let Some(r) = &record {
            let _ = write!(description, " table={} recordId={}", r.table_name, r.record_id);
        }

        // Last point at which cancellation is honoured; once the insert is
        // dispatched the event is written.
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let event = self
            .event_for(SIG_VERIFY_FAIL, record.as_ref(), signature_id, ctx)
            .with_severity(reason.severity())
            .with_description(description);
        let event_id = self.writer.write(&event, cancel).await?;

        info!(
            signature_id,
            reason = %reason,
            audit_event_id = event_id,
            "signature verification failed"
        );
        Ok(VerificationReport {
            outcome,
            record,
            audit_event_id: Some(event_id),
        })
    }

    fn event_for(
        &self,
        event_type: &str,
        record: Option<&SignatureRecord>,
        signature_id: i64,
        ctx: Option<&SessionContext>,
    ) -> AuditEvent {
        let mut event = AuditEvent::new(event_type, SIGNATURE_TABLE).with_record(signature_id);
        if let Some(r) = record {
            event = event.with_signature(r.id, r.signature_hash.clone());
        }
        if let Some(ctx) = ctx {
            event = event.with_context(ctx);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_and_severities() {
        assert_eq!(FailureReason::HashMismatch.as_str(), "hash_mismatch");
        assert_eq!(FailureReason::HashMismatch.severity(), Severity::Critical);
        assert_eq!(FailureReason::Status.severity(), Severity::Warning);
    }

    #[test]
    fn into_result_maps_each_outcome() {
        assert!(VerificationOutcome::Valid { signature_id: 1 }.into_result().is_ok());
        assert!(matches!(
            VerificationOutcome::HashMismatch { signature_id: 1 }.into_result(),
            Err(EngineError::Tampered { signature_id: 1 })
        ));
        assert!(matches!(
            VerificationOutcome::Revoked { signature_id: 2 }.into_result(),
            Err(EngineError::Revoked { signature_id: 2 })
        ));
        assert!(matches!(
            VerificationOutcome::EntityMissing {
                signature_id: 3,
                table: "parts".into(),
                record_id: 9,
            }
            .into_result(),
            Err(EngineError::EntityMissing { record_id: 9, .. })
        ));
    }

    #[test]
    fn outcome_display() {
        let outcome = VerificationOutcome::NotFound { signature_id: 4 };
        assert_eq!(outcome.to_string(), "signature 4 failed: not_found");
        assert_eq!(outcome.failure_reason(), Some(FailureReason::NotFound));
    }
}
