//! Engine-level error taxonomy.

use thiserror::Error;

use crate::executor::ExecutorError;

/// Errors surfaced by the signature and audit engine.
///
/// Verification never returns `Tampered`, `Revoked`, `EntityMissing` or
/// `NotFound` on its own: those variants exist for callers that convert a
/// [`crate::verify::VerificationOutcome`] with `into_result()`. Only
/// `Storage` and `Cancelled` are exceptional for `verify`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A required field was absent or malformed.
    #[error("validation failed: {field} is required for {context}")]
    Validation {
        /// Name of the missing or invalid field.
        field: String,
        /// What was being built or written when validation failed.
        context: String,
    },

    /// No signature exists with the given id.
    #[error("signature not found: id={signature_id}")]
    NotFound {
        /// The unknown signature id.
        signature_id: i64,
    },

    /// The recomputed hash no longer matches the stored hash.
    #[error("signature {signature_id} does not match the current record state")]
    Tampered {
        /// The signature whose hash no longer matches.
        signature_id: i64,
    },

    /// The signature has been revoked.
    #[error("signature {signature_id} has been revoked")]
    Revoked {
        /// The revoked signature id.
        signature_id: i64,
    },

    /// The signed business record no longer exists.
    #[error("signed record {table}#{record_id} no longer exists")]
    EntityMissing {
        /// Table of the signed record.
        table: String,
        /// Primary key of the signed record.
        record_id: i64,
    },

    /// I/O failure, or schema negotiation ran out of fallback levels.
    #[error("storage error: {0}")]
    Storage(#[source] ExecutorError),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn validation(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            context: context.into(),
        }
    }
}

impl From<ExecutorError> for EngineError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Cancelled => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_executor_error_maps_to_cancelled() {
        let err: EngineError = ExecutorError::Cancelled.into();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn schema_errors_surface_as_storage() {
        let err: EngineError = ExecutorError::FallbackExhausted {
            statement: "audit.insert".to_string(),
            levels: 2,
        }
        .into();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(err.to_string().contains("audit.insert"));
    }
}
