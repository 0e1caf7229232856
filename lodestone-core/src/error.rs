//! Lodestone error abstractions.

use thiserror::Error;

/// Errors arising while reconciling a pipeline against its backend systems.
///
/// The variant determines how the lifecycle controller reacts: transient and
/// conflict errors cause the reconcile pass to be re-queued, while validation
/// and consistency errors are terminal for the affected generation and are
/// surfaced through the pipeline's status conditions.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A backend call failed in a way which is expected to heal on retry.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// A backend rejected the desired spec; retrying without a spec change will not help.
    #[error("backend rejected the desired spec: {0}")]
    Validation(String),
    /// The resource store rejected an update due to a stale resource version.
    #[error("conflicting resource update: {0}")]
    Conflict(String),
    /// A generation could not be fully materialized within the retry budget.
    #[error("managed resource set incomplete after {attempts} attempts: {message}")]
    ConsistencyViolation { attempts: u32, message: String },
}

impl ReconcileError {
    /// Construct a transient error from any displayable source.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Whether a retry of the same pass may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }

    /// The condition reason used when reporting this error in status.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Transient(_) => "TransientBackendError",
            Self::Validation(_) => "ValidationError",
            Self::Conflict(_) => "ConflictError",
            Self::ConsistencyViolation { .. } => "ConsistencyViolation",
        }
    }
}

/// A result type where the error is a `ReconcileError`.
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
