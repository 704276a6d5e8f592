//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of domain rules: retrying the same input gives the
/// same error. Storage and transport failures have their own types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Rejected input (gift request fields, idempotency keys, status tags).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity is in a state that forbids the transition, e.g. activating
    /// an expired gift.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A textual id that is not a UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The transition already happened (activating an active gift, requeuing
    /// an event that is not dead).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
