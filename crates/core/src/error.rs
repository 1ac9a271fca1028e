//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Why an aggregate refused a command, or why a value failed to parse.
///
/// Only deterministic outcomes of domain logic live here. Storage, tenancy
/// and precondition failures are raised by the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: empty title, bad language tag, unusable e-mail.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The command is well-formed but the aggregate's state forbids it.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A tenant key or id string failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command targets an aggregate that was never created.
    #[error("not found")]
    NotFound,

    /// The command repeats or contradicts what already happened.
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

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
