//! Errors raised by the pure guard models before any store is involved.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A rejected guard transition or malformed guard input.
///
/// Store outages never show up here; they are `StoreError`s in infra and
/// make admission fail closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Bad operator or caller input: an empty kill-switch reason, a zero
    /// rate window, an unparseable limit override.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Counters or kill-switch state would end up inconsistent.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Stale `ExpectedVersion` or a duplicate catalogue entry.
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
