//! Errors raised while building domain values from untrusted input.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejected input: a malformed date range or identifier.
///
/// Storage and transport failures are modelled by the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
