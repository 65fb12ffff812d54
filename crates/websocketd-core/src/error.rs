//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Token identifier is empty, too long or contains forbidden characters
    #[error("Invalid token id: {reason}")]
    InvalidTokenId { reason: String },

    /// Timestamp returned by the auth service could not be parsed
    #[error("Invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// Tenant identifier is not a UUID
    #[error("Invalid tenant uuid: {value}")]
    InvalidTenant { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
