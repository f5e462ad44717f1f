//! Error types for domain validation.
//!
//! Covers malformed payloads and configuration values caught before any
//! network I/O happens. Transport and collaborator failures live in the
//! delivery crate.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for domain operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Event payload could not be decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Validation failures are deterministic, so never.
    pub const fn is_retryable(&self) -> bool {
        false
    }
}
