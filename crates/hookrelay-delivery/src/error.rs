//! Error types for dispatching operations.
//!
//! Transport failures are recoverable and drive retries. Configuration and
//! payload problems fail a lineage immediately. Broker errors are transient
//! and retried on the next poll.

use std::fmt;

use hookrelay_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatching operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while polling, forwarding or recording events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection could not be established or was reset.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// No response within the configured timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded in milliseconds
        timeout_ms: u64,
    },

    /// Destination host could not be resolved.
    #[error("dns resolution failed: {message}")]
    DnsError {
        /// Resolver error message
        message: String,
    },

    /// TLS handshake failed.
    #[error("tls handshake failed: {message}")]
    TlsError {
        /// Handshake error message
        message: String,
    },

    /// Attempt was not sent because the destination's last probe failed.
    #[error("destination {destination} is unhealthy")]
    Unhealthy {
        /// Destination name
        destination: String,
    },

    /// Invalid destination or dispatcher configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Event payload could not be decoded for forwarding.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// Decoding error message
        message: String,
    },

    /// Remote event source call failed.
    #[error("event source error: {message}")]
    SourceError {
        /// Error message
        message: String,
        /// HTTP status returned by the broker, if any
        status: Option<u16>,
    },

    /// Outcome sink call failed.
    #[error("outcome sink error: {message}")]
    SinkError {
        /// Error message
        message: String,
    },

    /// Requested event does not exist.
    #[error("event {id} not found")]
    NotFound {
        /// Identifier that was looked up
        id: String,
    },

    /// Only terminal events can be replayed.
    #[error("event {id} is {status} and cannot be replayed")]
    NotReplayable {
        /// Event identifier
        id: String,
        /// Current status
        status: String,
    },

    /// Shutdown was requested while the operation was in flight.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal dispatch error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a DNS resolution error.
    pub fn dns(message: impl Into<String>) -> Self {
        Self::DnsError { message: message.into() }
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::TlsError { message: message.into() }
    }

    /// Creates a health gate rejection.
    pub fn unhealthy(destination: impl Into<String>) -> Self {
        Self::Unhealthy { destination: destination.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a payload decoding error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload { message: message.into() }
    }

    /// Creates an event source error.
    pub fn source(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::SourceError { message: message.into(), status }
    }

    /// Creates an outcome sink error.
    pub fn sink(message: impl Into<String>) -> Self {
        Self::SinkError { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a replay rejection for a non-terminal event.
    pub fn not_replayable(id: impl Into<String>, status: impl ToString) -> Self {
        Self::NotReplayable { id: id.into(), status: status.to_string() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether another attempt could succeed.
    ///
    /// Transport failures, health gate rejections and broker errors are
    /// transient. Configuration, payload and lookup errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::DnsError { .. }
            | Self::TlsError { .. }
            | Self::Unhealthy { .. }
            | Self::SourceError { .. }
            | Self::SinkError { .. } => true,

            Self::ConfigurationError { .. }
            | Self::InvalidPayload { .. }
            | Self::NotFound { .. }
            | Self::NotReplayable { .. }
            | Self::ShutdownRequested
            | Self::InternalError { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPayload(message) => Self::InvalidPayload { message },
            CoreError::InvalidInput(message) => Self::ConfigurationError { message },
        }
    }
}

/// Category of dispatch error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures.
    Network,
    /// Health gate rejections.
    Health,
    /// Broker source or sink failures.
    Broker,
    /// Configuration or payload problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::DnsError { .. }
            | DeliveryError::TlsError { .. } => Self::Network,
            DeliveryError::Unhealthy { .. } => Self::Health,
            DeliveryError::SourceError { .. }
            | DeliveryError::SinkError { .. }
            | DeliveryError::NotFound { .. } => Self::Broker,
            DeliveryError::ConfigurationError { .. }
            | DeliveryError::InvalidPayload { .. }
            | DeliveryError::NotReplayable { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Health => write!(f, "health"),
            Self::Broker => write!(f, "broker"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
