//! Error types for the airbox environment abstraction.

use thiserror::Error;

/// Errors that can occur talking to the backend.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Connection could not be established or was reset
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Malformed or truncated exchange with the peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend answered with a non-success status
    #[error("Unexpected status {0}")]
    Status(u16),

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EnvError {
    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for faults that may clear up if the call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Protocol(_) => true,
            Self::Status(status) => StatusClass::from_status(*status) == StatusClass::Retryable,
            Self::Serialization(_) => false,
        }
    }
}

/// How a backend HTTP-style status code should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Accepted,
    /// 429 and 5xx
    Retryable,
    /// Everything else
    Rejected,
}

impl StatusClass {
    /// Classifies a status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Accepted,
            429 | 500..=599 => Self::Retryable,
            _ => Self::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(StatusClass::from_status(200), StatusClass::Accepted);
        assert_eq!(StatusClass::from_status(204), StatusClass::Accepted);
        assert_eq!(StatusClass::from_status(429), StatusClass::Retryable);
        assert_eq!(StatusClass::from_status(503), StatusClass::Retryable);
        assert_eq!(StatusClass::from_status(400), StatusClass::Rejected);
        assert_eq!(StatusClass::from_status(404), StatusClass::Rejected);
        assert_eq!(StatusClass::from_status(302), StatusClass::Rejected);
    }

    #[test]
    fn test_transient_errors() {
        assert!(EnvError::Timeout(20_000).is_transient());
        assert!(EnvError::connection("refused").is_transient());
        assert!(EnvError::Status(502).is_transient());
        assert!(!EnvError::Status(403).is_transient());
        assert!(!EnvError::Serialization("bad".into()).is_transient());
    }
}
