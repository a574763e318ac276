//! Error types for the hub

use thiserror::Error;

/// Main error type for the hub
#[derive(Error, Debug)]
pub enum Error {
    /// Request failed validation before any store I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Failure from the key-value store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether this error is the caller's fault (maps to HTTP 400)
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

/// Store errors
///
/// Inside a pipelined batch the first failure is sticky: every later
/// operation on the same connection returns the stored error without
/// touching the wire.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Could not establish or reuse a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Store rejected authentication
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Command or connect deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol-level failure reported by the store
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Value of unknown shape returned from the store
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_client_fault() {
        assert!(Error::Validation("bad dim".into()).is_validation());
        assert!(!Error::Store(StoreError::Timeout("flush".into())).is_validation());
    }

    #[test]
    fn store_error_converts() {
        let err: Error = StoreError::Connection("refused".into()).into();
        assert!(matches!(err, Error::Store(_)));
    }
}
