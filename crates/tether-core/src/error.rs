//! Error types for tether-core

use thiserror::Error;

/// Result type alias using tether-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity or collection not found (locally or remotely)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote copy changed after the local mutation was recorded
    #[error("Conflict on {collection}/{id}")]
    Conflict {
        /// Collection name
        collection: String,
        /// Entity identifier
        id: String,
    },

    /// Transport-level failure talking to the remote service
    #[error("Network failure: {0}")]
    Network(String),

    /// Remote call did not complete in time
    #[error("Request timed out")]
    Timeout,

    /// Remote rejected the credentials in use
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Remote failed while handling the request
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error description returned by the server
        message: String,
    },

    /// Remote rejected the payload; retrying would fail the same way
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation was cancelled before it applied anything
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if a later attempt of the same request may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::Server { .. } | Self::Cancelled
        )
    }

    /// Returns true for remote "no such entity/collection" failures.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!Error::Validation("bad field".into()).is_retryable());
        assert!(!Error::InvalidCredentials("expired".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = Error::Conflict {
            collection: "books".into(),
            id: "b1".into(),
        };
        assert_eq!(err.to_string(), "Conflict on books/b1");
        assert!(Error::NotFound("books/b1".into()).is_not_found());
    }
}
