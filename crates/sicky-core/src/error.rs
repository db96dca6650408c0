//! Error types for the sicky runtime

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the sicky runtime
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A registry backend could not be constructed or reached during setup
    #[error("Failed to connect to {backend} backend: {message}")]
    Connection {
        /// Backend kind (consul, mdns, redis)
        backend: String,
        /// Error message
        message: String,
    },

    /// Per-call registry failure (register, deregister)
    #[error("Registry error: {0}")]
    Registry(String),

    /// Watch or listing failure
    #[error("Discovery backend error: {0}")]
    Discovery(String),

    /// Instance names a service the pool does not know about
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Address could not be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a connection error for the given backend
    pub fn connection(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Connection {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Whether the error happened while setting a backend up
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error() {
        let err = Error::connection("consul", "connection refused");
        assert!(err.is_connection());
        assert_eq!(
            err.to_string(),
            "Failed to connect to consul backend: connection refused"
        );
    }

    #[test]
    fn test_unknown_service_message() {
        let err = Error::UnknownService("orders".to_string());
        assert!(!err.is_connection());
        assert!(err.to_string().contains("orders"));
    }
}
