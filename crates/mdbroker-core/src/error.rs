//! Error types for mdbroker

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Main error type for mdbroker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid message received from a peer
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No connected peer with the given address
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Registrator error
    #[error("Registrator error: {0}")]
    Registrator(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for mdbroker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BrokerError {
    fn from(err: toml::de::Error) -> Self {
        BrokerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BrokerError = io_err.into();
        assert!(matches!(err, BrokerError::Io(_)));
    }

    #[test]
    fn test_error_from_protocol() {
        let err: BrokerError = ProtocolError::MissingDelimiter.into();
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert_eq!(
            err.to_string(),
            "Protocol error: second frame must be an empty delimiter"
        );
    }
}
