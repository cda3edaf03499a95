use std::io;
use thiserror::Error;

/// Custom error types for the sinktree networking layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Timing error: {0}")]
    Timing(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new cluster error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Error::Cluster(msg.into())
    }

    /// Creates a new routing error
    pub fn routing(msg: impl Into<String>) -> Self {
        Error::Routing(msg.into())
    }

    /// Creates a new timing error
    pub fn timing(msg: impl Into<String>) -> Self {
        Error::Timing(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::cluster("test error");
        assert!(matches!(err, Error::Cluster(_)));
        assert_eq!(err.to_string(), "Cluster error: test error");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
