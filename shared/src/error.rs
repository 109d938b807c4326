//! Error types for LightTunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Already in use: {0}")]
    AlreadyInUse(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Channel closed")]
    Closed,
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Errors after which the control connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection(_) | Error::FrameTooLarge { .. } | Error::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("bad magic 0x00");
        assert_eq!(err.to_string(), "Protocol error: bad magic 0x00");

        let err = Error::FrameTooLarge { len: 10, max: 4 };
        assert_eq!(err.to_string(), "Frame too large: 10 bytes (max 4)");

        let err = Error::AlreadyInUse("port 8080".into());
        assert_eq!(err.to_string(), "Already in use: port 8080");
    }

    #[test]
    fn test_fatal_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(Error::from(io).is_fatal());
        assert!(Error::FrameTooLarge { len: 1, max: 0 }.is_fatal());
        assert!(!Error::crypto("bad padding").is_fatal());
        assert!(!Error::protocol("truncated").is_fatal());
    }
}
