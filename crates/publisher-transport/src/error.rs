//! Error types for the transport module.

use publisher_media::MediaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Handshake failure, refused or unreachable endpoint.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Malformed or unexpected server reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected the credentials, or demanded credentials we do not have.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Endpoint URL could not be parsed.
    #[error("Endpoint malformed: {0}")]
    InvalidUrl(String),

    /// Not connected.
    #[error("Not connected")]
    NotConnected,

    /// Already connected.
    #[error("Already connected")]
    AlreadyConnected,

    /// The frame queue is full; the frame was dropped.
    #[error("Frame queue full")]
    QueueFull,

    /// The frame queue no longer accepts frames.
    #[error("Frame queue closed")]
    QueueClosed,

    /// A reply did not arrive in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Access unit could not be framed.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Coarse error classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Terminal, the session is closed.
    Connection,
    /// Terminal for the current session, never retried automatically.
    Protocol,
    /// Credentials problem.
    Auth,
    /// Socket failure.
    Io,
    /// Frame dropped under backpressure. Not fatal.
    Capacity,
}

impl TransportError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) | Self::InvalidUrl(_) | Self::Timeout(_) => ErrorKind::Connection,
            Self::Protocol(_) | Self::NotConnected | Self::AlreadyConnected | Self::Media(_) => {
                ErrorKind::Protocol
            }
            Self::AuthenticationFailed(_) => ErrorKind::Auth,
            Self::Io(_) => ErrorKind::Io,
            Self::QueueFull | Self::QueueClosed => ErrorKind::Capacity,
        }
    }

    /// Returns true if retrying the same endpoint can never succeed.
    pub fn is_malformed_endpoint(&self) -> bool {
        matches!(self, Self::InvalidUrl(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TransportError::QueueFull.kind(), ErrorKind::Capacity);
        assert_eq!(
            TransportError::AuthenticationFailed("nosuchuser".into()).kind(),
            ErrorKind::Auth
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(TransportError::from(io).kind(), ErrorKind::Io);
        assert_eq!(
            TransportError::from(MediaError::InvalidNal("short".into())).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_malformed_endpoint_message() {
        let err = TransportError::InvalidUrl("missing host".into());
        assert!(err.is_malformed_endpoint());
        assert_eq!(err.to_string(), "Endpoint malformed: missing host");
    }
}
