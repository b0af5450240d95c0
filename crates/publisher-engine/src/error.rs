//! Error types for the engine.

use publisher_media::MediaError;
use publisher_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while recording.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The operation is not valid in the current record state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Record state at the time.
        state: &'static str,
    },

    /// Writing the container failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No track format to describe the container with.
    #[error("Missing format: {0}")]
    MissingFormat(String),

    /// A sample could not be framed for the container.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Result type for recording operations.
pub type RecordResult<T> = Result<T, RecordError>;

/// Errors returned by the stream client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The publish session failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The recording failed.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Result type for stream client operations.
pub type ClientResult<T> = Result<T, ClientError>;
