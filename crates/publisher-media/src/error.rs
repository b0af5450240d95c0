//! Error types for the media module.

use thiserror::Error;

/// Errors that can occur while inspecting or framing media.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Parameter sets needed for a decoder configuration are missing.
    #[error("Missing parameter sets: {0}")]
    MissingParameterSets(String),

    /// A NAL unit was malformed.
    #[error("Invalid NAL unit: {0}")]
    InvalidNal(String),

    /// The audio sample rate has no MPEG-4 sampling frequency index.
    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    /// AMF0 data could not be decoded.
    #[error("AMF0 decode error: {0}")]
    AmfDecode(String),

    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),
}
