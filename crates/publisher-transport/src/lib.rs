//! Network publishing for the media engine.
//!
//! Each protocol session (RTMP, RTSP, SRT) drives its own handshake on the
//! calling thread, then hands a [`Transport`] to a [`MediaSender`] whose
//! single worker thread drains the bounded [`FrameQueue`] onto the socket.

mod bitrate;
mod connection;
mod error;
mod queue;
pub mod rtmp;
pub mod rtsp;
mod sender;
mod session;
pub mod srt;

pub use bitrate::BitrateManager;
pub use connection::ReconnectPolicy;
pub use error::{ErrorKind, TransportError};
pub use queue::{FrameQueue, WireFrame};
pub use sender::{MediaSender, SenderStatistics, Transport};
pub use session::{PublishSession, SharedState};

/// Maximum number of reconnection attempts.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
pub const BASE_RECONNECT_DELAY_MS: u64 = 1000;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
