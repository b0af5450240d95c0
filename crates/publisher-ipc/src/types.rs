//! Configuration and reporting types shared with callers.

use serde::{Deserialize, Serialize};

/// Default network MTU used to size RTP packets and the frame queue.
pub const DEFAULT_MTU: usize = 1500;

/// Bytes of wire frames the frame queue is sized to hold.
pub const DEFAULT_QUEUE_BYTES: usize = 10 * 1024 * 1024;

/// A user/password pair for protocol authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub user: String,

    /// Password.
    pub password: String,
}

impl Credentials {
    /// Create a credential pair.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// RTMP handshake flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMode {
    /// C1 carries time, zero version and random bytes.
    #[default]
    Plain,

    /// C1 carries an HMAC-SHA256 digest; falls back to plain if S1 does not validate.
    Digest,
}

/// RTP transport negotiated by RTSP `SETUP`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtspTransportMode {
    /// RTP/RTCP interleaved on the RTSP TCP connection.
    #[default]
    Tcp,

    /// RTP/RTCP as UDP datagrams to the server ports.
    Udp,
}

/// Configuration for a publish session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Frame queue capacity in wire frames.
    pub queue_capacity: usize,

    /// Upper bound on the bytes held by queued wire frames.
    pub queue_max_bytes: usize,

    /// Maximum RTP/SRT datagram size in bytes.
    pub mtu: usize,

    /// Outgoing RTMP chunk size (1 - 0xFFFFFF).
    pub rtmp_chunk_size: u32,

    /// RTMP handshake flavour.
    pub rtmp_handshake: HandshakeMode,

    /// RTSP transport.
    pub rtsp_transport: RtspTransportMode,

    /// Interval between RTCP sender reports per track.
    pub rtcp_interval_ms: u64,

    /// Bitrate estimation window.
    pub bitrate_window_ms: u64,

    /// Byte samples smaller than this are ignored by the bitrate estimator.
    pub bitrate_min_sample_bytes: u64,

    /// How long `stop` waits for the sender thread.
    pub sender_join_timeout_ms: u64,

    /// Socket read/write timeout during control negotiation.
    pub io_timeout_ms: u64,

    /// Credentials used when the server demands authentication.
    pub credentials: Option<Credentials>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_BYTES / DEFAULT_MTU,
            queue_max_bytes: DEFAULT_QUEUE_BYTES,
            mtu: DEFAULT_MTU,
            rtmp_chunk_size: 128,
            rtmp_handshake: HandshakeMode::Plain,
            rtsp_transport: RtspTransportMode::Tcp,
            rtcp_interval_ms: 3000,
            bitrate_window_ms: 1000,
            bitrate_min_sample_bytes: 1,
            sender_join_timeout_ms: 1000,
            io_timeout_ms: 5000,
            credentials: None,
        }
    }
}

/// Configuration for a local recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Output file path.
    pub path: String,
}

/// Counters describing a running session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Video frames written to the transport.
    pub sent_video_frames: u64,

    /// Audio frames written to the transport.
    pub sent_audio_frames: u64,

    /// Video frames dropped because the queue was full.
    pub dropped_video_frames: u64,

    /// Audio frames dropped because the queue was full.
    pub dropped_audio_frames: u64,

    /// Frames currently queued.
    pub items_in_cache: usize,

    /// Queue capacity.
    pub cache_size: usize,

    /// Last bitrate estimate.
    pub bitrate_bps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_config_defaults() {
        let config = PublishConfig::default();
        assert_eq!(config.queue_capacity, 6990);
        assert_eq!(config.queue_max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.rtmp_chunk_size, 128);
        assert_eq!(config.sender_join_timeout_ms, 1000);
        assert_eq!(config.rtsp_transport, RtspTransportMode::Tcp);
        assert!(config.credentials.is_none());
    }
}
