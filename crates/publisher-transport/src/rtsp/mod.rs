//! RTSP publishing with RTP/RTCP media.
//!
//! `ANNOUNCE` describes the tracks in SDP, `SETUP` binds each track to an
//! interleaved channel pair on the RTSP connection or to a UDP port pair,
//! and `RECORD` starts the flow. Video track 0 carries H264, audio track 1
//! carries AAC.

mod client;
mod request;
mod rtcp;
mod rtp;
mod sdp;

pub use client::RtspClient;
pub use request::{Method, Response};
pub use rtcp::RtcpReporter;
pub use rtp::{AacPacketizer, H264Packetizer, Packetizer, RtpStream, RTP_HEADER_SIZE};

use publisher_ipc::Credentials;
use publisher_media::TrackKind;
use url::Url;

use crate::error::TransportError;
use crate::TransportResult;

/// Default RTSP port.
pub const DEFAULT_PORT: u16 = 554;

/// Track id of a kind in SDP and `SETUP`.
pub fn track_id(kind: TrackKind) -> u8 {
    match kind {
        TrackKind::Video => 0,
        TrackKind::Audio => 1,
    }
}

/// Interleaved channel (and UDP flow) carrying a track's RTP; RTCP uses the next one.
pub fn rtp_channel(kind: TrackKind) -> u8 {
    track_id(kind) * 2
}

/// A parsed `rtsp://[user:pass@]host[:port]/path` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub host: String,
    pub port: u16,
    /// Request URI without credentials.
    pub uri: String,
    pub credentials: Option<Credentials>,
}

impl RtspUrl {
    pub fn parse(input: &str) -> TransportResult<Self> {
        let parsed = Url::parse(input).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "rtsp" => {}
            "rtsps" => {
                return Err(TransportError::Connection("rtsps is not supported".to_string()))
            }
            other => return Err(TransportError::InvalidUrl(format!("unsupported scheme {other}"))),
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("missing host".to_string()))?
            .to_string();
        let path = parsed.path().trim_end_matches('/');
        if path.is_empty() {
            return Err(TransportError::InvalidUrl("missing stream path".to_string()));
        }
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        let mut uri = format!("rtsp://{host}:{port}{path}");
        if let Some(query) = parsed.query() {
            uri.push('?');
            uri.push_str(query);
        }
        let credentials = (!parsed.username().is_empty()).then(|| {
            Credentials::new(parsed.username(), parsed.password().unwrap_or_default())
        });

        Ok(Self {
            host,
            port,
            uri,
            credentials,
        })
    }

    /// `SETUP` URI of a track.
    pub fn track_uri(&self, kind: TrackKind) -> String {
        format!("{}/streamid={}", self.uri, track_id(kind))
    }
}
