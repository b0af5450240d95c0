//! SRT publishing of an MPEG-TS stream.
//!
//! The caller runs the v5 induction/conclusion handshake over UDP, then
//! every access unit is muxed to transport stream packets and sent as SRT
//! data packets of up to seven TS packets. Lost packets reported by `NAK`
//! are resent from a bounded history.

mod client;
mod packet;

pub use client::SrtClient;
pub use packet::{
    ControlPacket, ControlType, DataPacket, Handshake, HandshakeExtension, Packet, HEADER_SIZE,
};

use publisher_media::mpegts::TS_PACKET_SIZE;
use url::Url;

use crate::error::TransportError;
use crate::TransportResult;

/// Default SRT port.
pub const DEFAULT_PORT: u16 = 8888;

/// TS packets per SRT data packet.
pub const TS_PACKETS_PER_DATAGRAM: usize = 7;

/// Payload bytes of a full data packet.
pub const MAX_PAYLOAD_SIZE: usize = TS_PACKETS_PER_DATAGRAM * TS_PACKET_SIZE;

/// Longest stream id the `SID` extension may carry.
const MAX_STREAM_ID_LEN: usize = 512;

/// A parsed `srt://host[:port]/streamid` endpoint. `?streamid=` overrides the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtUrl {
    pub host: String,
    pub port: u16,
    pub stream_id: Option<String>,
}

impl SrtUrl {
    pub fn parse(input: &str) -> TransportResult<Self> {
        let parsed = Url::parse(input).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "srt" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("missing host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        let from_query = parsed
            .query_pairs()
            .find(|(key, _)| key == "streamid")
            .map(|(_, value)| value.into_owned());
        let from_path = Some(parsed.path().trim_matches('/').to_string()).filter(|p| !p.is_empty());
        let stream_id = from_query.or(from_path);
        if stream_id.as_ref().is_some_and(|id| id.len() > MAX_STREAM_ID_LEN) {
            return Err(TransportError::InvalidUrl("stream id too long".to_string()));
        }

        Ok(Self {
            host,
            port,
            stream_id,
        })
    }
}
