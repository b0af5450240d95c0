//! RTMP publishing.
//!
//! The client performs the byte handshake, negotiates `connect` /
//! `createStream` / `publish` over AMF0 commands (with Adobe and Limelight
//! authentication), then hands the socket to the sender thread. Every
//! access unit becomes one audio or video message split into chunks.

mod auth;
mod chunk;
mod client;
mod handshake;
mod message;

pub use chunk::{ChunkReader, ChunkWriter, RtmpMessage};
pub use client::RtmpClient;
pub use handshake::{HandshakeOutcome, HANDSHAKE_SIZE, RTMP_VERSION};
pub use message::{Command, MessageType};

use publisher_ipc::Credentials;
use url::Url;

use crate::error::TransportError;
use crate::TransportResult;

/// Default RTMP port.
pub const DEFAULT_PORT: u16 = 1935;

/// Default port for RTMP over TLS.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Chunk stream ids used by the client.
pub mod csid {
    /// Protocol control messages.
    pub const PROTOCOL_CONTROL: u32 = 2;
    /// `connect` and `createStream`.
    pub const OVER_CONNECTION: u32 = 3;
    /// Audio messages.
    pub const AUDIO: u32 = 4;
    /// Commands and data bound to the published stream.
    pub const OVER_STREAM: u32 = 5;
    /// Video messages.
    pub const VIDEO: u32 = 6;
}

/// RTMP URL scheme variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtmpScheme {
    Rtmp,
    Rtmps,
    Rtmpt,
    Rtmpts,
}

impl RtmpScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "rtmp" => Some(Self::Rtmp),
            "rtmps" => Some(Self::Rtmps),
            "rtmpt" => Some(Self::Rtmpt),
            "rtmpts" => Some(Self::Rtmpts),
            _ => None,
        }
    }

    /// Scheme as it appears in a URL.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rtmp => "rtmp",
            Self::Rtmps => "rtmps",
            Self::Rtmpt => "rtmpt",
            Self::Rtmpts => "rtmpts",
        }
    }

    /// Returns true if the scheme needs TLS.
    pub fn is_tls(self) -> bool {
        matches!(self, Self::Rtmps | Self::Rtmpts)
    }

    /// Returns true if the scheme tunnels over HTTP.
    pub fn is_tunneled(self) -> bool {
        matches!(self, Self::Rtmpt | Self::Rtmpts)
    }
}

/// A parsed `rtmp[t][s]://host[:port]/app[/instance]/stream` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub scheme: RtmpScheme,
    pub host: String,
    pub port: u16,
    /// Application name, including an instance segment when present.
    pub app: String,
    /// Stream name, including any query string.
    pub stream: String,
    /// The URL without the stream name.
    pub tc_url: String,
    /// Credentials from the URL userinfo.
    pub credentials: Option<Credentials>,
}

impl RtmpUrl {
    /// Parse an RTMP endpoint.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let parsed = Url::parse(input).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let scheme = RtmpScheme::parse(parsed.scheme()).ok_or_else(|| {
            TransportError::InvalidUrl(format!("unsupported scheme {}", parsed.scheme()))
        })?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("missing host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(if scheme.is_tls() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        });

        let segments: Vec<&str> = parsed
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let (app, stream) = match segments.as_slice() {
            [] | [_] => {
                return Err(TransportError::InvalidUrl(
                    "expected /app/stream in URL path".to_string(),
                ))
            }
            [app, stream] => (app.to_string(), stream.to_string()),
            // The first segment after the app is an application instance.
            [app, instance, rest @ ..] => (format!("{app}/{instance}"), rest.join("/")),
        };
        let stream = match parsed.query() {
            Some(query) => format!("{stream}?{query}"),
            None => stream,
        };

        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let tc_url = format!("{}://{}/{}", scheme.as_str(), authority, app);

        let credentials = (!parsed.username().is_empty()).then(|| {
            Credentials::new(parsed.username(), parsed.password().unwrap_or_default())
        });

        Ok(Self {
            scheme,
            host,
            port,
            app,
            stream,
            tc_url,
            credentials,
        })
    }
}
