//! RTSP request encoding, response parsing and authentication headers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use publisher_ipc::Credentials;

use crate::error::TransportError;
use crate::TransportResult;

const USER_AGENT: &str = "publisher/0.1";

/// RTSP methods used by a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Announce,
    Setup,
    Record,
    Teardown,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Announce => "ANNOUNCE",
            Self::Setup => "SETUP",
            Self::Record => "RECORD",
            Self::Teardown => "TEARDOWN",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, content_type: &'static str, body: String) -> Self {
        self.headers.push(("Content-Type", content_type.to_string()));
        self.body = Some(body);
        self
    }

    /// Serialize with the given sequence number and optional session/authorization.
    pub fn encode(&self, cseq: u32, session: Option<&str>, authorization: Option<&str>) -> String {
        let mut text = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", self.method.as_str(), self.uri, cseq);
        text.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
        if let Some(session) = session {
            text.push_str(&format!("Session: {session}\r\n"));
        }
        if let Some(authorization) = authorization {
            text.push_str(&format!("Authorization: {authorization}\r\n"));
        }
        for (name, value) in &self.headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        match &self.body {
            Some(body) => {
                text.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                text.push_str(body);
            }
            None => text.push_str("\r\n"),
        }
        text
    }
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    /// Parse one response from the front of `buf`, returning it and the bytes consumed.
    ///
    /// Returns `None` while the response is incomplete.
    pub fn parse(buf: &[u8]) -> TransportResult<Option<(Self, usize)>> {
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|_| TransportError::Protocol("response head is not UTF-8".to_string()))?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        if !parts.next().unwrap_or_default().starts_with("RTSP/") {
            return Err(TransportError::Protocol(format!("bad status line: {status_line}")));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::Protocol(format!("bad status line: {status_line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        let body_start = head_end + 4;
        if buf.len() < body_start + content_length {
            return Ok(None);
        }
        let body = String::from_utf8_lossy(&buf[body_start..body_start + content_length]).into_owned();

        Ok(Some((
            Self {
                status,
                reason,
                headers,
                body,
            },
            body_start + content_length,
        )))
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.parse().ok())
    }

    /// Session id without the timeout parameter.
    pub fn session(&self) -> Option<&str> {
        self.header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// `server_port` pair from the `Transport` header.
    pub fn server_ports(&self) -> Option<(u16, u16)> {
        let transport = self.header("Transport")?;
        let ports = transport
            .split(';')
            .find_map(|p| p.trim().strip_prefix("server_port="))?;
        match ports.split_once('-') {
            Some((rtp, rtcp)) => Some((rtp.parse().ok()?, rtcp.parse().ok()?)),
            None => {
                let rtp: u16 = ports.parse().ok()?;
                Some((rtp, rtp.checked_add(1)?))
            }
        }
    }
}

/// Credentials scheme demanded by a `401` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Digest { realm: String, nonce: String },
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("Basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }
        let param = |key: &str| {
            params.split(',').find_map(|p| {
                let (k, v) = p.trim().split_once('=')?;
                k.trim()
                    .eq_ignore_ascii_case(key)
                    .then(|| v.trim().trim_matches('"').to_string())
            })
        };
        Some(Self::Digest {
            realm: param("realm")?,
            nonce: param("nonce")?,
        })
    }

    /// `Authorization` header value for one request.
    pub fn authorization(&self, credentials: &Credentials, method: Method, uri: &str) -> String {
        match self {
            Self::Basic => {
                let token = STANDARD.encode(format!("{}:{}", credentials.user, credentials.password));
                format!("Basic {token}")
            }
            Self::Digest { realm, nonce } => {
                let ha1 = md5::compute(format!("{}:{}:{}", credentials.user, realm, credentials.password));
                let ha2 = md5::compute(format!("{}:{}", method.as_str(), uri));
                let response = md5::compute(format!("{ha1:x}:{nonce}:{ha2:x}"));
                format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{:x}\"",
                    credentials.user, realm, nonce, uri, response
                )
            }
        }
    }
}
