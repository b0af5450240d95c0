//! SRT packet layouts: the 16-byte header, data packets, control packets
//! and the v5 handshake with its `HSREQ` and `SID` extensions.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::TransportResult;

/// Header length shared by data and control packets.
pub const HEADER_SIZE: usize = 16;

/// Handshake body without extensions.
pub const HANDSHAKE_SIZE: usize = 48;

/// Magic carried in the extension field of an induction response.
pub const SRT_MAGIC: u16 = 0x4A17;

/// Version announced in `HSREQ` (1.5.3).
pub const SRT_LIBRARY_VERSION: u32 = 0x0001_0503;

/// Sequence and message numbers wrap at 31 and 26 bits.
pub const MAX_SEQUENCE: u32 = 0x7FFF_FFFF;
const MAX_MESSAGE_NUMBER: u32 = 0x03FF_FFFF;

const CONTROL_FLAG: u32 = 0x8000_0000;
/// Packet position `11`: the message fits in one packet.
const POSITION_SOLO: u32 = 0xC000_0000;
const RETRANSMITTED_FLAG: u32 = 0x0400_0000;

/// Handshake types.
pub mod handshake_type {
    pub const WAVEAHAND: u32 = 0;
    pub const INDUCTION: u32 = 1;
    pub const CONCLUSION: u32 = 0xFFFF_FFFF;
    pub const AGREEMENT: u32 = 0xFFFF_FFFE;
    /// First rejection reason; rejections run up to [`REJECT_LAST`].
    pub const REJECT_FIRST: u32 = 1000;
    pub const REJECT_BAD_SECRET: u32 = 1010;
    pub const REJECT_LAST: u32 = 1017;
}

/// Extension flags of a conclusion request.
const EXT_HSREQ: u16 = 0x1;
const EXT_CONFIG: u16 = 0x4;

const EXT_TYPE_HSREQ: u16 = 1;
const EXT_TYPE_SID: u16 = 5;

/// TSBPD send/receive, crypt, TLPKTDROP, periodic NAK, rexmit flag.
const HSREQ_FLAGS: u32 = 0x3F;

/// Next sequence number with 31-bit wrap.
pub fn next_sequence(seq: u32) -> u32 {
    seq.wrapping_add(1) & MAX_SEQUENCE
}

/// Control packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Handshake,
    KeepAlive,
    Ack,
    Nak,
    Shutdown,
    AckAck,
    PeerError,
    Other(u16),
}

impl From<u16> for ControlType {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Handshake,
            1 => Self::KeepAlive,
            2 => Self::Ack,
            3 => Self::Nak,
            5 => Self::Shutdown,
            6 => Self::AckAck,
            8 => Self::PeerError,
            other => Self::Other(other),
        }
    }
}

impl ControlType {
    pub fn id(self) -> u16 {
        match self {
            Self::Handshake => 0,
            Self::KeepAlive => 1,
            Self::Ack => 2,
            Self::Nak => 3,
            Self::Shutdown => 5,
            Self::AckAck => 6,
            Self::PeerError => 8,
            Self::Other(id) => id,
        }
    }
}

/// A data packet carrying one solo message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sequence: u32,
    pub message_number: u32,
    pub retransmitted: bool,
    pub timestamp: u32,
    pub destination: u32,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.sequence & MAX_SEQUENCE);
        let mut word = POSITION_SOLO | (self.message_number & MAX_MESSAGE_NUMBER);
        if self.retransmitted {
            word |= RETRANSMITTED_FLAG;
        }
        buf.put_u32(word);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.destination);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub control_type: ControlType,
    pub subtype: u16,
    /// Type-specific information: the ACK number for `ACK` and `ACKACK`.
    pub info: u32,
    pub timestamp: u32,
    pub destination: u32,
    pub body: Bytes,
}

impl ControlPacket {
    pub fn new(control_type: ControlType, info: u32, timestamp: u32, destination: u32, body: Bytes) -> Self {
        Self {
            control_type,
            subtype: 0,
            info,
            timestamp,
            destination,
            body,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_u32(CONTROL_FLAG | ((self.control_type.id() as u32) << 16) | self.subtype as u32);
        buf.put_u32(self.info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.destination);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Lost sequence ranges (inclusive) from a `NAK` body.
    pub fn loss_list(&self) -> Vec<(u32, u32)> {
        let mut body = &self.body[..];
        let mut ranges = Vec::new();
        while body.remaining() >= 4 {
            let word = body.get_u32();
            if word & CONTROL_FLAG != 0 {
                if body.remaining() < 4 {
                    break;
                }
                let end = body.get_u32() & MAX_SEQUENCE;
                ranges.push((word & MAX_SEQUENCE, end));
            } else {
                ranges.push((word, word));
            }
        }
        ranges
    }
}

/// Encode a `NAK` loss list.
pub fn encode_loss_list(ranges: &[(u32, u32)]) -> Bytes {
    let mut buf = BytesMut::new();
    for &(start, end) in ranges {
        if start == end {
            buf.put_u32(start & MAX_SEQUENCE);
        } else {
            buf.put_u32(CONTROL_FLAG | (start & MAX_SEQUENCE));
            buf.put_u32(end & MAX_SEQUENCE);
        }
    }
    buf.freeze()
}

/// Any SRT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    pub fn parse(mut buf: &[u8]) -> TransportResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(TransportError::Protocol(format!("{} byte SRT packet", buf.len())));
        }
        let first = buf.get_u32();
        let second = buf.get_u32();
        let timestamp = buf.get_u32();
        let destination = buf.get_u32();
        let rest = Bytes::copy_from_slice(buf);

        if first & CONTROL_FLAG == 0 {
            return Ok(Self::Data(DataPacket {
                sequence: first,
                message_number: second & MAX_MESSAGE_NUMBER,
                retransmitted: second & RETRANSMITTED_FLAG != 0,
                timestamp,
                destination,
                payload: rest,
            }));
        }
        Ok(Self::Control(ControlPacket {
            control_type: ControlType::from(((first >> 16) & 0x7FFF) as u16),
            subtype: (first & 0xFFFF) as u16,
            info: second,
            timestamp,
            destination,
            body: rest,
        }))
    }
}

/// Handshake extension blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeExtension {
    HsReq {
        version: u32,
        flags: u32,
        receiver_delay_ms: u16,
        sender_delay_ms: u16,
    },
    StreamId(String),
    Other {
        ext_type: u16,
        data: Bytes,
    },
}

impl HandshakeExtension {
    /// Handshake request for a sender with the given latency.
    pub fn sender_request(latency_ms: u16) -> Self {
        Self::HsReq {
            version: SRT_LIBRARY_VERSION,
            flags: HSREQ_FLAGS,
            receiver_delay_ms: latency_ms,
            sender_delay_ms: latency_ms,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Self::HsReq {
                version,
                flags,
                receiver_delay_ms,
                sender_delay_ms,
            } => {
                buf.put_u16(EXT_TYPE_HSREQ);
                buf.put_u16(3);
                buf.put_u32(*version);
                buf.put_u32(*flags);
                buf.put_u16(*receiver_delay_ms);
                buf.put_u16(*sender_delay_ms);
            }
            Self::StreamId(id) => {
                // Words travel in little-endian order.
                let mut bytes = id.as_bytes().to_vec();
                bytes.resize(bytes.len().div_ceil(4) * 4, 0);
                buf.put_u16(EXT_TYPE_SID);
                buf.put_u16((bytes.len() / 4) as u16);
                for word in bytes.chunks_exact(4) {
                    buf.put_slice(&[word[3], word[2], word[1], word[0]]);
                }
            }
            Self::Other { ext_type, data } => {
                buf.put_u16(*ext_type);
                buf.put_u16((data.len() / 4) as u16);
                buf.put_slice(&data[..data.len() / 4 * 4]);
            }
        }
    }

    fn parse(ext_type: u16, mut data: &[u8]) -> Self {
        match ext_type {
            EXT_TYPE_HSREQ | 2 if data.len() >= 12 => Self::HsReq {
                version: data.get_u32(),
                flags: data.get_u32(),
                receiver_delay_ms: data.get_u16(),
                sender_delay_ms: data.get_u16(),
            },
            EXT_TYPE_SID => {
                let mut bytes: Vec<u8> = data
                    .chunks_exact(4)
                    .flat_map(|w| [w[3], w[2], w[1], w[0]])
                    .collect();
                while bytes.last() == Some(&0) {
                    bytes.pop();
                }
                Self::StreamId(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Self::Other {
                ext_type,
                data: Bytes::copy_from_slice(data),
            },
        }
    }
}

/// Handshake control information field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub encryption: u16,
    pub extension_field: u16,
    pub initial_sequence: u32,
    pub mtu: u32,
    pub flow_window: u32,
    pub handshake_type: u32,
    pub socket_id: u32,
    pub cookie: u32,
    pub peer_ip: [u8; 16],
    pub extensions: Vec<HandshakeExtension>,
}

impl Handshake {
    /// First caller request.
    pub fn induction(socket_id: u32, initial_sequence: u32, mtu: u32, peer_ip: [u8; 16]) -> Self {
        Self {
            version: 4,
            encryption: 0,
            extension_field: 2,
            initial_sequence,
            mtu,
            flow_window: 8192,
            handshake_type: handshake_type::INDUCTION,
            socket_id,
            cookie: 0,
            peer_ip,
            extensions: Vec::new(),
        }
    }

    /// Caller conclusion answering an induction response.
    pub fn conclusion(induction: &Self, response: &Self, stream_id: Option<&str>, latency_ms: u16) -> Self {
        let mut extensions = vec![HandshakeExtension::sender_request(latency_ms)];
        let mut extension_field = EXT_HSREQ;
        if let Some(id) = stream_id {
            extensions.push(HandshakeExtension::StreamId(id.to_string()));
            extension_field |= EXT_CONFIG;
        }
        Self {
            version: 5,
            extension_field,
            handshake_type: handshake_type::CONCLUSION,
            cookie: response.cookie,
            extensions,
            ..induction.clone()
        }
    }

    /// Returns true for the rejection handshake types.
    pub fn is_rejection(&self) -> bool {
        (handshake_type::REJECT_FIRST..=handshake_type::REJECT_LAST).contains(&self.handshake_type)
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.extensions.iter().find_map(|e| match e {
            HandshakeExtension::StreamId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE + 64);
        buf.put_u32(self.version);
        buf.put_u16(self.encryption);
        buf.put_u16(self.extension_field);
        buf.put_u32(self.initial_sequence);
        buf.put_u32(self.mtu);
        buf.put_u32(self.flow_window);
        buf.put_u32(self.handshake_type);
        buf.put_u32(self.socket_id);
        buf.put_u32(self.cookie);
        buf.put_slice(&self.peer_ip);
        for extension in &self.extensions {
            extension.write_to(&mut buf);
        }
        buf.freeze()
    }

    pub fn parse(mut buf: &[u8]) -> TransportResult<Self> {
        if buf.len() < HANDSHAKE_SIZE {
            return Err(TransportError::Protocol(format!("{} byte handshake", buf.len())));
        }
        let version = buf.get_u32();
        let encryption = buf.get_u16();
        let extension_field = buf.get_u16();
        let initial_sequence = buf.get_u32();
        let mtu = buf.get_u32();
        let flow_window = buf.get_u32();
        let handshake_type = buf.get_u32();
        let socket_id = buf.get_u32();
        let cookie = buf.get_u32();
        let mut peer_ip = [0u8; 16];
        buf.copy_to_slice(&mut peer_ip);

        let mut extensions = Vec::new();
        while buf.remaining() >= 4 {
            let ext_type = buf.get_u16();
            let len = buf.get_u16() as usize * 4;
            if buf.remaining() < len {
                return Err(TransportError::Protocol("truncated handshake extension".to_string()));
            }
            extensions.push(HandshakeExtension::parse(ext_type, &buf[..len]));
            buf.advance(len);
        }

        Ok(Self {
            version,
            encryption,
            extension_field,
            initial_sequence,
            mtu,
            flow_window,
            handshake_type,
            socket_id,
            cookie,
            peer_ip,
            extensions,
        })
    }
}
