//! RTMP message types, protocol control messages and AMF0 commands.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use publisher_media::amf::{self, Amf0Value};

use super::chunk::RtmpMessage;
use crate::error::TransportError;
use crate::TransportResult;

/// RTMP message type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SetChunkSize,
    Abort,
    Acknowledgement,
    UserControl,
    WindowAckSize,
    SetPeerBandwidth,
    Audio,
    Video,
    DataAmf3,
    SharedObjectAmf3,
    CommandAmf3,
    DataAmf0,
    SharedObjectAmf0,
    CommandAmf0,
    Aggregate,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(id: u8) -> Self {
        match id {
            1 => Self::SetChunkSize,
            2 => Self::Abort,
            3 => Self::Acknowledgement,
            4 => Self::UserControl,
            5 => Self::WindowAckSize,
            6 => Self::SetPeerBandwidth,
            8 => Self::Audio,
            9 => Self::Video,
            15 => Self::DataAmf3,
            16 => Self::SharedObjectAmf3,
            17 => Self::CommandAmf3,
            18 => Self::DataAmf0,
            19 => Self::SharedObjectAmf0,
            20 => Self::CommandAmf0,
            22 => Self::Aggregate,
            other => Self::Unknown(other),
        }
    }
}

impl MessageType {
    /// Wire id.
    pub fn id(self) -> u8 {
        match self {
            Self::SetChunkSize => 1,
            Self::Abort => 2,
            Self::Acknowledgement => 3,
            Self::UserControl => 4,
            Self::WindowAckSize => 5,
            Self::SetPeerBandwidth => 6,
            Self::Audio => 8,
            Self::Video => 9,
            Self::DataAmf3 => 15,
            Self::SharedObjectAmf3 => 16,
            Self::CommandAmf3 => 17,
            Self::DataAmf0 => 18,
            Self::SharedObjectAmf0 => 19,
            Self::CommandAmf0 => 20,
            Self::Aggregate => 22,
            Self::Unknown(id) => id,
        }
    }
}

/// User control event types.
pub mod user_control {
    pub const STREAM_BEGIN: u16 = 0;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

fn control(kind: MessageType, value: u32) -> RtmpMessage {
    RtmpMessage::new(kind.id(), 0, 0, value.to_be_bytes().to_vec())
}

/// `SetChunkSize` announcing our outgoing chunk size.
pub fn set_chunk_size(size: u32) -> RtmpMessage {
    control(MessageType::SetChunkSize, size & 0x7FFF_FFFF)
}

/// `WindowAckSize`.
pub fn window_ack_size(size: u32) -> RtmpMessage {
    control(MessageType::WindowAckSize, size)
}

/// `Acknowledgement` of `sequence` bytes received.
pub fn acknowledgement(sequence: u32) -> RtmpMessage {
    control(MessageType::Acknowledgement, sequence)
}

/// User control `PingResponse` echoing the request timestamp.
pub fn ping_response(timestamp: u32) -> RtmpMessage {
    let mut body = BytesMut::with_capacity(6);
    body.put_u16(user_control::PING_RESPONSE);
    body.put_u32(timestamp);
    RtmpMessage::new(MessageType::UserControl.id(), 0, 0, body.freeze())
}

/// Read the 4-byte big-endian value of a protocol control message.
pub fn control_value(message: &RtmpMessage) -> TransportResult<u32> {
    let mut payload = &message.payload[..];
    if payload.len() < 4 {
        return Err(TransportError::Protocol(format!(
            "control message type {} too short",
            message.type_id
        )));
    }
    Ok(payload.get_u32())
}

/// A parsed user control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserControlEvent {
    pub event_type: u16,
    pub value: u32,
}

impl UserControlEvent {
    pub fn parse(message: &RtmpMessage) -> TransportResult<Self> {
        let mut payload = &message.payload[..];
        if payload.len() < 6 {
            return Err(TransportError::Protocol("user control message too short".to_string()));
        }
        Ok(Self {
            event_type: payload.get_u16(),
            value: payload.get_u32(),
        })
    }
}

/// Build an AMF0 command message.
pub fn command(
    name: &str,
    transaction_id: u32,
    command_object: Amf0Value,
    args: impl IntoIterator<Item = Amf0Value>,
    stream_id: u32,
) -> RtmpMessage {
    let mut values = vec![
        Amf0Value::string(name),
        Amf0Value::Number(transaction_id as f64),
        command_object,
    ];
    values.extend(args);
    RtmpMessage::new(MessageType::CommandAmf0.id(), 0, stream_id, amf::encode_all(&values))
}

/// Build an AMF0 data message.
pub fn data(values: &[Amf0Value], stream_id: u32) -> RtmpMessage {
    RtmpMessage::new(MessageType::DataAmf0.id(), 0, stream_id, amf::encode_all(values))
}

/// A command received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: u32,
    pub command_object: Amf0Value,
    pub args: Vec<Amf0Value>,
}

impl Command {
    /// Decode an AMF0 or AMF3-wrapped command message.
    pub fn parse(message: &RtmpMessage) -> TransportResult<Self> {
        let body: Bytes = match MessageType::from(message.type_id) {
            // AMF3 command bodies start with a format selector byte, then AMF0.
            MessageType::CommandAmf3 => message.payload.slice(1.min(message.payload.len())..),
            _ => message.payload.clone(),
        };
        let mut values = amf::decode_all(&body)?.into_iter();

        let name = values
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| TransportError::Protocol("command without a name".to_string()))?;
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0) as u32;
        let command_object = values.next().unwrap_or(Amf0Value::Null);

        Ok(Self {
            name,
            transaction_id,
            command_object,
            args: values.collect(),
        })
    }

    fn info(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .chain(std::iter::once(&self.command_object))
            .find_map(|v| v.get(key))
            .and_then(Amf0Value::as_str)
    }

    /// `code` of the info object.
    pub fn code(&self) -> Option<&str> {
        self.info("code")
    }

    /// `description` of the info object.
    pub fn description(&self) -> Option<&str> {
        self.info("description")
    }

    /// `level` of the info object.
    pub fn level(&self) -> Option<&str> {
        self.info("level")
    }

    /// Stream id carried by a `createStream` result.
    pub fn stream_id(&self) -> Option<u32> {
        self.args.first().and_then(Amf0Value::as_number).map(|n| n as u32)
    }
}
