//! RTMP chunk framing.
//!
//! Chunk basic header: `fmt (2 bits) | csid (6 bits)`, with one or two
//! extra bytes for chunk stream ids of 64 and above. Message header by fmt:
//!
//! | fmt | fields                                                          |
//! |-----|-----------------------------------------------------------------|
//! | 0   | timestamp (3), length (3), type id (1), stream id (4, LE)       |
//! | 1   | timestamp delta (3), length (3), type id (1)                    |
//! | 2   | timestamp delta (3)                                             |
//! | 3   | none, continuation                                              |
//!
//! A 3-byte timestamp field of `0xFFFFFF` means a 4-byte extended
//! timestamp follows, and every continuation chunk of that message repeats it.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::TransportResult;

/// 3-byte timestamp value announcing an extended timestamp.
pub const EXTENDED_TIMESTAMP: u32 = 0x00FF_FFFF;

/// Chunk size both peers start with.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// One RTMP message, before chunking or after reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    /// Message type id.
    pub type_id: u8,
    /// Timestamp in milliseconds.
    pub timestamp: u32,
    /// Message stream id.
    pub stream_id: u32,
    /// Message body.
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(type_id: u8, timestamp: u32, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            timestamp,
            stream_id,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Header {
    timestamp: u32,
    length: u32,
    type_id: u8,
    stream_id: u32,
}

fn put_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        0..=63 => buf.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            buf.put_u8(fmt << 6);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            buf.put_u8((fmt << 6) | 1);
            buf.put_u16_le((csid - 64) as u16);
        }
    }
}

/// Splits outgoing messages into chunks, compressing headers per chunk stream.
#[derive(Debug)]
pub struct ChunkWriter {
    chunk_size: usize,
    last: HashMap<u32, Header>,
}

impl ChunkWriter {
    /// Create a writer with the given outgoing chunk size.
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, EXTENDED_TIMESTAMP) as usize,
            last: HashMap::new(),
        }
    }

    /// Outgoing chunk size.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size as u32
    }

    /// Forget the last header on `csid` so its next message starts with a full header.
    pub fn invalidate(&mut self, csid: u32) {
        self.last.remove(&csid);
    }

    /// Forget every chunk stream.
    pub fn reset(&mut self) {
        self.last.clear();
    }

    /// Chunk one message on `csid`.
    ///
    /// A message continuing the previous one on the same message stream is
    /// sent with a timestamp delta (fmt 1, or fmt 2 when length and type
    /// repeat). Otherwise, or when the delta would not fit in 3 bytes, a
    /// full fmt 0 header with the absolute timestamp is used.
    pub fn write_message(&mut self, csid: u32, message: &RtmpMessage) -> Bytes {
        let length = message.payload.len() as u32;
        let previous = self.last.get(&csid).copied();

        let (fmt, timestamp_field) = match previous {
            Some(prev)
                if prev.stream_id == message.stream_id
                    && message.timestamp >= prev.timestamp
                    && message.timestamp - prev.timestamp < EXTENDED_TIMESTAMP =>
            {
                let delta = message.timestamp - prev.timestamp;
                if prev.length == length && prev.type_id == message.type_id {
                    (2, delta)
                } else {
                    (1, delta)
                }
            }
            _ => (0, message.timestamp),
        };
        let extended = timestamp_field >= EXTENDED_TIMESTAMP;
        let short_field = timestamp_field.min(EXTENDED_TIMESTAMP);

        let chunks = message.payload.len().div_ceil(self.chunk_size).max(1);
        let mut buf = BytesMut::with_capacity(message.payload.len() + 18 + chunks * 8);

        put_basic_header(&mut buf, fmt, csid);
        buf.put_uint(short_field as u64, 3);
        if fmt <= 1 {
            buf.put_uint(length as u64, 3);
            buf.put_u8(message.type_id);
        }
        if fmt == 0 {
            buf.put_u32_le(message.stream_id);
        }
        if extended {
            buf.put_u32(timestamp_field);
        }

        for (i, chunk) in message.payload.chunks(self.chunk_size).enumerate() {
            if i > 0 {
                put_basic_header(&mut buf, 3, csid);
                if extended {
                    buf.put_u32(timestamp_field);
                }
            }
            buf.put_slice(chunk);
        }

        self.last.insert(
            csid,
            Header {
                timestamp: message.timestamp,
                length,
                type_id: message.type_id,
                stream_id: message.stream_id,
            },
        );
        buf.freeze()
    }
}

#[derive(Debug, Default)]
struct ReadStream {
    header: Header,
    delta: u32,
    extended: bool,
    payload: BytesMut,
}

enum Step {
    Incomplete,
    Partial,
    Message(RtmpMessage),
}

/// Reassembles incoming chunks into messages.
///
/// Bytes are fed as they arrive; a chunk is only consumed once it is complete.
#[derive(Debug)]
pub struct ChunkReader {
    chunk_size: usize,
    buffer: BytesMut,
    streams: HashMap<u32, ReadStream>,
    bytes_received: u64,
    last_csid: u32,
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer: BytesMut::with_capacity(4096),
            streams: HashMap::new(),
            bytes_received: 0,
            last_csid: 0,
        }
    }

    /// Apply the peer's `SetChunkSize`.
    pub fn set_chunk_size(&mut self, chunk_size: u32) {
        self.chunk_size = chunk_size.clamp(1, 0x7FFF_FFFF) as usize;
    }

    /// Total bytes fed so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Chunk stream id of the last completed message.
    pub fn last_chunk_stream_id(&self) -> u32 {
        self.last_csid
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.bytes_received += data.len() as u64;
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> TransportResult<Option<RtmpMessage>> {
        loop {
            match self.read_chunk()? {
                Step::Incomplete => return Ok(None),
                Step::Partial => continue,
                Step::Message(message) => return Ok(Some(message)),
            }
        }
    }

    fn read_chunk(&mut self) -> TransportResult<Step> {
        let buf = &self.buffer[..];
        let Some(&first) = buf.first() else {
            return Ok(Step::Incomplete);
        };
        let fmt = first >> 6;
        let (csid, mut pos) = match first & 0x3F {
            0 if buf.len() >= 2 => (64 + buf[1] as u32, 2),
            1 if buf.len() >= 3 => (64 + buf[1] as u32 + ((buf[2] as u32) << 8), 3),
            0 | 1 => return Ok(Step::Incomplete),
            id => (id as u32, 1),
        };

        let header_len = [11, 7, 3, 0][fmt as usize];
        if buf.len() < pos + header_len {
            return Ok(Step::Incomplete);
        }
        let mut fields = &buf[pos..pos + header_len];
        pos += header_len;

        let stream = self.streams.get(&csid);
        if fmt != 0 && stream.is_none() {
            return Err(TransportError::Protocol(format!(
                "chunk fmt {fmt} on unknown chunk stream {csid}"
            )));
        }
        let mut header = stream.map(|s| s.header).unwrap_or_default();
        let mut delta = stream.map(|s| s.delta).unwrap_or_default();
        let starts_message = stream.map_or(true, |s| s.payload.is_empty());

        let mut timestamp_field = 0;
        if fmt <= 2 {
            timestamp_field = fields.get_uint(3) as u32;
        }
        if fmt <= 1 {
            header.length = fields.get_uint(3) as u32;
            header.type_id = fields.get_u8();
        }
        if fmt == 0 {
            header.stream_id = fields.get_u32_le();
        }

        let extended = match fmt {
            3 => stream.is_some_and(|s| s.extended),
            _ => timestamp_field == EXTENDED_TIMESTAMP,
        };
        if extended {
            if buf.len() < pos + 4 {
                return Ok(Step::Incomplete);
            }
            let value = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            pos += 4;
            if fmt != 3 {
                timestamp_field = value;
            }
        }

        match fmt {
            0 => {
                header.timestamp = timestamp_field;
                delta = 0;
            }
            1 | 2 => {
                delta = timestamp_field;
                header.timestamp = header.timestamp.wrapping_add(delta);
            }
            _ if starts_message => header.timestamp = header.timestamp.wrapping_add(delta),
            _ => {}
        }

        let received = stream.map_or(0, |s| s.payload.len());
        let take = (header.length as usize)
            .saturating_sub(received)
            .min(self.chunk_size);
        if buf.len() < pos + take {
            return Ok(Step::Incomplete);
        }

        self.buffer.advance(pos);
        let body = self.buffer.split_to(take);
        let stream = self.streams.entry(csid).or_default();
        stream.header = header;
        stream.delta = delta;
        stream.extended = extended;
        stream.payload.extend_from_slice(&body);

        if stream.payload.len() < header.length as usize {
            return Ok(Step::Partial);
        }
        let payload = stream.payload.split().freeze();
        self.last_csid = csid;
        Ok(Step::Message(RtmpMessage {
            type_id: header.type_id,
            timestamp: header.timestamp,
            stream_id: header.stream_id,
            payload,
        }))
    }
}
