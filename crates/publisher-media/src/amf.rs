//! AMF0 (Action Message Format 0) encoding and decoding.
//!
//! AMF0 carries RTMP commands and the FLV `onMetaData` script tag.
//! Object properties keep insertion order, since servers read them in wire order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{MediaError, MediaResult};

/// AMF0 type markers.
mod markers {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const STRICT_ARRAY: u8 = 0x0A;
    pub const DATE: u8 = 0x0B;
    pub const LONG_STRING: u8 = 0x0C;
}

/// AMF0 data types.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    /// Milliseconds since the epoch; the timezone field is ignored.
    Date(f64),
}

impl Amf0Value {
    /// Build an object from `(key, value)` pairs.
    pub fn object<K: Into<String>>(properties: impl IntoIterator<Item = (K, Amf0Value)>) -> Self {
        Amf0Value::Object(properties.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Shorthand for a string value.
    pub fn string(value: impl Into<String>) -> Self {
        Amf0Value::String(value.into())
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric payload, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Look up a property of an object or ECMA array.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(props) | Amf0Value::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Append the encoded value to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Amf0Value::Number(n) => {
                buf.put_u8(markers::NUMBER);
                buf.put_f64(*n);
            }
            Amf0Value::Boolean(b) => {
                buf.put_u8(markers::BOOLEAN);
                buf.put_u8(u8::from(*b));
            }
            Amf0Value::String(s) => {
                if s.len() > u16::MAX as usize {
                    buf.put_u8(markers::LONG_STRING);
                    buf.put_u32(s.len() as u32);
                } else {
                    buf.put_u8(markers::STRING);
                    buf.put_u16(s.len() as u16);
                }
                buf.put_slice(s.as_bytes());
            }
            Amf0Value::Object(props) => {
                buf.put_u8(markers::OBJECT);
                write_properties(buf, props);
            }
            Amf0Value::Null => buf.put_u8(markers::NULL),
            Amf0Value::Undefined => buf.put_u8(markers::UNDEFINED),
            Amf0Value::EcmaArray(props) => {
                buf.put_u8(markers::ECMA_ARRAY);
                buf.put_u32(props.len() as u32);
                write_properties(buf, props);
            }
            Amf0Value::StrictArray(values) => {
                buf.put_u8(markers::STRICT_ARRAY);
                buf.put_u32(values.len() as u32);
                for value in values {
                    value.write_to(buf);
                }
            }
            Amf0Value::Date(ms) => {
                buf.put_u8(markers::DATE);
                buf.put_f64(*ms);
                buf.put_i16(0);
            }
        }
    }

    /// Encode a single value.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Decode one value from the front of `input`, advancing it.
    pub fn read_from(input: &mut &[u8]) -> MediaResult<Self> {
        let marker = read_u8(input)?;
        match marker {
            markers::NUMBER => Ok(Amf0Value::Number(read_f64(input)?)),
            markers::BOOLEAN => Ok(Amf0Value::Boolean(read_u8(input)? != 0)),
            markers::STRING => {
                let len = read_u16(input)? as usize;
                Ok(Amf0Value::String(read_utf8(input, len)?))
            }
            markers::LONG_STRING => {
                let len = read_u32(input)? as usize;
                Ok(Amf0Value::String(read_utf8(input, len)?))
            }
            markers::OBJECT => Ok(Amf0Value::Object(read_properties(input)?)),
            markers::NULL => Ok(Amf0Value::Null),
            markers::UNDEFINED => Ok(Amf0Value::Undefined),
            markers::ECMA_ARRAY => {
                // The count is advisory; the object-end marker terminates the list.
                let _count = read_u32(input)?;
                Ok(Amf0Value::EcmaArray(read_properties(input)?))
            }
            markers::STRICT_ARRAY => {
                let count = read_u32(input)? as usize;
                let mut values = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    values.push(Amf0Value::read_from(input)?);
                }
                Ok(Amf0Value::StrictArray(values))
            }
            markers::DATE => {
                let ms = read_f64(input)?;
                let _timezone = read_u16(input)?;
                Ok(Amf0Value::Date(ms))
            }
            other => Err(MediaError::AmfDecode(format!(
                "unsupported marker 0x{other:02x}"
            ))),
        }
    }
}

/// Encode a sequence of values back to back, as RTMP command bodies are laid out.
pub fn encode_all(values: &[Amf0Value]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        value.write_to(&mut buf);
    }
    buf.freeze()
}

/// Decode every value in `data`.
pub fn decode_all(mut data: &[u8]) -> MediaResult<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while !data.is_empty() {
        values.push(Amf0Value::read_from(&mut data)?);
    }
    Ok(values)
}

fn write_properties(buf: &mut BytesMut, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        value.write_to(buf);
    }
    buf.put_slice(&[0x00, 0x00, markers::OBJECT_END]);
}

fn read_properties(input: &mut &[u8]) -> MediaResult<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let key_len = read_u16(input)? as usize;
        if key_len == 0 {
            if input.first() == Some(&markers::OBJECT_END) {
                input.advance(1);
                return Ok(props);
            }
            return Err(MediaError::AmfDecode("empty property name".to_string()));
        }
        let key = read_utf8(input, key_len)?;
        let value = Amf0Value::read_from(input)?;
        props.push((key, value));
    }
}

fn ensure(input: &[u8], len: usize) -> MediaResult<()> {
    if input.len() < len {
        return Err(MediaError::AmfDecode(format!(
            "truncated input: need {len} bytes, have {}",
            input.len()
        )));
    }
    Ok(())
}

fn read_u8(input: &mut &[u8]) -> MediaResult<u8> {
    ensure(input, 1)?;
    Ok(input.get_u8())
}

fn read_u16(input: &mut &[u8]) -> MediaResult<u16> {
    ensure(input, 2)?;
    Ok(input.get_u16())
}

fn read_u32(input: &mut &[u8]) -> MediaResult<u32> {
    ensure(input, 4)?;
    Ok(input.get_u32())
}

fn read_f64(input: &mut &[u8]) -> MediaResult<f64> {
    ensure(input, 8)?;
    Ok(input.get_f64())
}

fn read_utf8(input: &mut &[u8], len: usize) -> MediaResult<String> {
    ensure(input, len)?;
    let text = String::from_utf8_lossy(&input[..len]).into_owned();
    input.advance(len);
    Ok(text)
}
