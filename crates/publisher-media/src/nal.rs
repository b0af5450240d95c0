//! NAL unit parsing for H.264 and H.265 access units.
//!
//! Encoders hand the core Annex B streams: NAL units separated by
//! `00 00 01` or `00 00 00 01` start codes. RTMP/FLV wants AVCC (4-byte
//! length prefixes), RTP wants the bare NAL units, and the recorder only
//! needs to know whether an access unit starts a new GOP. All three views
//! are built from the helpers in this module.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{MediaError, MediaResult, VideoCodec};

/// H.264 NAL unit types the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

/// H.265 NAL unit types the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HevcNalUnitType {
    /// IDR picture with leading pictures (IDR_W_RADL).
    IdrWRadl = 19,
    /// IDR picture without leading pictures (IDR_N_LP).
    IdrNLp = 20,
    /// Video Parameter Set.
    Vps = 32,
    /// Sequence Parameter Set.
    Sps = 33,
    /// Picture Parameter Set.
    Pps = 34,
    /// Access Unit Delimiter.
    Aud = 35,
    /// Anything else.
    Other = 0xFF,
}

impl From<u8> for HevcNalUnitType {
    fn from(header: u8) -> Self {
        match (header >> 1) & 0x3F {
            19 => HevcNalUnitType::IdrWRadl,
            20 => HevcNalUnitType::IdrNLp,
            32 => HevcNalUnitType::Vps,
            33 => HevcNalUnitType::Sps,
            34 => HevcNalUnitType::Pps,
            35 => HevcNalUnitType::Aud,
            _ => HevcNalUnitType::Other,
        }
    }
}

/// A single H.264 NAL unit, sharing storage with the access unit it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    /// The NAL unit type.
    pub nal_type: NalUnitType,
    /// NAL header byte plus payload, no start code.
    pub data: Bytes,
}

/// Locate the next start code at or after `from`, returning `(position, length)`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Byte ranges of every NAL unit in an Annex B buffer.
///
/// A buffer without any start code is treated as one bare NAL unit.
fn nal_ranges(data: &[u8]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let Some((mut pos, mut len)) = find_start_code(data, 0) else {
        if !data.is_empty() {
            ranges.push((0, data.len()));
        }
        return ranges;
    };

    loop {
        let start = pos + len;
        match find_start_code(data, start) {
            Some((next, next_len)) => {
                if next > start {
                    ranges.push((start, next));
                }
                pos = next;
                len = next_len;
            }
            None => {
                if data.len() > start {
                    ranges.push((start, data.len()));
                }
                break;
            }
        }
    }
    ranges
}

/// Split an Annex B buffer into NAL unit slices (no start codes).
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    nal_ranges(data)
        .into_iter()
        .map(|(start, end)| &data[start..end])
        .collect()
}

/// Parse an Annex B H.264 stream into NAL units without copying the payload.
pub fn parse_annex_b(data: &Bytes) -> Vec<NalUnit> {
    nal_ranges(data)
        .into_iter()
        .map(|(start, end)| {
            let nal = data.slice(start..end);
            NalUnit {
                nal_type: NalUnitType::from(nal[0]),
                data: nal,
            }
        })
        .collect()
}

/// Whether an access unit contains an IDR picture.
///
/// H.264 checks for NAL type 5. H.265 checks for IDR_W_RADL and IDR_N_LP.
pub fn is_key_frame(codec: VideoCodec, data: &[u8]) -> bool {
    split_annex_b(data).into_iter().any(|nal| match codec {
        VideoCodec::H264 => NalUnitType::from(nal[0]) == NalUnitType::IdrSlice,
        VideoCodec::H265 => matches!(
            HevcNalUnitType::from(nal[0]),
            HevcNalUnitType::IdrWRadl | HevcNalUnitType::IdrNLp
        ),
    })
}

/// Returns true for NAL units that belong in the decoder configuration rather than a frame.
pub fn is_parameter_set(codec: VideoCodec, header: u8) -> bool {
    match codec {
        VideoCodec::H264 => matches!(
            NalUnitType::from(header),
            NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
        ),
        VideoCodec::H265 => matches!(
            HevcNalUnitType::from(header),
            HevcNalUnitType::Vps | HevcNalUnitType::Sps | HevcNalUnitType::Pps | HevcNalUnitType::Aud
        ),
    }
}

/// Convert an Annex B access unit to AVCC with 4-byte length prefixes.
///
/// Parameter sets and delimiters are dropped; they travel in the sequence header.
pub fn annex_b_to_avcc(codec: VideoCodec, data: &[u8]) -> Bytes {
    let nals: Vec<&[u8]> = split_annex_b(data)
        .into_iter()
        .filter(|nal| !is_parameter_set(codec, nal[0]))
        .collect();

    let mut buf = BytesMut::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
    }
    buf.freeze()
}

/// Extract SPS and PPS NAL units from an Annex B header block.
pub fn extract_sps_pps(annex_b_headers: &[u8]) -> Option<(Bytes, Bytes)> {
    let mut sps: Option<Bytes> = None;
    let mut pps: Option<Bytes> = None;

    for nal in split_annex_b(annex_b_headers) {
        match NalUnitType::from(nal[0]) {
            NalUnitType::Sps => {
                debug!(len = nal.len(), "Found SPS NAL unit");
                sps = Some(Bytes::copy_from_slice(nal));
            }
            NalUnitType::Pps => {
                debug!(len = nal.len(), "Found PPS NAL unit");
                pps = Some(Bytes::copy_from_slice(nal));
            }
            _ => {}
        }
    }

    sps.zip(pps)
}

/// Build an AVC Decoder Configuration Record (ISO 14496-15) from SPS and PPS.
///
/// Layout:
/// - configurationVersion (0x01)
/// - profile, compatibility, level copied from SPS bytes 1..4
/// - 0xFF: 4-byte NAL length prefixes
/// - 0xE1: one SPS, then its u16 length and bytes
/// - 0x01: one PPS, then its u16 length and bytes
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> MediaResult<Bytes> {
    if sps.len() < 4 {
        return Err(MediaError::InvalidNal(format!(
            "SPS too short: {} bytes",
            sps.len()
        )));
    }
    if pps.is_empty() {
        return Err(MediaError::MissingParameterSets("empty PPS".to_string()));
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01);
    buf.put_slice(&sps[1..4]);
    buf.put_u8(0xFF);
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);

    debug!(
        sps_len = sps.len(),
        pps_len = pps.len(),
        total_len = buf.len(),
        "Built AVC decoder configuration record"
    );

    Ok(buf.freeze())
}
