//! Access unit model and codec framing helpers.
//!
//! Everything the publishing core knows about media lives here: the
//! encoded access unit handed over by an encoder, the immutable track
//! formats negotiated for a session, and the byte-level helpers shared by
//! the protocol packetizers and the recorder (NAL parsing, AAC
//! configuration, AMF0, FLV tag bodies and MPEG-TS muxing).

pub mod aac;
pub mod amf;
mod error;
pub mod flv;
pub mod mpegts;
pub mod nal;

pub use error::MediaError;

use bytes::Bytes;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Kind of track an access unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Returns a simple string representation of the kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Video codecs accepted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

/// Audio codecs accepted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
}

/// One encoder-produced, time-stamped frame.
///
/// The payload is an owned, immutable snapshot. Once built, an access unit
/// is moved from component to component and never aliased with a buffer
/// the encoder will reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Track this unit belongs to.
    pub kind: TrackKind,

    /// Encoded payload. H264/H265 as an Annex B stream, AAC raw or with ADTS header.
    pub data: Bytes,

    /// Presentation timestamp in microseconds from stream start.
    pub pts_us: u64,

    /// Whether this unit can be decoded on its own.
    pub is_key_frame: bool,
}

impl AccessUnit {
    /// Create a video access unit.
    pub fn video(data: impl Into<Bytes>, pts_us: u64, is_key_frame: bool) -> Self {
        Self {
            kind: TrackKind::Video,
            data: data.into(),
            pts_us,
            is_key_frame,
        }
    }

    /// Create an audio access unit. Audio frames are always independently decodable.
    pub fn audio(data: impl Into<Bytes>, pts_us: u64) -> Self {
        Self {
            kind: TrackKind::Audio,
            data: data.into(),
            pts_us,
            is_key_frame: true,
        }
    }

    /// Snapshot a borrowed encoder buffer into an owned access unit.
    pub fn copy_from_slice(kind: TrackKind, data: &[u8], pts_us: u64, is_key_frame: bool) -> Self {
        Self {
            kind,
            data: Bytes::copy_from_slice(data),
            pts_us,
            is_key_frame,
        }
    }

    /// Presentation timestamp in milliseconds.
    pub fn pts_ms(&self) -> u64 {
        self.pts_us / 1000
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Negotiated video track parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    /// Codec.
    pub codec: VideoCodec,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Frames per second.
    pub frame_rate: u32,

    /// Target bitrate in bits per second (0 when unknown).
    pub bitrate_bps: u32,

    /// Sequence parameter set, without start code.
    pub sps: Bytes,

    /// Picture parameter set, without start code.
    pub pps: Bytes,

    /// Video parameter set (H265 only), without start code.
    pub vps: Option<Bytes>,
}

impl VideoFormat {
    /// H264 format from raw SPS/PPS NAL units.
    pub fn h264(width: u32, height: u32, frame_rate: u32, sps: Bytes, pps: Bytes) -> Self {
        Self {
            codec: VideoCodec::H264,
            width,
            height,
            frame_rate,
            bitrate_bps: 0,
            sps,
            pps,
            vps: None,
        }
    }

    /// H264 format from the Annex B header block an encoder emits before its first frame.
    pub fn h264_from_annex_b(
        width: u32,
        height: u32,
        frame_rate: u32,
        headers: &[u8],
    ) -> MediaResult<Self> {
        let (sps, pps) = nal::extract_sps_pps(headers).ok_or_else(|| {
            MediaError::MissingParameterSets("SPS/PPS not found in header block".to_string())
        })?;
        Ok(Self::h264(width, height, frame_rate, sps, pps))
    }

    /// Set the target bitrate.
    pub fn with_bitrate(mut self, bitrate_bps: u32) -> Self {
        self.bitrate_bps = bitrate_bps;
        self
    }
}

/// Negotiated audio track parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Codec.
    pub codec: AudioCodec,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Number of channels.
    pub channels: u8,

    /// Target bitrate in bits per second (0 when unknown).
    pub bitrate_bps: u32,
}

impl AudioFormat {
    /// AAC-LC format.
    pub fn aac(sample_rate: u32, channels: u8) -> Self {
        Self {
            codec: AudioCodec::Aac,
            sample_rate,
            channels,
            bitrate_bps: 0,
        }
    }

    /// Set the target bitrate.
    pub fn with_bitrate(mut self, bitrate_bps: u32) -> Self {
        self.bitrate_bps = bitrate_bps;
        self
    }

    /// Returns true for more than one channel.
    pub fn is_stereo(&self) -> bool {
        self.channels > 1
    }
}

/// Format of one track, fixed once negotiation completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl TrackFormat {
    /// Track kind described by this format.
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Video(_) => TrackKind::Video,
            Self::Audio(_) => TrackKind::Audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_unit_snapshot_is_independent() {
        let mut buffer = vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88];
        let unit = AccessUnit::copy_from_slice(TrackKind::Video, &buffer, 40_000, true);
        buffer[4] = 0x41;

        assert_eq!(unit.data[4], 0x65);
        assert_eq!(unit.pts_ms(), 40);
        assert!(unit.is_key_frame);
    }

    #[test]
    fn test_audio_units_are_key_frames() {
        let unit = AccessUnit::audio(vec![1u8, 2, 3], 23_000);
        assert_eq!(unit.kind, TrackKind::Audio);
        assert!(unit.is_key_frame);
        assert_eq!(unit.len(), 3);
    }

    #[test]
    fn test_video_format_from_headers() {
        let headers = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
        ];
        let format = VideoFormat::h264_from_annex_b(1280, 720, 30, &headers).unwrap();
        assert_eq!(format.sps.as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
        assert_eq!(format.pps.as_ref(), &[0x68, 0xCE, 0x3C, 0x80]);
        assert_eq!(TrackFormat::Video(format).kind(), TrackKind::Video);
    }

    #[test]
    fn test_video_format_without_pps_fails() {
        let headers = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];
        assert!(VideoFormat::h264_from_annex_b(1280, 720, 30, &headers).is_err());
    }
}
