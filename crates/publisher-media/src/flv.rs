//! FLV tag bodies and file framing.
//!
//! RTMP audio/video messages carry exactly the body of an FLV tag, so the
//! same builders serve the RTMP packetizer and the FLV recorder:
//!
//! - Video body: `frame type (4) | codec id (4)`, AVC packet type, 24-bit
//!   composition time, then either an AVC decoder configuration record or
//!   AVCC NAL units.
//! - Audio body: `format (4) | rate (2) | size (1) | channels (1)`, AAC packet
//!   type, then either the AudioSpecificConfig or one raw AAC frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::amf::Amf0Value;
use crate::{aac, nal, AccessUnit, AudioFormat, MediaError, MediaResult, VideoCodec, VideoFormat};

/// FLV codec id for AVC.
pub const CODEC_ID_AVC: u8 = 7;

/// FLV sound format for AAC.
pub const SOUND_FORMAT_AAC: u8 = 10;

/// FLV tag types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagType {
    Audio = 8,
    Video = 9,
    Script = 0x12,
}

/// Build an FLV video tag body around `data`.
pub fn build_video_tag(
    data: &[u8],
    is_keyframe: bool,
    is_sequence_header: bool,
    composition_time: i32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    let frame_type = if is_keyframe { 0x10 } else { 0x20 };
    buf.put_u8(frame_type | CODEC_ID_AVC);
    buf.put_u8(if is_sequence_header { 0x00 } else { 0x01 });
    // signed 24-bit
    let ct = (composition_time as u32) & 0x00FF_FFFF;
    buf.put_uint(ct as u64, 3);
    buf.put_slice(data);
    buf.freeze()
}

/// AVC sequence header tag body for a video format.
pub fn avc_sequence_header(format: &VideoFormat) -> MediaResult<Bytes> {
    if format.codec != VideoCodec::H264 {
        return Err(MediaError::InvalidInput(format!(
            "{:?} cannot be carried in an FLV video tag",
            format.codec
        )));
    }
    let config = nal::build_avc_decoder_config(&format.sps, &format.pps)?;
    Ok(build_video_tag(&config, true, true, 0))
}

/// Video tag body for one Annex B access unit, or `None` if it held only parameter sets.
pub fn avc_frame_tag(unit: &AccessUnit) -> Option<Bytes> {
    let avcc = nal::annex_b_to_avcc(VideoCodec::H264, &unit.data);
    if avcc.is_empty() {
        return None;
    }
    Some(build_video_tag(&avcc, unit.is_key_frame, false, 0))
}

/// First byte of every AAC audio tag body.
pub fn audio_tag_header(format: &AudioFormat) -> u8 {
    // AAC is always signalled as 44 kHz / 16-bit; the real values live in the AudioSpecificConfig.
    let rate = 3;
    let size = 1;
    let channels = u8::from(format.is_stereo());
    (SOUND_FORMAT_AAC << 4) | (rate << 2) | (size << 1) | channels
}

/// AAC sequence header tag body.
pub fn aac_sequence_header(format: &AudioFormat) -> MediaResult<Bytes> {
    let config = aac::audio_specific_config(format.sample_rate, format.channels)?;
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(audio_tag_header(format));
    buf.put_u8(0x00);
    buf.put_slice(&config);
    Ok(buf.freeze())
}

/// Audio tag body for one AAC frame. ADTS headers are stripped.
pub fn aac_frame_tag(format: &AudioFormat, data: &[u8]) -> Bytes {
    let raw = aac::strip_adts(data);
    let mut buf = BytesMut::with_capacity(2 + raw.len());
    buf.put_u8(audio_tag_header(format));
    buf.put_u8(0x01);
    buf.put_slice(raw);
    buf.freeze()
}

/// `onMetaData` properties describing the stream.
pub fn metadata(video: Option<&VideoFormat>, audio: Option<&AudioFormat>) -> Amf0Value {
    let mut props: Vec<(String, Amf0Value)> = vec![("duration".into(), Amf0Value::Number(0.0))];

    if let Some(video) = video {
        props.extend([
            ("width".into(), Amf0Value::Number(video.width as f64)),
            ("height".into(), Amf0Value::Number(video.height as f64)),
            ("videocodecid".into(), Amf0Value::Number(CODEC_ID_AVC as f64)),
            ("framerate".into(), Amf0Value::Number(video.frame_rate as f64)),
            (
                "videodatarate".into(),
                Amf0Value::Number(video.bitrate_bps as f64 / 1000.0),
            ),
        ]);
    }

    if let Some(audio) = audio {
        props.extend([
            ("audiocodecid".into(), Amf0Value::Number(SOUND_FORMAT_AAC as f64)),
            ("audiosamplerate".into(), Amf0Value::Number(audio.sample_rate as f64)),
            ("audiosamplesize".into(), Amf0Value::Number(16.0)),
            (
                "audiodatarate".into(),
                Amf0Value::Number(audio.bitrate_bps as f64 / 1000.0),
            ),
            ("stereo".into(), Amf0Value::Boolean(audio.is_stereo())),
        ]);
    }

    props.push(("filesize".into(), Amf0Value::Number(0.0)));
    Amf0Value::EcmaArray(props)
}

/// FLV file header followed by the zero PreviousTagSize0 field.
pub fn file_header(has_video: bool, has_audio: bool) -> [u8; 13] {
    let flags = (u8::from(has_audio) << 2) | u8::from(has_video);
    [
        b'F', b'L', b'V', 0x01, flags, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
    ]
}

/// A complete FLV tag: 11-byte header, body, then the 4-byte PreviousTagSize.
pub fn build_tag(tag_type: TagType, timestamp_ms: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(15 + body.len());
    buf.put_u8(tag_type as u8);
    buf.put_uint(body.len() as u64, 3);
    buf.put_uint((timestamp_ms & 0x00FF_FFFF) as u64, 3);
    buf.put_u8((timestamp_ms >> 24) as u8);
    buf.put_uint(0, 3); // stream id
    buf.put_slice(body);
    buf.put_u32((11 + body.len()) as u32);
    buf.freeze()
}

/// Script tag body carrying `onMetaData`.
pub fn metadata_body(metadata: &Amf0Value) -> Bytes {
    let mut buf = BytesMut::new();
    Amf0Value::string("onMetaData").write_to(&mut buf);
    metadata.write_to(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf;

    fn h264_format() -> VideoFormat {
        VideoFormat::h264(
            1280,
            720,
            30,
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
        )
    }

    #[test]
    fn test_video_tag_keyframe() {
        let tag = build_video_tag(&[0x65, 0x88, 0x84], true, false, 0);
        assert_eq!(tag.as_ref(), &[0x17, 0x01, 0x00, 0x00, 0x00, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_video_tag_inter_frame_composition_time() {
        let tag = build_video_tag(&[0x41], false, false, -1);
        assert_eq!(&tag[..5], &[0x27, 0x01, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_avc_sequence_header() {
        let tag = avc_sequence_header(&h264_format()).unwrap();
        assert_eq!(&tag[..2], &[0x17, 0x00]);
        assert_eq!(tag[5], 0x01); // configurationVersion
    }

    #[test]
    fn test_parameter_set_only_unit_has_no_frame_tag() {
        let unit = AccessUnit::video(
            vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E],
            0,
            false,
        );
        assert!(avc_frame_tag(&unit).is_none());
    }

    #[test]
    fn test_aac_tags() {
        let format = AudioFormat::aac(44100, 2);
        assert_eq!(
            aac_sequence_header(&format).unwrap().as_ref(),
            &[0xAF, 0x00, 0x12, 0x10]
        );
        assert_eq!(aac_frame_tag(&format, &[0x21, 0x00]).as_ref(), &[0xAF, 0x01, 0x21, 0x00]);
        assert_eq!(audio_tag_header(&AudioFormat::aac(44100, 1)), 0xAE);
    }

    #[test]
    fn test_file_header_flags() {
        assert_eq!(file_header(true, true)[4], 0x05);
        assert_eq!(file_header(false, true)[4], 0x04);
        assert_eq!(file_header(true, false)[4], 0x01);
        assert_eq!(&file_header(true, true)[5..9], &[0, 0, 0, 9]);
    }

    #[test]
    fn test_build_tag_layout() {
        let tag = build_tag(TagType::Video, 0x0102_0304, &[0xAA, 0xBB]);
        assert_eq!(tag[0], 9);
        assert_eq!(&tag[1..4], &[0x00, 0x00, 0x02]);
        assert_eq!(&tag[4..7], &[0x02, 0x03, 0x04]);
        assert_eq!(tag[7], 0x01);
        assert_eq!(&tag[8..11], &[0, 0, 0]);
        assert_eq!(&tag[11..13], &[0xAA, 0xBB]);
        assert_eq!(&tag[13..], &[0x00, 0x00, 0x00, 13]);
    }

    #[test]
    fn test_metadata_contents() {
        let format = h264_format().with_bitrate(2_500_000);
        let audio = AudioFormat::aac(48000, 2);
        let meta = metadata(Some(&format), Some(&audio));

        assert_eq!(meta.get("width").and_then(Amf0Value::as_number), Some(1280.0));
        assert_eq!(meta.get("videodatarate").and_then(Amf0Value::as_number), Some(2500.0));
        assert_eq!(meta.get("audiocodecid").and_then(Amf0Value::as_number), Some(10.0));
        assert_eq!(meta.get("stereo"), Some(&Amf0Value::Boolean(true)));

        let body = metadata_body(&meta);
        let values = amf::decode_all(&body).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
    }
}
