//! SDP body for `ANNOUNCE`.

use std::fmt::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use publisher_media::{aac, AudioFormat, MediaResult, TrackKind, VideoFormat};

use super::{rtp, track_id};

/// Dynamic payload type of a track.
pub fn payload_type(kind: TrackKind) -> u8 {
    96 + track_id(kind)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02X}");
        out
    })
}

/// Describe the session's tracks. `host` goes in the connection line.
pub fn describe(
    host: &str,
    video: Option<&VideoFormat>,
    audio: Option<&AudioFormat>,
) -> MediaResult<String> {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
    sdp.push_str("s=Unnamed\r\n");
    sdp.push_str("i=N/A\r\n");
    sdp.push_str(&format!("c=IN IP4 {host}\r\n"));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=recvonly\r\n");

    if let Some(video) = video {
        let pt = payload_type(TrackKind::Video);
        let profile = video.sps.get(1..4).map(hex).unwrap_or_default();
        sdp.push_str(&format!("m=video 0 RTP/AVP {pt}\r\n"));
        sdp.push_str(&format!("a=rtpmap:{pt} H264/{}\r\n", rtp::VIDEO_CLOCK_RATE));
        sdp.push_str(&format!(
            "a=fmtp:{pt} packetization-mode=1; sprop-parameter-sets={},{}; profile-level-id={profile}\r\n",
            STANDARD.encode(&video.sps),
            STANDARD.encode(&video.pps),
        ));
        sdp.push_str(&format!("a=control:streamid={}\r\n", track_id(TrackKind::Video)));
    }

    if let Some(audio) = audio {
        let pt = payload_type(TrackKind::Audio);
        let config = aac::audio_specific_config(audio.sample_rate, audio.channels)?;
        sdp.push_str(&format!("m=audio 0 RTP/AVP {pt}\r\n"));
        sdp.push_str(&format!(
            "a=rtpmap:{pt} MPEG4-GENERIC/{}/{}\r\n",
            audio.sample_rate, audio.channels
        ));
        sdp.push_str(&format!(
            "a=fmtp:{pt} profile-level-id=1; mode=AAC-hbr; config={}; sizelength=13; indexlength=3; indexdeltalength=3\r\n",
            hex(&config)
        ));
        sdp.push_str(&format!("a=control:streamid={}\r\n", track_id(TrackKind::Audio)));
    }

    Ok(sdp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_describe_both_tracks() {
        let video = VideoFormat::h264(
            1280,
            720,
            30,
            Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAC]),
            Bytes::from_static(&[0x68, 0xEE, 0x3C, 0xB0]),
        );
        let audio = AudioFormat::aac(44100, 2);
        let sdp = describe("10.0.0.1", Some(&video), Some(&audio)).unwrap();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 10.0.0.1\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("sprop-parameter-sets=Z2QAH6w=,aO48sA==; profile-level-id=64001F"));
        assert!(sdp.contains("a=control:streamid=0\r\n"));
        assert!(sdp.contains("a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n"));
        assert!(sdp.contains("config=1210; sizelength=13"));
        assert!(sdp.ends_with("a=control:streamid=1\r\n"));
    }

    #[test]
    fn test_describe_audio_only_rejects_bad_rate() {
        assert!(describe("h", None, Some(&AudioFormat::aac(12345, 1))).is_err());
        let sdp = describe("h", None, Some(&AudioFormat::aac(48000, 1))).unwrap();
        assert!(!sdp.contains("m=video"));
    }
}
