//! MPEG-2 transport stream muxing.
//!
//! Produces 188-byte TS packets for one program with at most one video
//! (H.264/H.265) and one AAC track. PAT/PMT are repeated ahead of every video
//! key frame (or periodically for audio-only streams), PES packets carry a
//! 90 kHz PTS, and the PCR rides on the video track.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{aac, nal, AccessUnit, AudioFormat, MediaResult, TrackKind, VideoCodec, VideoFormat};

/// Size of one transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;

const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const PROGRAM_NUMBER: u16 = 1;

const VIDEO_STREAM_ID: u8 = 0xE0;
const AUDIO_STREAM_ID: u8 = 0xC0;

/// Audio units between PAT/PMT repetitions when there is no video track.
const PSI_INTERVAL_UNITS: u32 = 40;

/// Elementary stream types written to the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    AacAdts = 0x0F,
    H264 = 0x1B,
    H265 = 0x24,
}

impl From<VideoCodec> for StreamType {
    fn from(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => StreamType::H264,
            VideoCodec::H265 => StreamType::H265,
        }
    }
}

/// CRC-32/MPEG-2 (poly 0x04C11DB7, no reflection, no final xor).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Transport stream muxer for one program.
#[derive(Debug)]
pub struct TsMuxer {
    video: Option<VideoFormat>,
    audio: Option<AudioFormat>,
    continuity: [u8; 4],
    units_since_psi: u32,
    psi_sent: bool,
}

impl TsMuxer {
    /// Create a muxer for the given tracks.
    pub fn new(video: Option<VideoFormat>, audio: Option<AudioFormat>) -> Self {
        Self {
            video,
            audio,
            continuity: [0; 4],
            units_since_psi: 0,
            psi_sent: false,
        }
    }

    /// Forget continuity counters and force PAT/PMT before the next unit.
    pub fn reset(&mut self) {
        self.continuity = [0; 4];
        self.units_since_psi = 0;
        self.psi_sent = false;
    }

    /// PAT followed by PMT, two TS packets.
    pub fn psi_packets(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(2 * TS_PACKET_SIZE);
        let pat = self.pat_section();
        self.write_section(&mut out, PAT_PID, &pat);
        let pmt = self.pmt_section();
        self.write_section(&mut out, PMT_PID, &pmt);
        out.freeze()
    }

    /// Mux one access unit into TS packets, prefixed by PAT/PMT when due.
    pub fn write_unit(&mut self, unit: &AccessUnit) -> MediaResult<Bytes> {
        let mut out = BytesMut::new();

        let psi_due = !self.psi_sent
            || (unit.kind == TrackKind::Video && unit.is_key_frame)
            || (self.video.is_none() && self.units_since_psi >= PSI_INTERVAL_UNITS);
        if psi_due {
            out.put(self.psi_packets());
            self.psi_sent = true;
            self.units_since_psi = 0;
        }
        self.units_since_psi += 1;

        let pts = (unit.pts_us * 90 / 1000) & 0x1_FFFF_FFFF;
        match unit.kind {
            TrackKind::Video => {
                let es = self.video_elementary_stream(unit);
                let pes = build_pes(VIDEO_STREAM_ID, pts, &es, true);
                let pcr = Some(pts);
                self.write_pes(&mut out, VIDEO_PID, &pes, unit.is_key_frame, pcr);
            }
            TrackKind::Audio => {
                let es = self.audio_elementary_stream(unit)?;
                let pes = build_pes(AUDIO_STREAM_ID, pts, &es, false);
                let pcr = if self.video.is_none() { Some(pts) } else { None };
                self.write_pes(&mut out, AUDIO_PID, &pes, false, pcr);
            }
        }

        trace!(kind = unit.kind.name(), bytes = out.len(), "Muxed access unit");
        Ok(out.freeze())
    }

    fn video_elementary_stream(&self, unit: &AccessUnit) -> Bytes {
        let Some(format) = &self.video else {
            return unit.data.clone();
        };
        let has_parameter_sets = nal::split_annex_b(&unit.data)
            .iter()
            .any(|n| nal::is_parameter_set(format.codec, n[0]));
        if !unit.is_key_frame || has_parameter_sets {
            return unit.data.clone();
        }

        // Receivers may join at any key frame, so parameter sets travel in-band.
        let mut buf = BytesMut::with_capacity(unit.data.len() + 64);
        for set in format.vps.iter().chain([&format.sps, &format.pps]) {
            buf.put_slice(&[0, 0, 0, 1]);
            buf.put_slice(set);
        }
        if !matches!(nal::find_start_code(&unit.data, 0), Some((0, _))) {
            buf.put_slice(&[0, 0, 0, 1]);
        }
        buf.put_slice(&unit.data);
        buf.freeze()
    }

    fn audio_elementary_stream(&self, unit: &AccessUnit) -> MediaResult<Bytes> {
        if aac::has_adts_header(&unit.data) {
            return Ok(unit.data.clone());
        }
        let format = self.audio.unwrap_or_else(|| AudioFormat::aac(44100, 2));
        let header = aac::build_adts_header(format.sample_rate, format.channels, unit.data.len())?;
        let mut buf = BytesMut::with_capacity(header.len() + unit.data.len());
        buf.put_slice(&header);
        buf.put_slice(&unit.data);
        Ok(buf.freeze())
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut section = Vec::with_capacity(16);
        section.push(0x00); // table id
        section.extend_from_slice(&(0xB000u16 | 13).to_be_bytes());
        section.extend_from_slice(&1u16.to_be_bytes()); // transport stream id
        section.extend_from_slice(&[0xC1, 0x00, 0x00]);
        section.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        section.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    fn pmt_section(&self) -> Vec<u8> {
        let mut streams: Vec<(StreamType, u16)> = Vec::with_capacity(2);
        if let Some(video) = &self.video {
            streams.push((StreamType::from(video.codec), VIDEO_PID));
        }
        if self.audio.is_some() {
            streams.push((StreamType::AacAdts, AUDIO_PID));
        }
        let pcr_pid = if self.video.is_some() { VIDEO_PID } else { AUDIO_PID };
        let section_length = 9 + 5 * streams.len() as u16 + 4;

        let mut section = Vec::with_capacity(3 + section_length as usize);
        section.push(0x02); // table id
        section.extend_from_slice(&(0xB000 | section_length).to_be_bytes());
        section.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        section.extend_from_slice(&[0xC1, 0x00, 0x00]);
        section.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        section.extend_from_slice(&0xF000u16.to_be_bytes()); // no program info
        for (stream_type, pid) in streams {
            section.push(stream_type as u8);
            section.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            section.extend_from_slice(&0xF000u16.to_be_bytes());
        }
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let slot = match pid {
            PAT_PID => 0,
            PMT_PID => 1,
            VIDEO_PID => 2,
            _ => 3,
        };
        let cc = self.continuity[slot];
        self.continuity[slot] = (cc + 1) & 0x0F;
        cc
    }

    fn write_section(&mut self, out: &mut BytesMut, pid: u16, section: &[u8]) {
        let cc = self.next_continuity(pid);
        out.put_u8(SYNC_BYTE);
        out.put_u16(0x4000 | pid);
        out.put_u8(0x10 | cc);
        out.put_u8(0x00); // pointer field
        out.put_slice(section);
        let stuffing = TS_PAYLOAD_SIZE - 1 - section.len();
        out.put_bytes(0xFF, stuffing);
    }

    fn write_pes(&mut self, out: &mut BytesMut, pid: u16, pes: &[u8], random_access: bool, pcr: Option<u64>) {
        let mut offset = 0;
        let mut first = true;

        while offset < pes.len() {
            let remaining = pes.len() - offset;
            let (flags, pcr) = if first {
                let flags = (if random_access { 0x40 } else { 0 }) | (if pcr.is_some() { 0x10 } else { 0 });
                (flags, pcr)
            } else {
                (0, None)
            };

            // Adaptation field: length byte + flags byte + optional PCR.
            let base_af = if flags != 0 { 2 + if pcr.is_some() { 6 } else { 0 } } else { 0 };
            let take = remaining.min(TS_PAYLOAD_SIZE - base_af);
            let stuffing = TS_PAYLOAD_SIZE - base_af - take;
            let af_len = if base_af == 0 { stuffing } else { base_af + stuffing };

            let cc = self.next_continuity(pid);
            out.put_u8(SYNC_BYTE);
            out.put_u16(if first { 0x4000 } else { 0 } | pid);
            out.put_u8(if af_len > 0 { 0x30 } else { 0x10 } | cc);

            if af_len > 0 {
                out.put_u8((af_len - 1) as u8);
                if af_len > 1 {
                    out.put_u8(flags);
                    if let Some(pcr) = pcr {
                        put_pcr(out, pcr);
                    }
                    let written = if base_af == 0 { 2 } else { base_af };
                    out.put_bytes(0xFF, af_len - written);
                }
            }

            out.put_slice(&pes[offset..offset + take]);
            offset += take;
            first = false;
        }
    }
}

fn put_pcr(out: &mut BytesMut, pcr_base: u64) {
    out.put_u8((pcr_base >> 25) as u8);
    out.put_u8((pcr_base >> 17) as u8);
    out.put_u8((pcr_base >> 9) as u8);
    out.put_u8((pcr_base >> 1) as u8);
    out.put_u8((((pcr_base & 0x01) << 7) as u8) | 0x7E);
    out.put_u8(0x00);
}

fn build_pes(stream_id: u8, pts: u64, payload: &[u8], unbounded: bool) -> Vec<u8> {
    let header_data_len = 5;
    let packet_len = 3 + header_data_len + payload.len();
    let length_field = if unbounded || packet_len > 0xFFFF {
        0
    } else {
        packet_len as u16
    };

    let mut pes = Vec::with_capacity(9 + header_data_len + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    pes.extend_from_slice(&length_field.to_be_bytes());
    pes.push(0x80); // marker bits, no scrambling
    pes.push(0x80); // PTS only
    pes.push(header_data_len as u8);
    pes.push(0x21 | (((pts >> 30) & 0x07) << 1) as u8);
    pes.extend_from_slice(&((((pts >> 15) & 0x7FFF) << 1 | 1) as u16).to_be_bytes());
    pes.extend_from_slice(&((((pts & 0x7FFF) << 1) | 1) as u16).to_be_bytes());
    pes.extend_from_slice(payload);
    pes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn muxer() -> TsMuxer {
        let video = VideoFormat::h264(
            640,
            360,
            30,
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
        );
        TsMuxer::new(Some(video), Some(AudioFormat::aac(48000, 2)))
    }

    fn packets(data: &[u8]) -> Vec<&[u8]> {
        data.chunks(TS_PACKET_SIZE).collect()
    }

    fn pid(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[1], packet[2]]) & 0x1FFF
    }

    #[test]
    fn test_crc32_mpeg2_check_value() {
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_psi_sections_verify() {
        let mut muxer = muxer();
        let psi = muxer.psi_packets();
        for packet in packets(&psi) {
            assert_eq!(packet[0], SYNC_BYTE);
            let section_len = (u16::from_be_bytes([packet[6], packet[7]]) & 0x0FFF) as usize;
            let section = &packet[5..8 + section_len];
            // CRC over a section including its CRC is zero.
            assert_eq!(crc32_mpeg2(section), 0);
        }
        assert_eq!(pid(&psi[..188]), PAT_PID);
        assert_eq!(pid(&psi[188..]), PMT_PID);
    }

    #[test]
    fn test_key_frame_gets_psi_and_pcr() {
        let mut muxer = muxer();
        let unit = AccessUnit::video(vec![0, 0, 0, 1, 0x65, 0x88, 0x84], 1_000_000, true);
        let out = muxer.write_unit(&unit).unwrap();
        let packets = packets(&out);

        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert_eq!(pid(packets[0]), PAT_PID);
        assert_eq!(pid(packets[1]), PMT_PID);

        let video = packets[2];
        assert_eq!(pid(video), VIDEO_PID);
        assert_eq!(video[1] & 0x40, 0x40); // payload unit start
        assert_eq!(video[3] & 0x30, 0x30); // adaptation + payload
        assert_eq!(video[5] & 0x50, 0x50); // random access + PCR
    }

    #[test]
    fn test_inter_frame_skips_psi_and_counts_continuity() {
        let mut muxer = muxer();
        let key = AccessUnit::video(vec![0, 0, 0, 1, 0x65, 0x88], 0, true);
        muxer.write_unit(&key).unwrap();

        let big = AccessUnit::video(
            [&[0u8, 0, 0, 1, 0x41][..], &[0xAB; 400][..]].concat(),
            33_333,
            false,
        );
        let out = muxer.write_unit(&big).unwrap();
        let packets = packets(&out);

        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| pid(p) == VIDEO_PID));
        let counters: Vec<u8> = packets.iter().map(|p| p[3] & 0x0F).collect();
        assert_eq!(counters, vec![1, 2, 3]);
    }

    #[test]
    fn test_pes_pts_encoding() {
        let pes = build_pes(VIDEO_STREAM_ID, 90_000, &[0xAA], true);
        assert_eq!(&pes[..4], &[0, 0, 1, 0xE0]);
        assert_eq!(&pes[4..6], &[0, 0]);

        let b = &pes[9..14];
        let decoded = (((b[0] as u64 >> 1) & 0x07) << 30)
            | (((u16::from_be_bytes([b[1], b[2]]) as u64) >> 1) << 15)
            | ((u16::from_be_bytes([b[3], b[4]]) as u64) >> 1);
        assert_eq!(decoded, 90_000);
    }

    #[test]
    fn test_raw_aac_gets_adts_header() {
        let mut muxer = muxer();
        let out = muxer.write_unit(&AccessUnit::audio(vec![0x21, 0x10, 0x05], 0)).unwrap();
        let audio = packets(&out)[2];
        assert_eq!(pid(audio), AUDIO_PID);
        let payload_start = 4 + 1 + audio[4] as usize;
        let pes = &audio[payload_start..];
        assert_eq!(&pes[..4], &[0, 0, 1, AUDIO_STREAM_ID]);
        assert_eq!(&pes[14..16], &[0xFF, 0xF1]);
    }
}
