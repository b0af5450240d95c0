//! RTP packetization (RFC 3550) for H264 (RFC 6184) and AAC (RFC 3640).
//!
//! H264 NAL units that fit in one packet go out as single NAL unit packets,
//! larger ones as FU-A fragments. Every key frame is preceded by a STAP-A
//! aggregate carrying SPS and PPS. AAC frames use the `AAC-hbr` mode with a
//! single 16-bit AU header. The marker bit closes each access unit.

use bytes::{BufMut, Bytes, BytesMut};
use publisher_media::{aac, nal, AccessUnit, AudioFormat, VideoCodec, VideoFormat};

/// Fixed RTP header length.
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP clock for video.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// Sequence, timestamp and SSRC state of one RTP stream.
#[derive(Debug, Clone)]
pub struct RtpStream {
    payload_type: u8,
    clock_rate: u32,
    ssrc: u32,
    sequence: u16,
}

impl RtpStream {
    /// A stream with a random SSRC and starting sequence number.
    pub fn new(payload_type: u8, clock_rate: u32) -> Self {
        Self {
            payload_type,
            clock_rate,
            ssrc: fastrand::u32(..),
            sequence: fastrand::u16(..),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Presentation time in the stream's clock, wrapping at 32 bits.
    pub fn timestamp(&self, pts_us: u64) -> u32 {
        (pts_us as u128 * self.clock_rate as u128 / 1_000_000) as u32
    }

    /// Build one packet from payload pieces.
    pub fn packet(&mut self, marker: bool, timestamp: u32, payload: &[&[u8]]) -> Bytes {
        let len: usize = payload.iter().map(|p| p.len()).sum();
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + len);
        buf.put_u8(0x80);
        buf.put_u8((u8::from(marker) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(timestamp);
        buf.put_u32(self.ssrc);
        for piece in payload {
            buf.put_slice(piece);
        }
        self.sequence = self.sequence.wrapping_add(1);
        buf.freeze()
    }
}

/// Turns access units into RTP packets for one track.
pub trait Packetizer: Send {
    /// RTP packets for one access unit, in sending order.
    fn packetize(&mut self, unit: &AccessUnit) -> Vec<Bytes>;

    /// The underlying RTP stream.
    fn stream(&self) -> &RtpStream;
}

/// H264 packetizer in packetization mode 1.
pub struct H264Packetizer {
    stream: RtpStream,
    max_payload: usize,
    sps: Bytes,
    pps: Bytes,
}

impl H264Packetizer {
    /// `mtu` bounds the RTP packet including its header.
    pub fn new(format: &VideoFormat, payload_type: u8, mtu: usize) -> Self {
        Self {
            stream: RtpStream::new(payload_type, VIDEO_CLOCK_RATE),
            max_payload: mtu.saturating_sub(RTP_HEADER_SIZE).max(3),
            sps: format.sps.clone(),
            pps: format.pps.clone(),
        }
    }

    /// Largest NAL unit sent without fragmentation.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn parameter_sets(&mut self, timestamp: u32, packets: &mut Vec<Bytes>) {
        if self.sps.is_empty() || self.pps.is_empty() {
            return;
        }
        let nri = (self.sps[0] | self.pps[0]) & 0x60;
        let stap_len = 1 + 2 + self.sps.len() + 2 + self.pps.len();
        if stap_len <= self.max_payload {
            let header = [nri | NAL_TYPE_STAP_A];
            let sps_len = (self.sps.len() as u16).to_be_bytes();
            let pps_len = (self.pps.len() as u16).to_be_bytes();
            let (sps, pps) = (self.sps.clone(), self.pps.clone());
            packets.push(
                self.stream
                    .packet(false, timestamp, &[&header, &sps_len, &sps[..], &pps_len, &pps[..]]),
            );
        } else {
            let (sps, pps) = (self.sps.clone(), self.pps.clone());
            self.nal(&sps, timestamp, false, packets);
            self.nal(&pps, timestamp, false, packets);
        }
    }

    fn nal(&mut self, nal: &[u8], timestamp: u32, last: bool, packets: &mut Vec<Bytes>) {
        if nal.len() <= self.max_payload {
            packets.push(self.stream.packet(last, timestamp, &[nal]));
            return;
        }

        let header = nal[0];
        let indicator = (header & 0xE0) | NAL_TYPE_FU_A;
        let fragment_size = self.max_payload - 2;
        let body = &nal[1..];
        let count = body.len().div_ceil(fragment_size);

        for (i, fragment) in body.chunks(fragment_size).enumerate() {
            let start = if i == 0 { 0x80 } else { 0 };
            let end = if i + 1 == count { 0x40 } else { 0 };
            let fu_header = start | end | (header & 0x1F);
            packets.push(self.stream.packet(
                last && i + 1 == count,
                timestamp,
                &[&[indicator, fu_header], fragment],
            ));
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, unit: &AccessUnit) -> Vec<Bytes> {
        let timestamp = self.stream.timestamp(unit.pts_us);
        let nals: Vec<&[u8]> = nal::split_annex_b(&unit.data)
            .into_iter()
            .filter(|n| !nal::is_parameter_set(VideoCodec::H264, n[0]))
            .collect();

        let mut packets = Vec::with_capacity(nals.len() + 1);
        if nals.is_empty() {
            return packets;
        }
        if unit.is_key_frame {
            self.parameter_sets(timestamp, &mut packets);
        }
        let count = nals.len();
        for (i, n) in nals.into_iter().enumerate() {
            self.nal(n, timestamp, i + 1 == count, &mut packets);
        }
        packets
    }

    fn stream(&self) -> &RtpStream {
        &self.stream
    }
}

/// AAC packetizer in `AAC-hbr` mode, one frame per packet.
pub struct AacPacketizer {
    stream: RtpStream,
}

impl AacPacketizer {
    pub fn new(format: &AudioFormat, payload_type: u8) -> Self {
        Self {
            stream: RtpStream::new(payload_type, format.sample_rate),
        }
    }
}

impl Packetizer for AacPacketizer {
    fn packetize(&mut self, unit: &AccessUnit) -> Vec<Bytes> {
        let frame = aac::strip_adts(&unit.data);
        if frame.is_empty() {
            return Vec::new();
        }
        let timestamp = self.stream.timestamp(unit.pts_us);
        // AU-headers-length in bits, then 13-bit size and 3-bit index.
        let au_header = (((frame.len() as u16) << 3) & 0xFFF8).to_be_bytes();
        vec![self
            .stream
            .packet(true, timestamp, &[&[0x00, 0x10], &au_header, frame])]
    }

    fn stream(&self) -> &RtpStream {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> VideoFormat {
        VideoFormat::h264(
            640,
            480,
            30,
            Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xDA]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
        )
    }

    fn seq(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[2], packet[3]])
    }

    fn marker(packet: &[u8]) -> bool {
        packet[1] & 0x80 != 0
    }

    #[test]
    fn test_header_layout_and_sequence_wrap() {
        let mut stream = RtpStream::new(96, VIDEO_CLOCK_RATE);
        stream.sequence = u16::MAX;
        let first = stream.packet(true, 0x01020304, &[b"ab"]);
        let second = stream.packet(false, 0, &[b"c"]);

        assert_eq!(first[0], 0x80);
        assert_eq!(first[1], 0x80 | 96);
        assert_eq!(seq(&first), u16::MAX);
        assert_eq!(&first[4..8], &[1, 2, 3, 4]);
        assert_eq!(&first[8..12], &stream.ssrc().to_be_bytes());
        assert_eq!(&first[12..], b"ab");
        assert_eq!(seq(&second), 0);
    }

    #[test]
    fn test_timestamp_clock() {
        let stream = RtpStream::new(96, VIDEO_CLOCK_RATE);
        assert_eq!(stream.timestamp(1_000_000), 90_000);
        assert_eq!(stream.timestamp(40_000), 3_600);
        let audio = RtpStream::new(97, 44_100);
        assert_eq!(audio.timestamp(500_000), 22_050);
    }

    #[test]
    fn test_small_nal_single_packet_with_marker() {
        let mut packetizer = H264Packetizer::new(&format(), 96, 1500);
        let unit = AccessUnit::video(vec![0, 0, 0, 1, 0x41, 1, 2, 3], 0, false);
        let packets = packetizer.packetize(&unit);
        assert_eq!(packets.len(), 1);
        assert!(marker(&packets[0]));
        assert_eq!(&packets[0][12..], &[0x41, 1, 2, 3]);
    }

    #[test]
    fn test_fu_a_round_trip() {
        let mtu = 100;
        let mut packetizer = H264Packetizer::new(&format(), 96, mtu);
        let mut idr = vec![0x65];
        idr.extend((0..1000u32).map(|i| (i * 7) as u8));
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(&idr);

        let packets = packetizer.packetize(&AccessUnit::video(data, 40_000, true));
        let (stap, fragments) = packets.split_first().unwrap();
        assert_eq!(stap[12] & 0x1F, NAL_TYPE_STAP_A);
        assert!(!marker(stap));

        let fragment_size = mtu - RTP_HEADER_SIZE - 2;
        assert_eq!(fragments.len(), (idr.len() - 1).div_ceil(fragment_size));
        assert_eq!(fragments.iter().filter(|p| marker(p)).count(), 1);
        assert!(marker(fragments.last().unwrap()));

        let mut rebuilt = Vec::new();
        for (i, packet) in fragments.iter().enumerate() {
            assert!(packet.len() <= mtu);
            let (indicator, header) = (packet[12], packet[13]);
            assert_eq!(indicator & 0x1F, NAL_TYPE_FU_A);
            assert_eq!(header & 0x80 != 0, i == 0);
            assert_eq!(header & 0x40 != 0, i + 1 == fragments.len());
            if i == 0 {
                rebuilt.push((indicator & 0xE0) | (header & 0x1F));
            }
            rebuilt.extend_from_slice(&packet[14..]);
            assert_eq!(seq(packet), seq(stap).wrapping_add(i as u16 + 1));
        }
        assert_eq!(rebuilt, idr);
    }

    #[test]
    fn test_stap_a_carries_parameter_sets() {
        let mut packetizer = H264Packetizer::new(&format(), 96, 1500);
        let unit = AccessUnit::video(
            vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xCE, 0, 0, 1, 0x65, 0xAA],
            0,
            true,
        );
        let packets = packetizer.packetize(&unit);
        assert_eq!(packets.len(), 2);
        let stap = &packets[0][12..];
        assert_eq!(stap[0], 0x60 | NAL_TYPE_STAP_A);
        assert_eq!(&stap[1..3], &[0, 5]);
        assert_eq!(&stap[3..8], &[0x67, 0x42, 0xC0, 0x1E, 0xDA]);
        assert_eq!(&stap[8..10], &[0, 4]);
        assert_eq!(&packets[1][12..], &[0x65, 0xAA]);
    }

    #[test]
    fn test_aac_au_header() {
        let mut packetizer = AacPacketizer::new(&AudioFormat::aac(48000, 2), 97);
        let frame = vec![0x21u8; 300];
        let packets = packetizer.packetize(&AccessUnit::audio(frame.clone(), 1_000_000));
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert!(marker(packet));
        assert_eq!(&packet[4..8], &48_000u32.to_be_bytes());
        assert_eq!(&packet[12..14], &[0x00, 0x10]);
        assert_eq!(u16::from_be_bytes([packet[14], packet[15]]) >> 3, 300);
        assert_eq!(&packet[16..], &frame[..]);
    }
}
