//! RTCP sender reports (RFC 3550 section 6.4.1).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Sender report without report blocks.
pub const SENDER_REPORT_SIZE: usize = 28;

const PT_SENDER_REPORT: u8 = 200;

/// NTP timestamp as (seconds, fraction).
pub fn ntp_time(now: SystemTime) -> (u32, u32) {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_epoch.as_secs() + NTP_UNIX_OFFSET;
    let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds as u32, fraction as u32)
}

/// Build a sender report.
pub fn sender_report(ssrc: u32, ntp: (u32, u32), rtp_timestamp: u32, packets: u32, octets: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(SENDER_REPORT_SIZE);
    buf.put_u8(0x80);
    buf.put_u8(PT_SENDER_REPORT);
    buf.put_u16((SENDER_REPORT_SIZE / 4 - 1) as u16);
    buf.put_u32(ssrc);
    buf.put_u32(ntp.0);
    buf.put_u32(ntp.1);
    buf.put_u32(rtp_timestamp);
    buf.put_u32(packets);
    buf.put_u32(octets);
    buf.freeze()
}

/// Sent-packet accounting and report timing for one RTP stream.
#[derive(Debug)]
pub struct RtcpReporter {
    ssrc: u32,
    interval: Duration,
    packets: u32,
    octets: u32,
    rtp_timestamp: u32,
    last_report: Option<Instant>,
}

impl RtcpReporter {
    pub fn new(ssrc: u32, interval: Duration) -> Self {
        Self {
            ssrc,
            interval,
            packets: 0,
            octets: 0,
            rtp_timestamp: 0,
            last_report: None,
        }
    }

    /// Account one RTP packet carrying `payload_len` payload bytes.
    pub fn on_packet_sent(&mut self, payload_len: usize, rtp_timestamp: u32) {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(payload_len as u32);
        self.rtp_timestamp = rtp_timestamp;
    }

    pub fn packets(&self) -> u32 {
        self.packets
    }

    pub fn octets(&self) -> u32 {
        self.octets
    }

    /// A sender report if one is due at `now`.
    ///
    /// The first report goes out one interval after the first call.
    pub fn poll(&mut self, now: Instant) -> Option<Bytes> {
        let last = *self.last_report.get_or_insert(now);
        if now.duration_since(last) < self.interval {
            return None;
        }
        self.last_report = Some(now);
        Some(sender_report(
            self.ssrc,
            ntp_time(SystemTime::now()),
            self.rtp_timestamp,
            self.packets,
            self.octets,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_report_layout() {
        let report = sender_report(0xDEADBEEF, (1, 2), 3, 4, 5);
        assert_eq!(report.len(), SENDER_REPORT_SIZE);
        assert_eq!(&report[..4], &[0x80, 200, 0, 6]);
        assert_eq!(&report[4..8], &0xDEADBEEFu32.to_be_bytes());
        assert_eq!(&report[8..12], &1u32.to_be_bytes());
        assert_eq!(&report[20..24], &4u32.to_be_bytes());
        assert_eq!(&report[24..28], &5u32.to_be_bytes());
    }

    #[test]
    fn test_ntp_time() {
        let (seconds, fraction) = ntp_time(UNIX_EPOCH + Duration::from_millis(1500));
        assert_eq!(seconds as u64, NTP_UNIX_OFFSET + 1);
        assert_eq!(fraction, 1 << 31);
    }

    #[test]
    fn test_reporter_interval_and_counts() {
        let mut reporter = RtcpReporter::new(7, Duration::from_millis(3000));
        let start = Instant::now();
        reporter.on_packet_sent(100, 9000);
        reporter.on_packet_sent(50, 12600);

        assert!(reporter.poll(start).is_none());
        assert!(reporter.poll(start + Duration::from_millis(2999)).is_none());
        let report = reporter.poll(start + Duration::from_millis(3000)).unwrap();
        assert_eq!(&report[16..20], &12600u32.to_be_bytes());
        assert_eq!(&report[20..24], &2u32.to_be_bytes());
        assert_eq!(&report[24..28], &150u32.to_be_bytes());
        assert!(reporter.poll(start + Duration::from_millis(3001)).is_none());
    }
}
