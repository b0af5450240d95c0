//! RTMP byte handshake.
//!
//! C0/S0 are a single version byte; C1/S1/C2/S2 are 1536-byte blocks. The
//! plain handshake fills C1 with time, four zero bytes and random data. The
//! digest handshake stamps C1 with a Flash Player version and embeds an
//! HMAC-SHA256 digest whose position is derived from four offset bytes.
//! S1 is validated the same way with the server key; a server that does
//! not sign S1 is accepted as a plain handshake.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use publisher_ipc::HandshakeMode;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::TransportResult;

/// RTMP protocol version carried in C0/S0.
pub const RTMP_VERSION: u8 = 3;

/// Size of C1, C2, S1 and S2.
pub const HANDSHAKE_SIZE: usize = 1536;

const DIGEST_LEN: usize = 32;

/// Flash Player key; the first 30 bytes sign C1.
const CLIENT_KEY: &[u8] = b"Genuine Adobe Flash Player 001";

/// Flash Media Server key; the first 36 bytes sign S1.
const SERVER_KEY: &[u8] = b"Genuine Adobe Flash Media Server 001";

/// Version advertised in a digest C1 (11.2.202.233).
const FLASH_PLAYER_VERSION: [u8; 4] = [0x80, 0x00, 0x07, 0x02];

/// Where the four offset bytes live for each digest scheme.
const OFFSET_BASES: [usize; 2] = [8, 772];

type HmacSha256 = Hmac<Sha256>;

/// Result of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// True if S1 carried a valid server digest.
    pub digest_validated: bool,
}

fn digest_offset(block: &[u8], base: usize) -> usize {
    let sum: usize = block[base..base + 4].iter().map(|&b| b as usize).sum();
    sum % 728 + base + 4
}

fn compute_digest(block: &[u8], offset: usize, key: &[u8]) -> [u8; DIGEST_LEN] {
    // HMAC keys of any length are accepted, so this never fails.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0; DIGEST_LEN],
    };
    mac.update(&block[..offset]);
    mac.update(&block[offset + DIGEST_LEN..]);
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    digest
}

/// Find a valid digest in `block` under either scheme, returning its offset.
fn find_digest(block: &[u8], key: &[u8]) -> Option<usize> {
    OFFSET_BASES.iter().find_map(|&base| {
        let offset = digest_offset(block, base);
        let expected = compute_digest(block, offset, key);
        (block[offset..offset + DIGEST_LEN] == expected).then_some(offset)
    })
}

/// Build a signed block: time, version, random fill and a digest at the scheme-0 position.
fn signed_block(epoch: u32, version: [u8; 4], key: &[u8]) -> Vec<u8> {
    let mut block = random_bytes(HANDSHAKE_SIZE);
    block[..4].copy_from_slice(&epoch.to_be_bytes());
    block[4..8].copy_from_slice(&version);
    let offset = digest_offset(&block, OFFSET_BASES[0]);
    let digest = compute_digest(&block, offset, key);
    block[offset..offset + DIGEST_LEN].copy_from_slice(&digest);
    block
}

/// Build C1 for the requested handshake flavour.
pub fn build_c1(mode: HandshakeMode, epoch: u32) -> Vec<u8> {
    match mode {
        HandshakeMode::Plain => {
            let mut block = random_bytes(HANDSHAKE_SIZE);
            block[..4].copy_from_slice(&epoch.to_be_bytes());
            block[4..8].fill(0);
            block
        }
        HandshakeMode::Digest => signed_block(epoch, FLASH_PLAYER_VERSION, &CLIENT_KEY[..30]),
    }
}

/// Returns true if `s1` carries a valid server digest.
pub fn validate_s1(s1: &[u8]) -> bool {
    s1.len() == HANDSHAKE_SIZE && find_digest(s1, &SERVER_KEY[..36]).is_some()
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut block = vec![0u8; len];
    fastrand::fill(&mut block);
    block
}

fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// Run the client side of the handshake over `stream`.
pub fn perform<S: Read + Write>(stream: &mut S, mode: HandshakeMode) -> TransportResult<HandshakeOutcome> {
    let c1 = build_c1(mode, epoch_seconds());
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&c1);
    stream.write_all(&c0c1)?;
    stream.flush()?;
    debug!(mode = ?mode, "Sent C0+C1");

    let mut s0 = [0u8; 1];
    stream.read_exact(&mut s0)?;
    if s0[0] != RTMP_VERSION {
        return Err(TransportError::Connection(format!(
            "unexpected RTMP version {} in S0",
            s0[0]
        )));
    }

    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s1)?;

    let digest_validated = match mode {
        HandshakeMode::Plain => false,
        HandshakeMode::Digest => {
            let valid = validate_s1(&s1);
            if !valid {
                info!("S1 digest did not validate, falling back to plain handshake");
            }
            valid
        }
    };

    // C2 echoes S1.
    stream.write_all(&s1)?;
    stream.flush()?;
    debug!("Sent C2");

    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2)?;
    if mode == HandshakeMode::Plain && s2 != c1 {
        warn!("S2 does not echo C1");
    }

    debug!(digest_validated, "Handshake complete");
    Ok(HandshakeOutcome { digest_validated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FakeServer {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for FakeServer {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeServer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn server_reply(s1: &[u8]) -> Vec<u8> {
        let mut reply = vec![RTMP_VERSION];
        reply.extend_from_slice(s1);
        reply.extend_from_slice(&[0u8; HANDSHAKE_SIZE]);
        reply
    }

    #[test]
    fn test_plain_c1_layout() {
        let c1 = build_c1(HandshakeMode::Plain, 0x0102_0304);
        assert_eq!(c1.len(), HANDSHAKE_SIZE);
        assert_eq!(&c1[..8], &[1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_digest_c1_validates_with_client_key() {
        let c1 = build_c1(HandshakeMode::Digest, 7);
        assert_eq!(&c1[4..8], &FLASH_PLAYER_VERSION);
        let offset = find_digest(&c1, &CLIENT_KEY[..30]).unwrap();
        assert_eq!(offset, digest_offset(&c1, 8));
        assert!(!validate_s1(&c1));
    }

    #[test]
    fn test_signed_s1_validates() {
        let s1 = signed_block(1, [4, 5, 0, 1], &SERVER_KEY[..36]);
        assert!(validate_s1(&s1));

        let mut tampered = s1.clone();
        let offset = digest_offset(&tampered, 8);
        tampered[offset] ^= 0xFF;
        assert!(!validate_s1(&tampered));
    }

    #[test]
    fn test_plain_handshake_echoes_s1() {
        let s1: Vec<u8> = (0..HANDSHAKE_SIZE).map(|i| i as u8).collect();
        let mut server = FakeServer {
            input: Cursor::new(server_reply(&s1)),
            output: Vec::new(),
        };

        let outcome = perform(&mut server, HandshakeMode::Plain).unwrap();
        assert!(!outcome.digest_validated);
        assert_eq!(server.output.len(), 1 + 2 * HANDSHAKE_SIZE);
        assert_eq!(server.output[0], RTMP_VERSION);
        assert_eq!(&server.output[1 + HANDSHAKE_SIZE..], &s1[..]);
    }

    #[test]
    fn test_digest_handshake_falls_back_on_unsigned_s1() {
        let s1 = vec![0u8; HANDSHAKE_SIZE];
        let mut server = FakeServer {
            input: Cursor::new(server_reply(&s1)),
            output: Vec::new(),
        };
        let outcome = perform(&mut server, HandshakeMode::Digest).unwrap();
        assert!(!outcome.digest_validated);
    }

    #[test]
    fn test_digest_handshake_accepts_signed_s1() {
        let s1 = signed_block(1, [4, 5, 0, 1], &SERVER_KEY[..36]);
        let mut server = FakeServer {
            input: Cursor::new(server_reply(&s1)),
            output: Vec::new(),
        };
        assert!(perform(&mut server, HandshakeMode::Digest).unwrap().digest_validated);
    }

    #[test]
    fn test_bad_s0_version_fails() {
        let mut reply = server_reply(&[0u8; HANDSHAKE_SIZE]);
        reply[0] = 6;
        let mut server = FakeServer {
            input: Cursor::new(reply),
            output: Vec::new(),
        };
        assert!(matches!(
            perform(&mut server, HandshakeMode::Plain),
            Err(TransportError::Connection(_))
        ));
    }
}
