//! AAC configuration and ADTS framing.

use crate::{MediaError, MediaResult};

/// MPEG-4 sampling frequency table, indexed by sampling frequency index.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC-LC audio object type.
const AOT_AAC_LC: u16 = 2;

const ADTS_HEADER_LEN: usize = 7;

/// Sampling frequency index for `sample_rate`.
pub fn sample_rate_index(sample_rate: u32) -> MediaResult<u8> {
    SAMPLE_RATES
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|i| i as u8)
        .ok_or(MediaError::UnsupportedSampleRate(sample_rate))
}

/// Two-byte AAC-LC AudioSpecificConfig: object type, frequency index, channel config.
pub fn audio_specific_config(sample_rate: u32, channels: u8) -> MediaResult<[u8; 2]> {
    let index = sample_rate_index(sample_rate)? as u16;
    let config = (AOT_AAC_LC << 11) | (index << 7) | ((channels as u16 & 0x0F) << 3);
    Ok(config.to_be_bytes())
}

/// Returns true if `data` starts with an ADTS sync word.
pub fn has_adts_header(data: &[u8]) -> bool {
    data.len() >= ADTS_HEADER_LEN && data[0] == 0xFF && (data[1] & 0xF0) == 0xF0
}

/// Raw AAC payload with any ADTS header removed.
pub fn strip_adts(data: &[u8]) -> &[u8] {
    if !has_adts_header(data) {
        return data;
    }
    let protection_absent = data[1] & 0x01 == 1;
    let header_len = if protection_absent { 7 } else { 9 };
    data.get(header_len..).unwrap_or_default()
}

/// Seven-byte ADTS header (no CRC) for a raw AAC-LC frame of `payload_len` bytes.
pub fn build_adts_header(sample_rate: u32, channels: u8, payload_len: usize) -> MediaResult<[u8; 7]> {
    let index = sample_rate_index(sample_rate)?;
    let frame_len = payload_len + ADTS_HEADER_LEN;
    if frame_len > 0x1FFF {
        return Err(MediaError::InvalidInput(format!(
            "AAC frame too large for ADTS: {} bytes",
            payload_len
        )));
    }
    let profile = (AOT_AAC_LC - 1) as u8;
    let channels = channels & 0x07;

    Ok([
        0xFF,
        0xF1, // MPEG-4, layer 0, no CRC
        (profile << 6) | (index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_specific_config_44100_stereo() {
        // object type 2, index 4, 2 channels -> 0x1210
        assert_eq!(audio_specific_config(44100, 2).unwrap(), [0x12, 0x10]);
    }

    #[test]
    fn test_audio_specific_config_48000_mono() {
        // object type 2, index 3, 1 channel -> 0x1188
        assert_eq!(audio_specific_config(48000, 1).unwrap(), [0x11, 0x88]);
    }

    #[test]
    fn test_unsupported_sample_rate() {
        assert!(matches!(
            sample_rate_index(44000),
            Err(MediaError::UnsupportedSampleRate(44000))
        ));
    }

    #[test]
    fn test_adts_header_strip() {
        let header = build_adts_header(44100, 2, 4).unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&[1, 2, 3, 4]);

        assert!(has_adts_header(&frame));
        assert_eq!(strip_adts(&frame), &[1, 2, 3, 4]);
        assert_eq!(strip_adts(&[0x21, 0x10]), &[0x21, 0x10]);
    }

    #[test]
    fn test_adts_frame_length_field() {
        let header = build_adts_header(48000, 2, 100).unwrap();
        let frame_len = ((header[3] as usize & 0x03) << 11)
            | ((header[4] as usize) << 3)
            | (header[5] as usize >> 5);
        assert_eq!(frame_len, 107);
    }
}
