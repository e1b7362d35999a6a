//! AAC AudioSpecificConfig synthesis.
//!
//! The MPEG-TS muxer needs the 2-byte ASC on the audio stream's codec
//! parameters before the header is written. Some encoders never populate
//! extradata, so the transcoder synthesizes it from the encoder's output
//! parameters: `(objectType=2 << 11) | (sampleRateIndex << 7) |
//! (channelConfig << 3)`.

use crate::error::{Error, Result};

/// Sample-rate index table from ISO 14496-3.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Index of a sample rate in the ISO 14496-3 table.
pub fn sample_rate_index(sample_rate: u32) -> Option<u8> {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .map(|i| i as u8)
}

/// Synthesize a 2-byte AudioSpecificConfig for AAC-LC.
pub fn synthesize_asc(sample_rate: u32, channels: u16) -> Result<[u8; 2]> {
    let index = sample_rate_index(sample_rate).ok_or_else(|| {
        Error::UnsupportedAudio(format!("sample rate {} has no ASC index", sample_rate))
    })?;
    if channels == 0 || channels > 7 {
        return Err(Error::UnsupportedAudio(format!(
            "channel count {} has no channel configuration",
            channels
        )));
    }
    let asc: u16 = (2u16 << 11) | ((index as u16) << 7) | ((channels as u16) << 3);
    Ok(asc.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_index() {
        assert_eq!(sample_rate_index(96000), Some(0));
        assert_eq!(sample_rate_index(48000), Some(3));
        assert_eq!(sample_rate_index(44100), Some(4));
        assert_eq!(sample_rate_index(8000), Some(11));
        assert_eq!(sample_rate_index(12345), None);
    }

    #[test]
    fn test_asc_48k_stereo() {
        // objectType 2, index 3, channels 2 -> 0001 0001 1001 0000
        assert_eq!(synthesize_asc(48000, 2).unwrap(), [0x11, 0x90]);
    }

    #[test]
    fn test_asc_44k_stereo() {
        assert_eq!(synthesize_asc(44100, 2).unwrap(), [0x12, 0x10]);
    }

    #[test]
    fn test_asc_rejects_unknown_rate() {
        assert!(synthesize_asc(12345, 2).is_err());
    }

    #[test]
    fn test_asc_rejects_bad_channels() {
        assert!(synthesize_asc(48000, 0).is_err());
        assert!(synthesize_asc(48000, 8).is_err());
    }
}
