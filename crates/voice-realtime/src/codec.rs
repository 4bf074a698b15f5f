//! PCM16 and base64 conversions for the voice wire format.
//!
//! The provider speaks mono 16 kHz 16-bit signed little-endian PCM, base64
//! encoded inside JSON text frames. Everything here is a pure function.

use crate::error::VoiceError;
use base64::Engine;

/// Capture and playback sample rate, fixed by the provider contract.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Number of samples per outbound audio frame.
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;

/// Encodes float samples in `[-1, 1]` to 16-bit little-endian PCM bytes.
/// Out-of-range samples are clamped.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decodes 16-bit little-endian PCM bytes to float samples in `[-1, 1]`.
///
/// An odd byte count is a malformed payload. Empty input yields an empty
/// vector; callers treat that as "no audio, skip".
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, VoiceError> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::MalformedAudio(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            v as f32 / 32768.0
        })
        .collect())
}

/// Standard base64, no URL-safe alphabet, no line wrapping.
pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Inverse of [`to_base64`].
pub fn from_base64(encoded: &str) -> Result<Vec<u8>, VoiceError> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| VoiceError::MalformedAudio(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_encode_pcm16_known_values() {
        // 0.5 scales to 16384 = [0x00, 0x40] little-endian.
        let bytes = encode_pcm16(&[0.5]);
        assert_eq!(bytes, vec![0x00, 0x40]);

        // -1.0 scales to -32768 = [0x00, 0x80].
        let bytes = encode_pcm16(&[-1.0]);
        assert_eq!(bytes, vec![0x00, 0x80]);

        assert!(encode_pcm16(&[]).is_empty());
    }

    #[test]
    fn test_encode_pcm16_clamps_out_of_range() {
        let bytes = encode_pcm16(&[2.0, -2.0]);
        let decoded = decode_pcm16(&bytes).unwrap();
        assert!(decoded[0] <= 1.0);
        assert!(decoded[1] >= -1.0);
    }

    #[test]
    fn test_encode_pcm16_clamps_non_finite() {
        let bytes = encode_pcm16(&[f32::INFINITY, f32::NEG_INFINITY, f32::NAN]);
        for sample in decode_pcm16(&bytes).unwrap() {
            assert!((-1.0..=1.0).contains(&sample));
        }
    }

    #[test]
    fn test_decode_pcm16_known_values() {
        let samples = decode_pcm16(&[0x00, 0x40, 0x00, 0x80]).unwrap();
        assert_eq!(samples.len(), 2);
        assert_abs_diff_eq!(samples[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(samples[1], -1.0, epsilon = 0.0001);
    }

    #[test]
    fn test_decode_pcm16_empty_is_empty() {
        assert!(decode_pcm16(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_pcm16_odd_length_is_malformed() {
        let err = decode_pcm16(&[0x00]).unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudio(_)));
    }

    #[test]
    fn test_pcm16_round_trip_within_one_quantization_step() {
        let original = vec![0.1f32, -0.7, 0.0, 0.99, -0.25, 1.0, -1.0];
        let decoded = decode_pcm16(&encode_pcm16(&original)).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_base64_round_trip() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(from_base64(&to_base64(&data)).unwrap(), data);
        assert_eq!(from_base64(&to_base64(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_base64_is_standard_alphabet_without_wrapping() {
        // 0xfb 0xff forces '+' and '/' in the standard alphabet.
        let encoded = to_base64(&[0xfb, 0xef, 0xff]);
        assert_eq!(encoded, "++//");
        let long = to_base64(&vec![0u8; 1024]);
        assert!(!long.contains('\n'));
    }

    #[test]
    fn test_from_base64_rejects_garbage() {
        let err = from_base64("not base64!!").unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudio(_)));
    }
}
