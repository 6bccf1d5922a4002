//! Minimal mono 16-bit PCM WAV container.
//!
//! The header is written by hand so the layout is byte-exact and stable:
//!
//! | bytes | field |
//! |-------|-------|
//! | 0–3   | `"RIFF"` |
//! | 4–7   | u32 `36 + data_bytes` |
//! | 8–11  | `"WAVE"` |
//! | 12–15 | `"fmt "` |
//! | 16–19 | u32 `16` |
//! | 20–21 | u16 `1` (PCM) |
//! | 22–23 | u16 `1` (mono) |
//! | 24–27 | u32 sample rate |
//! | 28–31 | u32 sample rate × 2 |
//! | 32–33 | u16 `2` |
//! | 34–35 | u16 `16` |
//! | 36–39 | `"data"` |
//! | 40–43 | u32 `data_bytes` |
//! | 44+   | i16 little-endian samples |

use crate::error::{NoiseError, Result};
use crate::models::{EncodedBlock, NoiseColor, SampleBlock};
use std::io::Cursor;
use std::sync::Arc;

pub const HEADER_LEN: usize = 44;
const BITS_PER_SAMPLE: u16 = 16;
const BYTES_PER_SAMPLE: u32 = 2;
const FORMAT_PCM: u16 = 1;
// Power-of-two scale keeps the i16 -> f32 -> i16 conversion exact.
const PCM_SCALE: f32 = 32768.0;

/// Serialize a block into a playable WAV container.
pub fn encode(block: &SampleBlock) -> Result<Vec<u8>> {
    if block.is_empty() {
        return Err(NoiseError::InvalidParameter(
            "cannot encode an empty block".into(),
        ));
    }
    let data_bytes = data_len(block.len())?;
    let sample_rate = block.sample_rate();
    let byte_rate = sample_rate
        .checked_mul(BYTES_PER_SAMPLE)
        .ok_or_else(|| NoiseError::InvalidParameter(format!("sample rate {sample_rate} too high")))?;

    let total = HEADER_LEN + data_bytes as usize;
    let mut out: Vec<u8> = Vec::new();
    out.try_reserve_exact(total).map_err(|e| {
        NoiseError::ResourceExhausted(format!("cannot allocate {total} byte container: {e}"))
    })?;

    // RIFF header
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_bytes).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    // fmt chunk
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&SampleBlock::CHANNELS.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&(BYTES_PER_SAMPLE as u16).to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_bytes.to_le_bytes());
    for &s in block.samples() {
        out.extend_from_slice(&to_pcm(s).to_le_bytes());
    }

    Ok(out)
}

/// Payload size for `frames` samples, rejecting anything the 32-bit RIFF
/// length field cannot describe.
fn data_len(frames: usize) -> Result<u32> {
    let data_bytes = frames as u64 * BYTES_PER_SAMPLE as u64;
    if data_bytes + 36 > u32::MAX as u64 {
        return Err(NoiseError::PayloadTooLarge { bytes: data_bytes });
    }
    Ok(data_bytes as u32)
}

/// Encode and wrap in an [`EncodedBlock`] for the output device.
pub fn encode_block(block: &SampleBlock) -> Result<EncodedBlock> {
    let bytes = encode(block)?;
    Ok(EncodedBlock {
        bytes: Arc::from(bytes),
        color: block.color(),
        sample_rate: block.sample_rate(),
        frames: block.len(),
    })
}

/// Parse a mono 16-bit PCM container. The container carries no color, so the
/// caller supplies the tag.
pub fn decode(bytes: &[u8], color: NoiseColor) -> Result<SampleBlock> {
    if bytes.len() < HEADER_LEN || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(NoiseError::MalformedContainer(
            "missing RIFF/WAVE header".into(),
        ));
    }
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels != SampleBlock::CHANNELS
        || spec.bits_per_sample != BITS_PER_SAMPLE
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(NoiseError::MalformedContainer(format!(
            "expected mono 16-bit PCM, found {} channel(s) at {} bits ({:?})",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(from_pcm))
        .collect::<std::result::Result<Vec<f32>, hound::Error>>()?;
    SampleBlock::new(samples, spec.sample_rate, color)
}

/// Decode just the sample payload of an [`EncodedBlock`].
pub fn decode_block(block: &EncodedBlock) -> Result<SampleBlock> {
    decode(&block.bytes, block.color)
}

fn to_pcm(sample: f32) -> i16 {
    (sample * PCM_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn from_pcm(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::NoiseSynthesizer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn u16_at(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    fn u32_at(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    #[test]
    fn header_is_byte_exact() {
        let block = SampleBlock::new(vec![0.0, 0.5, -0.5, 1.0], 22050, NoiseColor::White).unwrap();
        let bytes = encode(&block).unwrap();

        assert_eq!(bytes.len(), 44 + 8);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32_at(&bytes, 4), 36 + 8);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(u32_at(&bytes, 16), 16);
        assert_eq!(u16_at(&bytes, 20), 1);
        assert_eq!(u16_at(&bytes, 22), 1);
        assert_eq!(u32_at(&bytes, 24), 22050);
        assert_eq!(u32_at(&bytes, 28), 44100);
        assert_eq!(u16_at(&bytes, 32), 2);
        assert_eq!(u16_at(&bytes, 34), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(u32_at(&bytes, 40), 8);

        let samples: Vec<i16> = bytes[44..]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![0, 16384, -16384, i16::MAX]);
    }

    #[test]
    fn container_round_trips() {
        let mut synth = NoiseSynthesizer::new(StdRng::seed_from_u64(3));
        for color in NoiseColor::ALL {
            let block = synth.synthesize(color, 0.2, 22050).unwrap();
            let bytes = encode(&block).unwrap();
            let decoded = decode(&bytes, color).unwrap();
            assert_eq!(decoded.len(), block.len());
            assert_eq!(decoded.sample_rate(), 22050);
            assert_eq!(encode(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn extreme_pcm_values_survive_round_trip() {
        let mut bytes = encode(&SampleBlock::new(vec![0.0; 3], 8000, NoiseColor::Pink).unwrap())
            .unwrap();
        for (i, v) in [i16::MIN, i16::MAX, -1].iter().enumerate() {
            bytes[44 + i * 2..46 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        let decoded = decode(&bytes, NoiseColor::Pink).unwrap();
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn rejects_foreign_containers() {
        assert!(matches!(
            decode(b"not a wav file", NoiseColor::White),
            Err(NoiseError::MalformedContainer(_))
        ));

        let block = SampleBlock::new(vec![0.1; 4], 8000, NoiseColor::White).unwrap();
        let mut stereo = encode(&block).unwrap();
        stereo[22..24].copy_from_slice(&2u16.to_le_bytes());
        stereo[32..34].copy_from_slice(&4u16.to_le_bytes());
        stereo[28..32].copy_from_slice(&32000u32.to_le_bytes());
        assert!(matches!(
            decode(&stereo, NoiseColor::White),
            Err(NoiseError::MalformedContainer(_))
        ));
    }

    #[test]
    fn encoded_block_carries_metadata() {
        let block = SampleBlock::new(vec![0.25; 100], 1000, NoiseColor::Brown).unwrap();
        let encoded = encode_block(&block).unwrap();
        assert_eq!(encoded.frames, 100);
        assert_eq!(encoded.color, NoiseColor::Brown);
        assert!((encoded.duration_secs() - 0.1).abs() < 1e-9);
        let back = decode_block(&encoded).unwrap();
        assert_eq!(back.color(), NoiseColor::Brown);
        assert_eq!(back.len(), 100);
    }

    #[test]
    fn payload_must_fit_the_riff_length_field() {
        let max_frames = (u32::MAX as usize - 36) / 2;
        assert_eq!(data_len(max_frames).unwrap(), (max_frames * 2) as u32);
        match data_len(max_frames + 1) {
            Err(NoiseError::PayloadTooLarge { bytes }) => {
                assert_eq!(bytes, (max_frames as u64 + 1) * 2)
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }
}
