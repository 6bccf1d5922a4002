use crate::error::{NoiseError, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Spectral profile of the generated noise.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoiseColor {
    #[default]
    White,
    Pink,
    Brown,
    Blue,
}

impl NoiseColor {
    pub const ALL: [NoiseColor; 4] = [
        NoiseColor::White,
        NoiseColor::Pink,
        NoiseColor::Brown,
        NoiseColor::Blue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NoiseColor::White => "white",
            NoiseColor::Pink => "pink",
            NoiseColor::Brown => "brown",
            NoiseColor::Blue => "blue",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            NoiseColor::White => "All frequencies equal",
            NoiseColor::Pink => "Balanced, natural",
            NoiseColor::Brown => "Deep, rumbling",
            NoiseColor::Blue => "Bright, crisp",
        }
    }

    /// Next color in display order, wrapping around.
    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|c| *c == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for NoiseColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NoiseColor {
    type Err = NoiseError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .ok_or_else(|| NoiseError::InvalidParameter(format!("unknown noise color '{s}'")))
    }
}

/// Mono block of samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    samples: Vec<f32>,
    sample_rate: u32,
    color: NoiseColor,
}

impl SampleBlock {
    pub const CHANNELS: u16 = 1;

    /// Build a block, rejecting empty input, a zero sample rate and
    /// out-of-range or non-finite samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32, color: NoiseColor) -> Result<Self> {
        if samples.is_empty() {
            return Err(NoiseError::InvalidParameter(
                "sample block must not be empty".into(),
            ));
        }
        if sample_rate == 0 {
            return Err(NoiseError::InvalidParameter(
                "sample rate must be positive".into(),
            ));
        }
        if let Some(idx) = samples
            .iter()
            .position(|s| !s.is_finite() || s.abs() > 1.0)
        {
            return Err(NoiseError::InvalidParameter(format!(
                "sample {idx} out of range: {}",
                samples[idx]
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            color,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Mutable view for in-place processing. Callers must keep values in [-1, 1].
    pub(crate) fn samples_mut(&mut self) -> &mut Vec<f32> {
        &mut self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn color(&self) -> NoiseColor {
        self.color
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// A block serialized into a playable WAV container, ready to hand to an output device.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBlock {
    pub bytes: Arc<[u8]>,
    pub color: NoiseColor,
    pub sample_rate: u32,
    pub frames: usize,
}

impl EncodedBlock {
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }

    /// `data:` URI for players that only accept a URI source.
    pub fn to_data_uri(&self) -> String {
        format!(
            "data:audio/wav;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// One of the two alternating buffer slots.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    One,
    Two,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::One => SlotId::Two,
            SlotId::Two => SlotId::One,
        }
    }

    pub fn index(self) -> usize {
        match self {
            SlotId::One => 0,
            SlotId::Two => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::One => f.write_str("slot 1"),
            SlotId::Two => f.write_str("slot 2"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Crossfading,
    Stopped,
}

impl PlaybackState {
    /// True while audio is (or is about to be) audible.
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Crossfading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_parses_case_insensitively() {
        assert_eq!("Pink".parse::<NoiseColor>().unwrap(), NoiseColor::Pink);
        assert_eq!(" brown ".parse::<NoiseColor>().unwrap(), NoiseColor::Brown);
        assert!(matches!(
            "green".parse::<NoiseColor>(),
            Err(NoiseError::InvalidParameter(_))
        ));
    }

    #[test]
    fn color_cycle_visits_every_color() {
        let mut c = NoiseColor::White;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(c);
            c = c.next();
        }
        assert_eq!(c, NoiseColor::White);
        assert_eq!(seen, NoiseColor::ALL.to_vec());
    }

    #[test]
    fn block_rejects_out_of_range_samples() {
        assert!(SampleBlock::new(vec![], 100, NoiseColor::White).is_err());
        assert!(SampleBlock::new(vec![0.1], 0, NoiseColor::White).is_err());
        assert!(SampleBlock::new(vec![0.1, 1.5], 100, NoiseColor::White).is_err());
        assert!(SampleBlock::new(vec![f32::NAN], 100, NoiseColor::White).is_err());
        let block = SampleBlock::new(vec![0.0; 50], 100, NoiseColor::Blue).unwrap();
        assert!((block.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn color_serializes_lowercase() {
        let json = serde_json::to_string(&NoiseColor::Brown).unwrap();
        assert_eq!(json, "\"brown\"");
        let state = serde_json::to_string(&PlaybackState::Crossfading).unwrap();
        assert_eq!(state, "\"crossfading\"");
    }

    #[test]
    fn data_uri_has_wav_prefix() {
        let encoded = EncodedBlock {
            bytes: Arc::from(&b"RIFF"[..]),
            color: NoiseColor::White,
            sample_rate: 22050,
            frames: 0,
        };
        assert_eq!(encoded.to_data_uri(), "data:audio/wav;base64,UklGRg==");
    }
}
