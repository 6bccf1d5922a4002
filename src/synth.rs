use crate::error::{NoiseError, Result};
use crate::models::{NoiseColor, SampleBlock};
use rand::Rng;

// --- Output headroom ---
// Shaped noise is scaled by this factor before clamping so the filters rarely
// touch the rails. Matches the 0.5 gain the player used for raw white noise.
pub const DEFAULT_HEADROOM: f32 = 0.5;

// --- Brown noise leaky integrator ---
// y[n] = (y[n-1] + STEP * x[n]) / LEAK keeps the walk bounded to |y| <= 1.
const BROWN_STEP: f32 = 0.02;
const BROWN_LEAK: f32 = 1.02;
// Restores roughly the loudness of the white source after integration.
const BROWN_MAKEUP: f32 = 3.5;

// --- Pink noise (Kellett "refined" filter) ---
// Staggered one-pole low-pass stages whose sum approximates a -3 dB/octave slope.
const PINK_POLES: [f32; 6] = [0.99886, 0.99332, 0.96900, 0.86650, 0.55000, -0.7616];
const PINK_GAINS: [f32; 6] = [0.0555179, 0.0750759, 0.1538520, 0.3104856, 0.5329522, -0.0168980];
const PINK_DIRECT: f32 = 0.5362;
const PINK_DELAYED: f32 = 0.115926;
const PINK_MAKEUP: f32 = 0.11;

// --- Blue noise differencing ---
// x[n] - x[n-1] spans [-2, 2]; halve it back to the source range.
const BLUE_SCALE: f32 = 0.5;

/// Source of independent uniform values in [-1, 1].
///
/// Every `rand::Rng` is a source, so production code uses an entropy-seeded
/// `StdRng` and tests use `StdRng::seed_from_u64`.
pub trait NoiseSource: Send {
    fn next_bipolar(&mut self) -> f32;
}

impl<R: Rng + Send> NoiseSource for R {
    fn next_bipolar(&mut self) -> f32 {
        self.gen_range(-1.0f32..=1.0)
    }
}

/// Fixed-coefficient spectral shaping applied to the white source.
///
/// State starts at zero for every block, so the output is a pure function of
/// the input noise.
#[derive(Debug, Clone)]
pub enum ColorFilter {
    White,
    Pink { stages: [f32; 6], delayed: f32 },
    Brown { last: f32 },
    Blue { prev: f32 },
}

impl ColorFilter {
    pub fn new(color: NoiseColor) -> Self {
        match color {
            NoiseColor::White => ColorFilter::White,
            NoiseColor::Pink => ColorFilter::Pink {
                stages: [0.0; 6],
                delayed: 0.0,
            },
            NoiseColor::Brown => ColorFilter::Brown { last: 0.0 },
            NoiseColor::Blue => ColorFilter::Blue { prev: 0.0 },
        }
    }

    pub fn process(&mut self, white: f32) -> f32 {
        match self {
            ColorFilter::White => white,
            ColorFilter::Pink { stages, delayed } => {
                let mut sum = 0.0;
                for ((stage, pole), gain) in stages.iter_mut().zip(PINK_POLES).zip(PINK_GAINS) {
                    *stage = pole * *stage + white * gain;
                    sum += *stage;
                }
                let out = sum + *delayed + white * PINK_DIRECT;
                *delayed = white * PINK_DELAYED;
                out * PINK_MAKEUP
            }
            ColorFilter::Brown { last } => {
                *last = (*last + BROWN_STEP * white) / BROWN_LEAK;
                *last * BROWN_MAKEUP
            }
            ColorFilter::Blue { prev } => {
                let out = (white - *prev) * BLUE_SCALE;
                *prev = white;
                out
            }
        }
    }
}

/// Generates fresh blocks of colored noise from an injected random source.
pub struct NoiseSynthesizer<S: NoiseSource> {
    source: S,
    headroom: f32,
}

impl<S: NoiseSource> NoiseSynthesizer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            headroom: DEFAULT_HEADROOM,
        }
    }

    pub fn with_headroom(mut self, headroom: f32) -> Self {
        self.headroom = headroom.clamp(0.0, 1.0);
        self
    }

    /// Produce `round(duration_secs * sample_rate)` samples of `color`.
    pub fn synthesize(
        &mut self,
        color: NoiseColor,
        duration_secs: f32,
        sample_rate: u32,
    ) -> Result<SampleBlock> {
        let frames = block_frames(duration_secs, sample_rate)?;

        let mut samples: Vec<f32> = Vec::new();
        samples.try_reserve_exact(frames).map_err(|e| {
            NoiseError::ResourceExhausted(format!("cannot allocate {frames} samples: {e}"))
        })?;

        let mut filter = ColorFilter::new(color);
        for _ in 0..frames {
            let white = self.source.next_bipolar();
            let shaped = filter.process(white) * self.headroom;
            samples.push(shaped.clamp(-1.0, 1.0));
        }

        SampleBlock::new(samples, sample_rate, color)
    }
}

/// Number of frames for a block, validating the request.
pub fn block_frames(duration_secs: f32, sample_rate: u32) -> Result<usize> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(NoiseError::InvalidParameter(format!(
            "duration must be positive, got {duration_secs}"
        )));
    }
    if sample_rate == 0 {
        return Err(NoiseError::InvalidParameter(
            "sample rate must be positive".into(),
        ));
    }
    let frames = (duration_secs as f64 * sample_rate as f64).round();
    if frames < 1.0 {
        return Err(NoiseError::InvalidParameter(format!(
            "{duration_secs}s at {sample_rate} Hz yields no samples"
        )));
    }
    if frames > usize::MAX as f64 {
        return Err(NoiseError::ResourceExhausted(format!(
            "{frames} samples exceed addressable memory"
        )));
    }
    Ok(frames as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct ConstSource(f32);

    impl NoiseSource for ConstSource {
        fn next_bipolar(&mut self) -> f32 {
            self.0
        }
    }

    fn seeded(seed: u64) -> NoiseSynthesizer<StdRng> {
        NoiseSynthesizer::new(StdRng::seed_from_u64(seed))
    }

    fn lag1_autocorrelation(x: &[f32]) -> f32 {
        let mean = x.iter().sum::<f32>() / x.len() as f32;
        let var: f32 = x.iter().map(|v| (v - mean) * (v - mean)).sum();
        let cov: f32 = x
            .windows(2)
            .map(|w| (w[0] - mean) * (w[1] - mean))
            .sum();
        cov / var
    }

    #[test]
    fn block_length_matches_duration_for_every_color() {
        let mut synth = seeded(7);
        for color in NoiseColor::ALL {
            for (duration, rate) in [(1.0f32, 8000u32), (0.25, 22050), (2.5, 100)] {
                let block = synth.synthesize(color, duration, rate).unwrap();
                let expected = (duration as f64 * rate as f64).round() as usize;
                assert_eq!(block.len(), expected, "{color} {duration}s @ {rate}");
                assert_eq!(block.color(), color);
                assert_eq!(block.sample_rate(), rate);
                assert!(block.samples().iter().all(|s| (-1.0..=1.0).contains(s)));
            }
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut synth = seeded(1);
        for duration in [0.0f32, -1.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                synth.synthesize(NoiseColor::White, duration, 44100),
                Err(NoiseError::InvalidParameter(_))
            ));
        }
        assert!(matches!(
            synth.synthesize(NoiseColor::Pink, 1.0, 0),
            Err(NoiseError::InvalidParameter(_))
        ));
        assert!(matches!(
            synth.synthesize(NoiseColor::Pink, 0.0001, 100),
            Err(NoiseError::InvalidParameter(_))
        ));
    }

    #[test]
    fn same_seed_gives_same_block() {
        for color in NoiseColor::ALL {
            let a = seeded(42).synthesize(color, 0.5, 8000).unwrap();
            let b = seeded(42).synthesize(color, 0.5, 8000).unwrap();
            assert_eq!(a, b);
        }
        let a = seeded(1).synthesize(NoiseColor::White, 0.5, 8000).unwrap();
        let b = seeded(2).synthesize(NoiseColor::White, 0.5, 8000).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn white_applies_headroom() {
        let mut synth = NoiseSynthesizer::new(ConstSource(1.0));
        let block = synth.synthesize(NoiseColor::White, 1.0, 10).unwrap();
        assert!(block.samples().iter().all(|s| (*s - 0.5).abs() < 1e-6));

        let mut loud = NoiseSynthesizer::new(ConstSource(1.0)).with_headroom(1.0);
        let block = loud.synthesize(NoiseColor::White, 1.0, 10).unwrap();
        assert!(block.samples().iter().all(|s| (*s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn brown_integrates_without_drifting_out_of_range() {
        let mut synth = NoiseSynthesizer::new(ConstSource(0.5));
        let block = synth.synthesize(NoiseColor::Brown, 1.0, 2000).unwrap();
        let s = block.samples();
        assert!(s.windows(2).all(|w| w[1] >= w[0]));
        // Fixed point of the leaky integrator is the input value.
        let settled = 0.5 * BROWN_MAKEUP * DEFAULT_HEADROOM;
        assert!((s[s.len() - 1] - settled).abs() < 1e-3);
    }

    #[test]
    fn blue_is_first_difference() {
        let mut synth = NoiseSynthesizer::new(ConstSource(0.5));
        let block = synth.synthesize(NoiseColor::Blue, 1.0, 10).unwrap();
        assert!((block.samples()[0] - 0.125).abs() < 1e-6);
        assert!(block.samples()[1..].iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn colors_have_expected_spectral_tilt() {
        let mut synth = seeded(99);
        let white = synth.synthesize(NoiseColor::White, 1.0, 8000).unwrap();
        let pink = synth.synthesize(NoiseColor::Pink, 1.0, 8000).unwrap();
        let brown = synth.synthesize(NoiseColor::Brown, 1.0, 8000).unwrap();
        let blue = synth.synthesize(NoiseColor::Blue, 1.0, 8000).unwrap();

        assert!(lag1_autocorrelation(white.samples()).abs() < 0.1);
        assert!(lag1_autocorrelation(pink.samples()) > 0.3);
        assert!(lag1_autocorrelation(brown.samples()) > 0.9);
        assert!(lag1_autocorrelation(blue.samples()) < -0.3);
    }
}
