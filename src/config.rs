use crate::crossfade::Envelope;
use crate::error::{NoiseError, Result};
use crate::models::NoiseColor;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "ENDLESS_NOISE_CONFIG";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamConfig {
    #[serde(default)]
    pub color: NoiseColor,
    /// Synthesis rate in Hz. `0` means "use the output device's default".
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_block_seconds")]
    pub block_seconds: f32,
    /// Requested crossfade length; limited to half a block at runtime.
    #[serde(default = "default_crossfade_seconds")]
    pub crossfade_seconds: f32,
    #[serde(default = "default_ramp_steps")]
    pub ramp_steps: u32,
    #[serde(default = "default_ramp_curve")]
    pub ramp_curve: Envelope,
    /// Tail-to-head fold applied to every block so the device loop fallback is seamless.
    #[serde(default = "default_loop_window_seconds")]
    pub loop_window_seconds: f32,
    #[serde(default)]
    pub loop_envelope: Envelope,
    #[serde(default = "default_target_volume")]
    pub target_volume: f32,
    #[serde(default = "default_headroom")]
    pub headroom: f32,
    /// Fraction of the crossfade start at which a stale inactive slot is regenerated.
    #[serde(default = "default_prefetch_fraction")]
    pub prefetch_fraction: f32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Synthesize on a worker thread instead of the notification path.
    #[serde(default = "default_true")]
    pub background_synthesis: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_sample_rate() -> u32 {
    22050
}

fn default_block_seconds() -> f32 {
    10.0
}

fn default_crossfade_seconds() -> f32 {
    1.0
}

fn default_ramp_steps() -> u32 {
    50
}

fn default_ramp_curve() -> Envelope {
    Envelope::Linear
}

fn default_loop_window_seconds() -> f32 {
    0.05
}

fn default_target_volume() -> f32 {
    0.5
}

fn default_headroom() -> f32 {
    crate::synth::DEFAULT_HEADROOM
}

fn default_prefetch_fraction() -> f32 {
    0.5
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            color: NoiseColor::default(),
            sample_rate: default_sample_rate(),
            block_seconds: default_block_seconds(),
            crossfade_seconds: default_crossfade_seconds(),
            ramp_steps: default_ramp_steps(),
            ramp_curve: default_ramp_curve(),
            loop_window_seconds: default_loop_window_seconds(),
            loop_envelope: Envelope::default(),
            target_volume: default_target_volume(),
            headroom: default_headroom(),
            prefetch_fraction: default_prefetch_fraction(),
            poll_interval_ms: default_poll_interval_ms(),
            background_synthesis: true,
            seed: None,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f32| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(NoiseError::InvalidParameter(format!(
                    "{name} must be positive, got {v}"
                )))
            }
        };
        positive("block_seconds", self.block_seconds)?;
        positive("crossfade_seconds", self.crossfade_seconds)?;
        if !(0.0..=1.0).contains(&self.target_volume) {
            return Err(NoiseError::InvalidParameter(format!(
                "target_volume must be within [0, 1], got {}",
                self.target_volume
            )));
        }
        if !(0.0..=1.0).contains(&self.headroom) {
            return Err(NoiseError::InvalidParameter(format!(
                "headroom must be within [0, 1], got {}",
                self.headroom
            )));
        }
        if !(0.0..=1.0).contains(&self.prefetch_fraction) {
            return Err(NoiseError::InvalidParameter(format!(
                "prefetch_fraction must be within [0, 1], got {}",
                self.prefetch_fraction
            )));
        }
        if !self.loop_window_seconds.is_finite() || self.loop_window_seconds < 0.0 {
            return Err(NoiseError::InvalidParameter(format!(
                "loop_window_seconds must not be negative, got {}",
                self.loop_window_seconds
            )));
        }
        if self.ramp_steps == 0 {
            return Err(NoiseError::InvalidParameter(
                "ramp_steps must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(NoiseError::InvalidParameter(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Crossfade used for a block of `block_secs`: never more than half the block.
    pub fn effective_crossfade_secs(&self, block_secs: f64) -> f64 {
        (self.crossfade_seconds as f64).min(block_secs / 2.0)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Read a TOML config. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let txt = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let cfg: StreamConfig = toml::from_str(&txt)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the configuration as TOML to the provided path
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, toml_str)
    }

    /// Generate a default configuration file at the given path
    pub fn generate_default<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
        Self::default().write_to_file(path)
    }
}

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub static CONFIG: Lazy<StreamConfig> = Lazy::new(|| {
    let path = config_path();
    if !path.exists() {
        return StreamConfig::default();
    }
    match StreamConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("{e}; falling back to defaults");
            StreamConfig::default()
        }
    }
});
