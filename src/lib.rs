//! Endless colored-noise streaming: double-buffered synthesis with seamless
//! crossfades between two output slots.

#[cfg(not(target_arch = "wasm32"))]
pub mod audio_io;
#[cfg(not(target_arch = "wasm32"))]
pub mod command;
pub mod config;
pub mod controller;
pub mod crossfade;
pub mod device;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod synth;
pub mod wav;
pub mod worker;

pub use config::{StreamConfig, CONFIG};
pub use controller::{PlaybackController, PlaybackEvent};
pub use crossfade::Envelope;
pub use device::OutputDevice;
pub use engine::{EngineStatus, NoiseEngine};
#[cfg(not(target_arch = "wasm32"))]
pub use engine::{open_default, DefaultEngine};
pub use error::{NoiseError, Result};
pub use models::{EncodedBlock, NoiseColor, PlaybackState, SampleBlock, SlotId};
pub use scheduler::{SchedulerEvent, StreamScheduler, StreamSession};
pub use synth::NoiseSynthesizer;
pub use worker::{BlockSource, InlineSource, WorkerSource};
