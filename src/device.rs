use crate::error::Result;
use crate::models::{EncodedBlock, SlotId};

/// Platform audio output with two independently controllable players.
///
/// Implementations own whatever the platform needs to keep a buffer playing;
/// the scheduler only ever talks to the device through these calls.
pub trait OutputDevice: Send {
    /// Replace the buffer held by `slot`. The slot stays paused at position 0.
    fn load(&mut self, slot: SlotId, block: &EncodedBlock) -> Result<()>;
    fn unload(&mut self, slot: SlotId);
    fn play(&mut self, slot: SlotId) -> Result<()>;
    fn pause(&mut self, slot: SlotId) -> Result<()>;
    fn set_position(&mut self, slot: SlotId, seconds: f64) -> Result<()>;
    fn set_volume(&mut self, slot: SlotId, volume: f32) -> Result<()>;
    fn set_looping(&mut self, slot: SlotId, looping: bool) -> Result<()>;
    /// Current playback position of `slot` in seconds, `None` when nothing is loaded.
    fn position(&self, slot: SlotId) -> Option<f64>;
}
