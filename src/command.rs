use crate::models::SlotId;
use std::sync::Arc;

/// Control messages for the audio callback. `serial` lets the control side
/// tell whether a seek has been applied yet.
#[derive(Debug)]
pub enum Command {
    /// Replace the buffer of a slot; it is paused at frame 0 afterwards.
    Load {
        slot: SlotId,
        samples: Arc<[f32]>,
        serial: u64,
    },
    Unload(SlotId),
    /// Start or pause a slot
    SetPlaying { slot: SlotId, playing: bool },
    /// Move a slot's playhead to `frame`
    Seek {
        slot: SlotId,
        frame: usize,
        serial: u64,
    },
    /// Per-slot gain (0.0 - 1.0)
    SetVolume { slot: SlotId, volume: f32 },
    SetLooping { slot: SlotId, looping: bool },
}
