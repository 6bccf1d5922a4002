use crate::models::SlotId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NoiseError {
    /// Bad duration, sample rate, volume or block shape. Rejected before any work is done.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The next block for `slot` was not ready when the crossfade point was reached.
    #[error("next block for {slot} was not ready at the crossfade point")]
    SynthesisTimeout { slot: SlotId },

    /// The platform refused to load, start or resume playback.
    #[error("output device error: {0}")]
    OutputDevice(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("payload of {bytes} bytes does not fit a 32-bit WAV length field")]
    PayloadTooLarge { bytes: u64 },

    #[error("malformed audio container: {0}")]
    MalformedContainer(String),
}

impl NoiseError {
    /// Device and allocation failures end the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NoiseError::OutputDevice(_) | NoiseError::ResourceExhausted(_)
        )
    }
}

impl From<hound::Error> for NoiseError {
    fn from(err: hound::Error) -> Self {
        NoiseError::MalformedContainer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NoiseError>;
