use crate::models::SampleBlock;
use serde::{Deserialize, Serialize};

/// Blend-weight curve mapping window position `t` in [0, 1] to the weight of
/// the incoming signal. Every curve is monotonic with `w(0) = 0` and `w(1) = 1`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Linear,
    RaisedCosine,
    /// Quintic `6t^5 - 15t^4 + 10t^3`; flat first and second derivatives at both ends.
    #[default]
    Smootherstep,
}

impl Envelope {
    pub fn weight(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Envelope::Linear => t,
            Envelope::RaisedCosine => 0.5 * (1.0 - (std::f32::consts::PI * t).cos()),
            Envelope::Smootherstep => t * t * t * (t * (t * 6.0 - 15.0) + 10.0),
        }
    }

    /// `(outgoing, incoming)` gains at `t`.
    pub fn gains(self, t: f32) -> (f32, f32) {
        let w = self.weight(t);
        (1.0 - w, w)
    }
}

/// Blend the head of `incoming` over the tail of `outgoing`, in place.
///
/// A window longer than either block is clamped to the shorter block rather
/// than rejected. Returns the window actually used.
pub fn blend(
    outgoing: &mut SampleBlock,
    incoming: &SampleBlock,
    window_len: usize,
    envelope: Envelope,
) -> usize {
    let window = window_len.min(outgoing.len()).min(incoming.len());
    if window < window_len {
        log::debug!(
            "crossfade window clamped from {} to {} samples",
            window_len,
            window
        );
    }
    if window == 0 {
        return 0;
    }

    let start = outgoing.len() - window;
    let tail = &mut outgoing.samples_mut()[start..];
    for (i, (out, &inc)) in tail
        .iter_mut()
        .zip(&incoming.samples()[..window])
        .enumerate()
    {
        let (g_out, g_in) = envelope.gains(i as f32 / window as f32);
        *out = (*out * g_out + inc * g_in).clamp(-1.0, 1.0);
    }
    window
}

/// Fold the first `window` samples of a block into its tail and drop them, so
/// that playing the result on a device-level loop has no seam at the wrap.
///
/// The window is limited to half the block so some unblended material remains.
pub fn make_loopable(mut block: SampleBlock, window: usize, envelope: Envelope) -> SampleBlock {
    let window = window.min(block.len() / 2);
    if window == 0 {
        return block;
    }
    let head = match SampleBlock::new(
        block.samples()[..window].to_vec(),
        block.sample_rate(),
        block.color(),
    ) {
        Ok(head) => head,
        Err(_) => return block,
    };
    blend(&mut block, &head, window, envelope);
    block.samples_mut().drain(..window);
    block
}

/// Discrete two-slot volume ramp: `steps` evenly spaced points from
/// (target, 0) to (0, target).
#[derive(Debug, Clone)]
pub struct VolumeRamp {
    target: f32,
    steps: u32,
    step: u32,
    curve: Envelope,
}

impl VolumeRamp {
    pub fn new(target: f32, steps: u32, curve: Envelope) -> Self {
        Self {
            target,
            steps: steps.max(1),
            step: 0,
            curve,
        }
    }

    /// `(volume_out, volume_in)` at `step`.
    pub fn volumes_at(&self, step: u32) -> (f32, f32) {
        let t = step.min(self.steps) as f32 / self.steps as f32;
        let (g_out, g_in) = self.curve.gains(t);
        (self.target * g_out, self.target * g_in)
    }

    /// Move to the next step, returning its volumes, or `None` once complete.
    pub fn advance(&mut self) -> Option<(f32, f32)> {
        if self.step >= self.steps {
            return None;
        }
        self.step += 1;
        Some(self.volumes_at(self.step))
    }

    pub fn is_complete(&self) -> bool {
        self.step >= self.steps
    }

    /// Retarget mid-ramp; the next step uses the new level.
    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }
}
