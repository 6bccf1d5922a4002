use crate::crossfade::{self, Envelope};
use crate::error::{NoiseError, Result};
use crate::models::{EncodedBlock, NoiseColor, SlotId};
use crate::synth::{NoiseSource, NoiseSynthesizer};
use crate::wav;
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::thread;

// Room for a bootstrap pair plus one cancelled pair still being rendered.
// Finished stale responses are drained on invalidation, so only requests the
// worker has not reached yet count against this.
const QUEUE_CAPACITY: usize = 4;

/// Everything needed to produce one playable block for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub slot: SlotId,
    /// Session generation the block belongs to. Responses from an older
    /// generation are discarded by the scheduler.
    pub generation: u64,
    pub color: NoiseColor,
    pub block_seconds: f32,
    pub sample_rate: u32,
    pub loop_window_seconds: f32,
    pub loop_envelope: Envelope,
}

#[derive(Debug)]
pub struct SynthesisResponse {
    pub slot: SlotId,
    pub generation: u64,
    pub result: Result<EncodedBlock>,
}

/// Where the scheduler gets fresh blocks from. `request` must never block.
pub trait BlockSource: Send {
    fn request(&mut self, req: SynthesisRequest) -> Result<()>;
    fn try_recv(&mut self) -> Option<SynthesisResponse>;
}

impl<T: BlockSource + ?Sized> BlockSource for Box<T> {
    fn request(&mut self, req: SynthesisRequest) -> Result<()> {
        (**self).request(req)
    }

    fn try_recv(&mut self) -> Option<SynthesisResponse> {
        (**self).try_recv()
    }
}

/// Synthesize, fold for looping and encode one block.
///
/// The block is synthesized `loop_window_seconds` longer than requested so the
/// fold leaves it at the requested length.
pub fn render_block<S: NoiseSource>(
    synth: &mut NoiseSynthesizer<S>,
    req: &SynthesisRequest,
) -> Result<EncodedBlock> {
    let window_secs = req.loop_window_seconds.max(0.0);
    let raw = synth.synthesize(req.color, req.block_seconds + window_secs, req.sample_rate)?;
    let window = (window_secs as f64 * req.sample_rate as f64).round() as usize;
    let block = crossfade::make_loopable(raw, window, req.loop_envelope);
    wav::encode_block(&block)
}

/// Synthesizes on the caller's thread. Suitable where a block takes a small
/// fraction of its own duration to generate, and for tests.
pub struct InlineSource<S: NoiseSource> {
    synth: NoiseSynthesizer<S>,
    ready: VecDeque<SynthesisResponse>,
}

impl<S: NoiseSource> InlineSource<S> {
    pub fn new(synth: NoiseSynthesizer<S>) -> Self {
        Self {
            synth,
            ready: VecDeque::new(),
        }
    }
}

impl InlineSource<StdRng> {
    pub fn seeded(seed: Option<u64>, headroom: f32) -> Self {
        Self::new(NoiseSynthesizer::new(make_rng(seed)).with_headroom(headroom))
    }
}

impl<S: NoiseSource> BlockSource for InlineSource<S> {
    fn request(&mut self, req: SynthesisRequest) -> Result<()> {
        let result = render_block(&mut self.synth, &req);
        self.ready.push_back(SynthesisResponse {
            slot: req.slot,
            generation: req.generation,
            result,
        });
        Ok(())
    }

    fn try_recv(&mut self) -> Option<SynthesisResponse> {
        self.ready.pop_front()
    }
}

struct SynthesisWorker {
    rx: Receiver<SynthesisRequest>,
    tx: Sender<SynthesisResponse>,
    synth: NoiseSynthesizer<StdRng>,
}

impl SynthesisWorker {
    fn run(mut self) {
        while let Ok(req) = self.rx.recv() {
            // A panic here must not take the stream down with it.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                render_block(&mut self.synth, &req)
            }))
            .unwrap_or_else(|e| {
                log::error!("synthesis worker panic: {:?}", e);
                Err(NoiseError::ResourceExhausted(
                    "synthesis worker panicked".into(),
                ))
            });
            if self
                .tx
                .send(SynthesisResponse {
                    slot: req.slot,
                    generation: req.generation,
                    result,
                })
                .is_err()
            {
                break;
            }
        }
        log::debug!("synthesis worker channel closed - thread exiting");
    }
}

/// Synthesizes on a dedicated background thread.
pub struct WorkerSource {
    tx: Sender<SynthesisRequest>,
    rx: Receiver<SynthesisResponse>,
}

impl WorkerSource {
    pub fn spawn(seed: Option<u64>, headroom: f32) -> Result<Self> {
        let (req_tx, req_rx) = bounded::<SynthesisRequest>(QUEUE_CAPACITY);
        let (res_tx, res_rx) = bounded::<SynthesisResponse>(QUEUE_CAPACITY);

        let worker = SynthesisWorker {
            rx: req_rx,
            tx: res_tx,
            synth: NoiseSynthesizer::new(make_rng(seed)).with_headroom(headroom),
        };
        thread::Builder::new()
            .name("noise-synthesis".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                NoiseError::ResourceExhausted(format!("cannot spawn synthesis worker: {e}"))
            })?;

        Ok(Self {
            tx: req_tx,
            rx: res_rx,
        })
    }
}

impl BlockSource for WorkerSource {
    fn request(&mut self, req: SynthesisRequest) -> Result<()> {
        match self.tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(req)) => Err(NoiseError::ResourceExhausted(format!(
                "synthesis queue full, dropped request for {}",
                req.slot
            ))),
            Err(TrySendError::Disconnected(_)) => Err(NoiseError::ResourceExhausted(
                "synthesis worker is gone".into(),
            )),
        }
    }

    fn try_recv(&mut self) -> Option<SynthesisResponse> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::error!("synthesis worker disconnected");
                None
            }
        }
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
