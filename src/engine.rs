use crate::config::StreamConfig;
use crate::controller::PlaybackController;
use crate::device::OutputDevice;
use crate::models::{NoiseColor, PlaybackState, SlotId};
use crate::worker::BlockSource;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Snapshot of the engine for UI display.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: PlaybackState,
    pub color: NoiseColor,
    pub volume: f32,
    pub active_slot: SlotId,
    pub position_secs: f64,
    pub generating: bool,
    pub crossfading: bool,
    pub sample_rate: u32,
    pub last_error: Option<String>,
}

type Shared<D, B> = Arc<Mutex<PlaybackController<D, B>>>;

/// Thread-safe facade over a `PlaybackController` with a driver thread that
/// polls it at the configured interval.
pub struct NoiseEngine<D, B>
where
    D: OutputDevice + 'static,
    B: BlockSource + 'static,
{
    controller: Shared<D, B>,
    last_error: Arc<Mutex<Option<String>>>,
    stop_tx: Sender<()>,
    driver: Option<JoinHandle<()>>,
}

impl<D, B> NoiseEngine<D, B>
where
    D: OutputDevice + 'static,
    B: BlockSource + 'static,
{
    pub fn new(
        device: D,
        source: B,
        config: &StreamConfig,
        sample_rate: u32,
    ) -> anyhow::Result<Self> {
        let controller = PlaybackController::new(device, source, config, sample_rate)
            .map_err(|e| anyhow::anyhow!("Invalid stream setup: {}", e))?;
        let controller = Arc::new(Mutex::new(controller));
        let last_error = Arc::new(Mutex::new(None));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let driver = {
            let controller = Arc::clone(&controller);
            let last_error = Arc::clone(&last_error);
            let interval = config.poll_interval();
            thread::Builder::new()
                .name("noise-driver".into())
                .spawn(move || drive(controller, last_error, stop_rx, interval))
                .map_err(|e| anyhow::anyhow!("Failed to spawn driver thread: {}", e))?
        };

        Ok(Self {
            controller,
            last_error,
            stop_tx,
            driver: Some(driver),
        })
    }

    pub fn toggle(&self) -> anyhow::Result<PlaybackState> {
        let state = self.controller.lock().toggle()?;
        Ok(state)
    }

    pub fn state(&self) -> PlaybackState {
        self.controller.lock().state()
    }

    pub fn set_color(&self, color: NoiseColor) -> anyhow::Result<PlaybackState> {
        let state = self.controller.lock().set_color(color)?;
        Ok(state)
    }

    pub fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.controller.lock().set_volume(volume)?;
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let ctl = self.controller.lock();
        let session = ctl.session();
        EngineStatus {
            state: ctl.state(),
            color: session.color,
            volume: session.target_volume,
            active_slot: session.active,
            position_secs: session.position,
            generating: session.generating,
            crossfading: session.is_crossfading(),
            sample_rate: ctl.scheduler().sample_rate(),
            last_error: self.last_error.lock().clone(),
        }
    }

    pub fn status_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.status())
            .map_err(|e| anyhow::anyhow!("Failed to serialize status: {}", e))
    }

    /// Most recent error raised on the driver thread, if any.
    pub fn take_error(&self) -> Option<String> {
        self.last_error.lock().take()
    }

    /// Stop the driver and release both slots. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.driver.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if handle.join().is_err() {
            log::error!("noise driver thread panicked");
        }
        self.controller.lock().teardown();
        log::info!("noise engine shut down");
    }
}

impl<D, B> Drop for NoiseEngine<D, B>
where
    D: OutputDevice + 'static,
    B: BlockSource + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drive<D: OutputDevice, B: BlockSource>(
    controller: Shared<D, B>,
    last_error: Arc<Mutex<Option<String>>>,
    stop_rx: Receiver<()>,
    interval: Duration,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let mut ctl = controller.lock();
        if let Err(e) = ctl.poll(Instant::now()) {
            log::error!("stream stopped: {}", e);
            *last_error.lock() = Some(e.to_string());
        }
    }
    log::debug!("noise driver exiting");
}

#[cfg(not(target_arch = "wasm32"))]
mod platform {
    use super::NoiseEngine;
    use crate::audio_io::CpalOutput;
    use crate::config::StreamConfig;
    use crate::worker::{BlockSource, InlineSource, WorkerSource};

    pub type DefaultEngine = NoiseEngine<CpalOutput, Box<dyn BlockSource>>;

    /// Open the default output device and start an idle engine on it.
    pub fn open_default(config: &StreamConfig) -> anyhow::Result<DefaultEngine> {
        config.validate()?;
        let device = CpalOutput::open(config.sample_rate)
            .map_err(|e| anyhow::anyhow!("Failed to open audio output: {}", e))?;
        let sample_rate = device.sample_rate();
        let source: Box<dyn BlockSource> = if config.background_synthesis {
            Box::new(WorkerSource::spawn(config.seed, config.headroom)?)
        } else {
            Box::new(InlineSource::seeded(config.seed, config.headroom))
        };
        log::info!(
            "engine ready: {} noise, {} Hz, {:.1}s blocks",
            config.color,
            sample_rate,
            config.block_seconds
        );
        NoiseEngine::new(device, source, config, sample_rate)
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use platform::{open_default, DefaultEngine};
