use crate::config::StreamConfig;
use crate::crossfade::VolumeRamp;
use crate::device::OutputDevice;
use crate::error::{NoiseError, Result};
use crate::models::{EncodedBlock, NoiseColor, SlotId};
use crate::worker::{BlockSource, SynthesisRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Positions reported by a device can jitter slightly backwards.
const LOOP_EPSILON_SECS: f64 = 1e-6;

/// Lifecycle of the audio held by a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotStatus {
    #[default]
    Empty,
    /// Synthesis requested, not yet delivered.
    Pending,
    /// Delivered and never heard.
    Fresh,
    /// Heard at least once; must be regenerated before it plays again.
    Played,
}

#[derive(Debug, Default)]
struct Slot {
    status: SlotStatus,
    block: Option<EncodedBlock>,
    /// Whether `block` has been handed to the output device.
    loaded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Both bootstrap blocks have arrived; playback can start.
    BuffersReady,
    CrossfadeBegan { incoming: SlotId },
    CrossfadeEnded { active: SlotId },
    /// The standby block missed the crossfade point; the active slot loops instead.
    SynthesisTimeout { slot: SlotId },
}

/// Live playback context. Owned by the scheduler; everything that decides
/// which slot is audible lives here.
#[derive(Debug)]
pub struct StreamSession {
    pub active: SlotId,
    /// Last reported position of the active slot, in seconds.
    pub position: f64,
    pub generating: bool,
    pub target_volume: f32,
    pub color: NoiseColor,
    generation: u64,
    crossfading: Arc<AtomicBool>,
    skipped_this_loop: bool,
}

impl StreamSession {
    fn new(color: NoiseColor, target_volume: f32) -> Self {
        Self {
            active: SlotId::One,
            position: 0.0,
            generating: false,
            target_volume,
            color,
            generation: 0,
            crossfading: Arc::new(AtomicBool::new(false)),
            skipped_this_loop: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_crossfading(&self) -> bool {
        self.crossfading.load(Ordering::Acquire)
    }

    /// Claim the crossfade guard. Returns false if a crossfade already holds it.
    fn try_begin_crossfade(&self) -> bool {
        self.crossfading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_crossfade(&self) {
        self.crossfading.store(false, Ordering::Release);
    }
}

struct ActiveRamp {
    ramp: VolumeRamp,
    incoming: SlotId,
    interval: Duration,
    next_due: Instant,
}

/// Double-buffer scheduler: keeps one slot audible, regenerates the other,
/// and crossfades between them near the end of each block.
pub struct StreamScheduler<D: OutputDevice, B: BlockSource> {
    device: D,
    source: B,
    config: StreamConfig,
    sample_rate: u32,
    session: StreamSession,
    slots: [Slot; 2],
    ramp: Option<ActiveRamp>,
    running: bool,
}

impl<D: OutputDevice, B: BlockSource> StreamScheduler<D, B> {
    pub fn new(device: D, source: B, config: StreamConfig, sample_rate: u32) -> Result<Self> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(NoiseError::InvalidParameter(
                "sample rate must be positive".into(),
            ));
        }
        let session = StreamSession::new(config.color, config.target_volume);
        Ok(Self {
            device,
            source,
            config,
            sample_rate,
            session,
            slots: Default::default(),
            ramp: None,
            running: false,
        })
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn slot_status(&self, slot: SlotId) -> SlotStatus {
        self.slots[slot.index()].status
    }

    /// Both bootstrap blocks delivered and unheard.
    pub fn is_ready(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.status == SlotStatus::Fresh && s.block.is_some())
    }

    /// Both slots still hold buffers on the device, so playback can resume instantly.
    pub fn has_buffers(&self) -> bool {
        self.slots.iter().all(|s| s.loaded)
    }

    /// Drop any previous buffers and request fresh blocks for both slots.
    pub fn bootstrap(&mut self) -> Result<()> {
        self.invalidate();
        self.session.active = SlotId::One;
        self.request_slot(SlotId::One)?;
        self.request_slot(SlotId::Two)?;
        log::info!(
            "bootstrapping {} noise stream at {} Hz",
            self.session.color,
            self.sample_rate
        );
        Ok(())
    }

    /// Load both slots and start the active one at full target volume.
    pub fn start_playback(&mut self) -> Result<()> {
        let active = self.session.active;
        if let Err(e) = self
            .load_slot(active)
            .and_then(|_| self.load_slot(active.other()))
            .and_then(|_| self.begin_active())
        {
            self.pause_loaded();
            self.running = false;
            return Err(e);
        }
        self.slots[active.index()].status = SlotStatus::Played;
        self.session.position = 0.0;
        self.running = true;
        Ok(())
    }

    /// Continue from where `stop` left off without synthesizing anything.
    pub fn resume(&mut self) -> Result<()> {
        if !self.has_buffers() {
            return Err(NoiseError::InvalidParameter(
                "no buffers loaded to resume".into(),
            ));
        }
        if let Err(e) = self.begin_active() {
            self.pause_loaded();
            return Err(e);
        }
        self.running = true;
        log::info!("resumed {}", self.session.active);
        Ok(())
    }

    /// Pause both slots immediately. Safe in every state, including mid-crossfade;
    /// buffers stay loaded.
    pub fn stop(&mut self) {
        if let Some(aborted) = self.ramp.take() {
            self.rewind_quietly(aborted.incoming);
            self.session.end_crossfade();
            log::info!("crossfade into {} aborted", aborted.incoming);
        }
        self.pause_loaded();
        self.running = false;
    }

    /// Stop and unload both slots. The next start re-synthesizes.
    pub fn release(&mut self) {
        self.stop();
        for slot in [SlotId::One, SlotId::Two] {
            if self.slots[slot.index()].loaded {
                self.device.unload(slot);
            }
            self.slots[slot.index()] = Slot::default();
        }
        self.session.generating = false;
        self.session.position = 0.0;
        self.session.skipped_this_loop = false;
    }

    /// Release everything and start a new generation; blocks still being
    /// synthesized are discarded when they arrive.
    pub fn invalidate(&mut self) {
        self.session.generation = self.session.generation.wrapping_add(1);
        self.release();
        // Anything already finished is stale; free its queue space now.
        let mut dropped = 0;
        while self.source.try_recv().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("dropped {} stale synthesis responses", dropped);
        }
    }

    /// Switch color. Existing buffers are of the old color and get released.
    pub fn set_color(&mut self, color: NoiseColor) -> bool {
        if color == self.session.color {
            return false;
        }
        self.session.color = color;
        self.invalidate();
        true
    }

    pub fn set_target_volume(&mut self, volume: f32) -> Result<()> {
        self.session.target_volume = volume;
        if let Some(active_ramp) = self.ramp.as_mut() {
            active_ramp.ramp.set_target(volume);
            return Ok(());
        }
        if self.running {
            self.device.set_volume(self.session.active, volume)?;
        }
        Ok(())
    }

    /// Collect finished blocks and run any volume-ramp steps that are due.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<SchedulerEvent>> {
        let mut events = Vec::new();

        while let Some(res) = self.source.try_recv() {
            if res.generation != self.session.generation {
                log::debug!(
                    "discarding stale block for {} (generation {} != {})",
                    res.slot,
                    res.generation,
                    self.session.generation
                );
                continue;
            }
            let idx = res.slot.index();
            match res.result {
                Ok(block) => {
                    log::debug!(
                        "fresh {} block ready for {} ({:.2}s)",
                        block.color,
                        res.slot,
                        block.duration_secs()
                    );
                    self.slots[idx] = Slot {
                        status: SlotStatus::Fresh,
                        block: Some(block),
                        loaded: false,
                    };
                    if self.running {
                        self.load_slot(res.slot)?;
                    }
                }
                Err(e) => {
                    self.slots[idx] = Slot::default();
                    self.refresh_generating();
                    if !self.running || e.is_terminal() {
                        return Err(e);
                    }
                    log::warn!("synthesis for {} failed: {}; retrying next cycle", res.slot, e);
                }
            }
        }
        self.refresh_generating();

        if !self.running && self.is_ready() {
            events.push(SchedulerEvent::BuffersReady);
        }
        if let Some(ev) = self.advance_due_ramp(now)? {
            events.push(ev);
        }
        Ok(events)
    }

    /// Read the active slot's position from the device and react to it.
    pub fn poll_device(&mut self, now: Instant) -> Result<Vec<SchedulerEvent>> {
        if !self.running {
            return Ok(Vec::new());
        }
        let active = self.session.active;
        match self.device.position(active) {
            Some(position) => self.on_position_update(active, position, now),
            None => Ok(Vec::new()),
        }
    }

    /// Position notification for `slot`. Notifications for the standby slot and
    /// while stopped are ignored.
    pub fn on_position_update(
        &mut self,
        slot: SlotId,
        position: f64,
        now: Instant,
    ) -> Result<Vec<SchedulerEvent>> {
        let mut events = Vec::new();
        let active = self.session.active;
        if !self.running || slot != active {
            return Ok(events);
        }
        if position + LOOP_EPSILON_SECS < self.session.position {
            log::debug!("{} wrapped around its loop", active);
            self.session.skipped_this_loop = false;
        }
        self.session.position = position;

        let block_secs = match self.slots[active.index()].block.as_ref() {
            Some(block) => block.duration_secs(),
            None => return Ok(events),
        };
        let fade_secs = self.config.effective_crossfade_secs(block_secs);
        let crossfade_start = block_secs - fade_secs;
        let prefetch_at = crossfade_start * self.config.prefetch_fraction as f64;
        let standby = active.other();

        if position >= prefetch_at
            && matches!(
                self.slots[standby.index()].status,
                SlotStatus::Empty | SlotStatus::Played
            )
        {
            if let Err(e) = self.request_slot(standby) {
                log::warn!("could not request a fresh block for {}: {}", standby, e);
            }
        }

        if position >= crossfade_start && !self.session.skipped_this_loop {
            if self.slots[standby.index()].status == SlotStatus::Fresh {
                if let Some(ev) = self.begin_crossfade(standby, fade_secs, now)? {
                    events.push(ev);
                }
            } else if !self.session.is_crossfading() {
                self.session.skipped_this_loop = true;
                let err = NoiseError::SynthesisTimeout { slot: standby };
                log::warn!("{}; {} keeps looping on its own", err, active);
                events.push(SchedulerEvent::SynthesisTimeout { slot: standby });
            }
        }
        Ok(events)
    }

    fn request_slot(&mut self, slot: SlotId) -> Result<()> {
        let req = SynthesisRequest {
            slot,
            generation: self.session.generation,
            color: self.session.color,
            block_seconds: self.config.block_seconds,
            sample_rate: self.sample_rate,
            loop_window_seconds: self.config.loop_window_seconds,
            loop_envelope: self.config.loop_envelope,
        };
        self.source.request(req)?;
        self.slots[slot.index()].status = SlotStatus::Pending;
        self.session.generating = true;
        log::debug!("requested fresh {} block for {}", self.session.color, slot);
        Ok(())
    }

    fn refresh_generating(&mut self) {
        self.session.generating = self
            .slots
            .iter()
            .any(|s| s.status == SlotStatus::Pending);
    }

    fn load_slot(&mut self, slot: SlotId) -> Result<()> {
        let idx = slot.index();
        if self.slots[idx].loaded {
            return Ok(());
        }
        let block = self.slots[idx].block.as_ref().ok_or_else(|| {
            NoiseError::InvalidParameter(format!("{slot} has no block to load"))
        })?;
        self.device.load(slot, block)?;
        self.device.set_looping(slot, true)?;
        self.slots[idx].loaded = true;
        Ok(())
    }

    fn begin_active(&mut self) -> Result<()> {
        let active = self.session.active;
        let standby = active.other();
        self.device.set_volume(standby, 0.0)?;
        self.device.pause(standby)?;
        self.device.set_volume(active, self.session.target_volume)?;
        self.device.play(active)
    }

    fn begin_crossfade(
        &mut self,
        incoming: SlotId,
        fade_secs: f64,
        now: Instant,
    ) -> Result<Option<SchedulerEvent>> {
        if !self.session.try_begin_crossfade() {
            return Ok(None);
        }
        let started = self
            .load_slot(incoming)
            .and_then(|_| self.device.set_position(incoming, 0.0))
            .and_then(|_| self.device.set_volume(incoming, 0.0))
            .and_then(|_| self.device.play(incoming));
        if let Err(e) = started {
            let _ = self.device.pause(incoming);
            self.session.end_crossfade();
            return Err(e);
        }

        let steps = self.config.ramp_steps;
        let interval = Duration::from_secs_f64(fade_secs / steps as f64);
        self.ramp = Some(ActiveRamp {
            ramp: VolumeRamp::new(self.session.target_volume, steps, self.config.ramp_curve),
            incoming,
            interval,
            next_due: now + interval,
        });
        log::info!(
            "crossfading {} -> {} over {:.2}s in {} steps",
            self.session.active,
            incoming,
            fade_secs,
            steps
        );
        Ok(Some(SchedulerEvent::CrossfadeBegan { incoming }))
    }

    fn advance_due_ramp(&mut self, now: Instant) -> Result<Option<SchedulerEvent>> {
        loop {
            let Some(active_ramp) = self.ramp.as_mut() else {
                return Ok(None);
            };
            if now < active_ramp.next_due {
                return Ok(None);
            }
            let incoming = active_ramp.incoming;
            let Some((v_out, v_in)) = active_ramp.ramp.advance() else {
                return self.finish_crossfade(incoming).map(Some);
            };
            active_ramp.next_due += active_ramp.interval;
            let complete = active_ramp.ramp.is_complete();

            let outgoing = self.session.active;
            self.device.set_volume(outgoing, v_out)?;
            self.device.set_volume(incoming, v_in)?;
            if complete {
                return self.finish_crossfade(incoming).map(Some);
            }
        }
    }

    fn finish_crossfade(&mut self, incoming: SlotId) -> Result<SchedulerEvent> {
        self.ramp = None;
        let outgoing = self.session.active;
        let target = self.session.target_volume;
        let result = self
            .device
            .pause(outgoing)
            .and_then(|_| self.device.set_position(outgoing, 0.0))
            .and_then(|_| self.device.set_volume(outgoing, target))
            .and_then(|_| self.device.set_volume(incoming, target));

        self.slots[outgoing.index()].status = SlotStatus::Played;
        self.slots[incoming.index()].status = SlotStatus::Played;
        self.session.active = incoming;
        self.session.position = self.device.position(incoming).unwrap_or(0.0);
        self.session.skipped_this_loop = false;
        self.session.end_crossfade();
        result?;

        log::info!("crossfade complete, {} is now active", incoming);
        Ok(SchedulerEvent::CrossfadeEnded { active: incoming })
    }

    fn rewind_quietly(&mut self, slot: SlotId) {
        let target = self.session.target_volume;
        let result = self
            .device
            .pause(slot)
            .and_then(|_| self.device.set_position(slot, 0.0))
            .and_then(|_| self.device.set_volume(slot, target));
        if let Err(e) = result {
            log::warn!("failed to rewind {}: {}", slot, e);
        }
    }

    fn pause_loaded(&mut self) {
        for slot in [SlotId::One, SlotId::Two] {
            if self.slots[slot.index()].loaded {
                if let Err(e) = self.device.pause(slot) {
                    log::warn!("failed to pause {}: {}", slot, e);
                }
            }
        }
    }
}
