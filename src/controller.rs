use crate::config::StreamConfig;
use crate::device::OutputDevice;
use crate::error::{NoiseError, Result};
use crate::models::{NoiseColor, PlaybackState, SlotId};
use crate::scheduler::{SchedulerEvent, StreamScheduler, StreamSession};
use crate::worker::BlockSource;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Toggle,
    BuffersReady,
    BootstrapFailed,
    /// The device failed while audio was running.
    DeviceFailed,
    CrossfadeBegan,
    CrossfadeEnded,
    ColorChanged,
    Teardown,
}

/// Transition table for the user-visible playback state. `None` means the
/// event does not apply in `state`.
pub fn transition(state: PlaybackState, event: PlaybackEvent) -> Option<PlaybackState> {
    use PlaybackEvent as E;
    use PlaybackState as S;
    match (state, event) {
        (_, E::Teardown) => Some(S::Idle),
        (S::Idle | S::Stopped, E::Toggle) => Some(S::Loading),
        (S::Loading | S::Playing | S::Crossfading, E::Toggle) => Some(S::Stopped),
        (S::Loading, E::BuffersReady) => Some(S::Playing),
        (S::Loading, E::BootstrapFailed) => Some(S::Stopped),
        (S::Playing | S::Crossfading, E::DeviceFailed) => Some(S::Stopped),
        (S::Playing, E::CrossfadeBegan) => Some(S::Crossfading),
        (S::Crossfading, E::CrossfadeEnded) => Some(S::Playing),
        (S::Loading | S::Playing | S::Crossfading, E::ColorChanged) => Some(S::Loading),
        (S::Idle | S::Stopped, E::ColorChanged) => Some(state),
        _ => None,
    }
}

/// Owns the scheduler and keeps `PlaybackState` in step with it.
pub struct PlaybackController<D: OutputDevice, B: BlockSource> {
    scheduler: StreamScheduler<D, B>,
    state: PlaybackState,
}

impl<D: OutputDevice, B: BlockSource> PlaybackController<D, B> {
    pub fn new(device: D, source: B, config: &StreamConfig, sample_rate: u32) -> Result<Self> {
        Ok(Self {
            scheduler: StreamScheduler::new(device, source, config.clone(), sample_rate)?,
            state: PlaybackState::Idle,
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn session(&self) -> &StreamSession {
        self.scheduler.session()
    }

    pub fn scheduler(&self) -> &StreamScheduler<D, B> {
        &self.scheduler
    }

    pub fn crossfading(&self) -> bool {
        self.scheduler.session().is_crossfading()
    }

    /// Start or stop playback.
    ///
    /// Starting from `Stopped` with buffers still loaded resumes instantly;
    /// otherwise both slots are synthesized and the state is `Loading` until
    /// `poll` sees them. On error the state is unchanged.
    pub fn toggle(&mut self) -> Result<PlaybackState> {
        match self.state {
            PlaybackState::Idle | PlaybackState::Stopped => {
                if self.scheduler.has_buffers() {
                    self.scheduler.resume()?;
                    log::info!("{:?} -> Playing (resumed)", self.state);
                    self.state = PlaybackState::Playing;
                } else {
                    if let Err(e) = self.scheduler.bootstrap() {
                        self.scheduler.invalidate();
                        return Err(e);
                    }
                    self.apply(PlaybackEvent::Toggle);
                }
            }
            PlaybackState::Loading => {
                self.scheduler.invalidate();
                self.apply(PlaybackEvent::Toggle);
            }
            PlaybackState::Playing | PlaybackState::Crossfading => {
                self.scheduler.stop();
                self.apply(PlaybackEvent::Toggle);
            }
        }
        Ok(self.state)
    }

    /// Drive synthesis delivery, the volume ramp and device position polling.
    pub fn poll(&mut self, now: Instant) -> Result<PlaybackState> {
        if !self.is_streaming() {
            return Ok(self.state);
        }
        let events = self.scheduler.poll(now).map_err(|e| self.fail(e))?;
        self.dispatch(events)?;
        if self.scheduler.is_running() {
            let events = self.scheduler.poll_device(now).map_err(|e| self.fail(e))?;
            self.dispatch(events)?;
        }
        Ok(self.state)
    }

    /// Position notification pushed by a device that reports on its own.
    pub fn on_position_update(
        &mut self,
        slot: SlotId,
        position: f64,
        now: Instant,
    ) -> Result<PlaybackState> {
        if !matches!(
            self.state,
            PlaybackState::Playing | PlaybackState::Crossfading
        ) {
            return Ok(self.state);
        }
        let events = self
            .scheduler
            .on_position_update(slot, position, now)
            .map_err(|e| self.fail(e))?;
        self.dispatch(events)?;
        Ok(self.state)
    }

    /// Switch noise color. Loaded buffers are of the old color and are dropped;
    /// an active stream re-bootstraps in the new color.
    pub fn set_color(&mut self, color: NoiseColor) -> Result<PlaybackState> {
        if !self.scheduler.set_color(color) {
            return Ok(self.state);
        }
        log::info!("color changed to {}", color);
        if self.is_streaming() {
            self.scheduler.bootstrap().map_err(|e| self.fail(e))?;
        }
        self.apply(PlaybackEvent::ColorChanged);
        Ok(self.state)
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return Err(NoiseError::InvalidParameter(format!(
                "volume must be within [0, 1], got {volume}"
            )));
        }
        self.scheduler
            .set_target_volume(volume)
            .map_err(|e| self.fail(e))
    }

    /// Stop and free both buffers; the next toggle synthesizes again.
    pub fn release_buffers(&mut self) {
        if self.is_streaming() {
            self.apply(PlaybackEvent::Toggle);
        }
        self.scheduler.invalidate();
    }

    pub fn teardown(&mut self) {
        self.scheduler.invalidate();
        self.apply(PlaybackEvent::Teardown);
    }

    /// Loading, playing or crossfading.
    fn is_streaming(&self) -> bool {
        self.state == PlaybackState::Loading || self.state.is_active()
    }

    fn dispatch(&mut self, events: Vec<SchedulerEvent>) -> Result<()> {
        for event in events {
            match event {
                SchedulerEvent::BuffersReady => {
                    if self.state != PlaybackState::Loading {
                        continue;
                    }
                    if let Err(e) = self.scheduler.start_playback() {
                        return Err(self.fail(e));
                    }
                    self.apply(PlaybackEvent::BuffersReady);
                }
                SchedulerEvent::CrossfadeBegan { .. } => {
                    self.apply(PlaybackEvent::CrossfadeBegan);
                }
                SchedulerEvent::CrossfadeEnded { .. } => {
                    self.apply(PlaybackEvent::CrossfadeEnded);
                }
                SchedulerEvent::SynthesisTimeout { .. } => {}
            }
        }
        Ok(())
    }

    /// Terminal failure: drop the session and move to `Stopped`.
    fn fail(&mut self, err: NoiseError) -> NoiseError {
        log::error!("playback failed while {:?}: {}", self.state, err);
        self.scheduler.invalidate();
        let event = if self.state == PlaybackState::Loading {
            PlaybackEvent::BootstrapFailed
        } else {
            PlaybackEvent::DeviceFailed
        };
        self.apply(event);
        err
    }

    fn apply(&mut self, event: PlaybackEvent) -> PlaybackState {
        match transition(self.state, event) {
            Some(next) => {
                if next != self.state {
                    log::info!("{:?} -> {:?} on {:?}", self.state, next, event);
                }
                self.state = next;
            }
            None => log::debug!("ignoring {:?} while {:?}", event, self.state),
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use crate::worker::InlineSource;
    use rand::rngs::StdRng;
    use std::time::Duration;

    type Controller = PlaybackController<MockDevice, InlineSource<StdRng>>;

    fn controller(seed: u64) -> (Controller, MockDevice) {
        let device = MockDevice::default();
        let config = StreamConfig {
            sample_rate: 100,
            block_seconds: 10.0,
            crossfade_seconds: 1.0,
            ..Default::default()
        };
        let ctl = PlaybackController::new(
            device.clone(),
            InlineSource::seeded(Some(seed), 0.5),
            &config,
            100,
        )
        .unwrap();
        (ctl, device)
    }

    fn playing(seed: u64) -> (Controller, MockDevice, Instant) {
        let (mut ctl, device) = controller(seed);
        let t0 = Instant::now();
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Loading);
        assert_eq!(ctl.poll(t0).unwrap(), PlaybackState::Playing);
        (ctl, device, t0)
    }

    #[test]
    fn transition_table() {
        use PlaybackEvent as E;
        use PlaybackState as S;
        assert_eq!(transition(S::Idle, E::Toggle), Some(S::Loading));
        assert_eq!(transition(S::Loading, E::Toggle), Some(S::Stopped));
        assert_eq!(transition(S::Loading, E::BuffersReady), Some(S::Playing));
        assert_eq!(transition(S::Loading, E::BootstrapFailed), Some(S::Stopped));
        assert_eq!(transition(S::Crossfading, E::Toggle), Some(S::Stopped));
        assert_eq!(transition(S::Playing, E::CrossfadeBegan), Some(S::Crossfading));
        assert_eq!(transition(S::Crossfading, E::CrossfadeEnded), Some(S::Playing));
        assert_eq!(transition(S::Playing, E::ColorChanged), Some(S::Loading));
        assert_eq!(transition(S::Stopped, E::ColorChanged), Some(S::Stopped));
        assert_eq!(transition(S::Crossfading, E::Teardown), Some(S::Idle));
        assert_eq!(transition(S::Stopped, E::BuffersReady), None);
        assert_eq!(transition(S::Playing, E::CrossfadeEnded), None);
    }

    #[test]
    fn start_plays_slot_one() {
        let (ctl, device, _) = playing(1);
        assert!(device.slot(SlotId::One).playing);
        assert!(!device.slot(SlotId::Two).playing);
        assert_eq!(ctl.session().active, SlotId::One);
    }

    #[test]
    fn toggling_twice_before_synthesis_plays_nothing() {
        let (mut ctl, device) = controller(2);
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Loading);
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Stopped);
        assert_eq!(ctl.poll(Instant::now()).unwrap(), PlaybackState::Stopped);
        assert!(!device.any_playing());
        assert!(device.slot(SlotId::One).block.is_none());
        assert!(device.slot(SlotId::Two).block.is_none());
    }

    #[test]
    fn stop_then_start_resumes_without_resynthesis() {
        let (mut ctl, device, _) = playing(3);
        let block = device.slot(SlotId::One).block.unwrap();
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Stopped);
        assert!(!device.any_playing());

        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Playing);
        assert!(device.slot(SlotId::One).playing);
        assert_eq!(device.slot(SlotId::One).block.unwrap(), block);
    }

    #[test]
    fn failed_resume_leaves_state_stopped() {
        let (mut ctl, device, _) = playing(4);
        ctl.toggle().unwrap();
        device.set_fail_play(true);
        assert!(matches!(ctl.toggle(), Err(NoiseError::OutputDevice(_))));
        assert_eq!(ctl.state(), PlaybackState::Stopped);
        assert!(!device.any_playing());
    }

    #[test]
    fn device_failure_during_bootstrap_stops() {
        let (mut ctl, device) = controller(5);
        device.set_fail_play(true);
        ctl.toggle().unwrap();
        let err = ctl.poll(Instant::now()).unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(ctl.state(), PlaybackState::Stopped);
        assert!(device.slot(SlotId::One).block.is_none());

        device.set_fail_play(false);
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Loading);
        assert_eq!(ctl.poll(Instant::now()).unwrap(), PlaybackState::Playing);
    }

    #[test]
    fn crossfade_is_reflected_in_state() {
        let (mut ctl, device, t0) = playing(6);
        let t9 = t0 + Duration::from_secs(9);
        device.advance_to(SlotId::One, 9.0);
        assert_eq!(ctl.poll(t9).unwrap(), PlaybackState::Crossfading);
        assert!(ctl.crossfading());

        let done = ctl.poll(t9 + Duration::from_secs(1)).unwrap();
        assert_eq!(done, PlaybackState::Playing);
        assert!(!ctl.crossfading());
        assert_eq!(ctl.session().active, SlotId::Two);
    }

    #[test]
    fn color_change_while_playing_rebootstraps() {
        let (mut ctl, device, _) = playing(7);
        assert_eq!(ctl.set_color(NoiseColor::Pink).unwrap(), PlaybackState::Loading);
        assert!(!device.any_playing());
        assert_eq!(ctl.poll(Instant::now()).unwrap(), PlaybackState::Playing);
        assert_eq!(device.slot(SlotId::One).block.unwrap().color, NoiseColor::Pink);
        assert_eq!(device.slot(SlotId::Two).block.unwrap().color, NoiseColor::Pink);
    }

    #[test]
    fn color_change_while_stopped_releases_buffers() {
        let (mut ctl, device, _) = playing(8);
        ctl.toggle().unwrap();
        assert_eq!(ctl.set_color(NoiseColor::Blue).unwrap(), PlaybackState::Stopped);
        assert!(device.slot(SlotId::One).block.is_none());
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Loading);
    }

    #[test]
    fn volume_is_validated() {
        let (mut ctl, device, _) = playing(9);
        assert!(matches!(ctl.set_volume(1.5), Err(NoiseError::InvalidParameter(_))));
        assert!(matches!(ctl.set_volume(f32::NAN), Err(NoiseError::InvalidParameter(_))));
        ctl.set_volume(0.25).unwrap();
        assert!((device.slot(SlotId::One).volume - 0.25).abs() < 1e-6);
    }

    #[test]
    fn zero_length_blocks_are_rejected() {
        let config = StreamConfig {
            block_seconds: 0.0,
            ..Default::default()
        };
        let result = PlaybackController::new(
            MockDevice::default(),
            InlineSource::seeded(Some(1), 0.5),
            &config,
            100,
        );
        assert!(matches!(result, Err(NoiseError::InvalidParameter(_))));
    }

    #[test]
    fn release_and_teardown_unload_everything() {
        let (mut ctl, device, _) = playing(10);
        ctl.release_buffers();
        assert_eq!(ctl.state(), PlaybackState::Stopped);
        assert!(device.slot(SlotId::One).block.is_none());
        assert_eq!(ctl.toggle().unwrap(), PlaybackState::Loading);

        ctl.teardown();
        assert_eq!(ctl.state(), PlaybackState::Idle);
        assert!(!device.any_playing());
        assert!(device.slot(SlotId::Two).block.is_none());
    }
}
