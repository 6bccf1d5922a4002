use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::command::Command;
use crate::device::OutputDevice;
use crate::error::{NoiseError, Result};
use crate::models::{EncodedBlock, SlotId};
use crate::wav;

const COMMAND_CAPACITY: usize = 256;
// Replaced sample buffers travel back here so they are freed off the audio thread.
const RETIRED_CAPACITY: usize = 8;
// Volume changes glide over roughly this long to avoid zipper noise.
const GAIN_SMOOTHING_SECS: f32 = 0.005;

#[derive(Default)]
struct SlotCursor {
    frame: AtomicU64,
    applied_serial: AtomicU64,
}

/// Playhead positions written by the audio callback, read by the control side.
#[derive(Default)]
pub struct SharedPositions {
    slots: [SlotCursor; 2],
}

impl SharedPositions {
    pub fn frame(&self, slot: SlotId) -> u64 {
        self.slots[slot.index()].frame.load(Ordering::Relaxed)
    }

    pub fn applied_serial(&self, slot: SlotId) -> u64 {
        self.slots[slot.index()].applied_serial.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Voice {
    samples: Option<Arc<[f32]>>,
    cursor: usize,
    playing: bool,
    looping: bool,
    volume: f32,
    gain: f32,
    serial: u64,
}

/// Two-voice mixer run inside the audio callback.
pub struct SlotMixer {
    voices: [Voice; 2],
    shared: Arc<SharedPositions>,
    retired: HeapProd<Arc<[f32]>>,
    smoothing: f32,
}

impl SlotMixer {
    pub fn new(
        shared: Arc<SharedPositions>,
        retired: HeapProd<Arc<[f32]>>,
        sample_rate: u32,
    ) -> Self {
        let smoothing = 1.0 - (-1.0 / (GAIN_SMOOTHING_SECS * sample_rate.max(1) as f32)).exp();
        Self {
            voices: Default::default(),
            shared,
            retired,
            smoothing,
        }
    }

    /// Hand a replaced buffer back to the control side. If the return queue
    /// is full the buffer is dropped here instead.
    fn retire(&mut self, samples: Option<Arc<[f32]>>) {
        if let Some(samples) = samples {
            let _ = self.retired.try_push(samples);
        }
    }

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Load {
                slot,
                samples,
                serial,
            } => {
                let voice = &mut self.voices[slot.index()];
                let old = voice.samples.replace(samples);
                voice.cursor = 0;
                voice.playing = false;
                voice.serial = serial;
                self.retire(old);
            }
            Command::Unload(slot) => {
                let voice = &mut self.voices[slot.index()];
                let old = voice.samples.take();
                voice.cursor = 0;
                voice.playing = false;
                self.retire(old);
            }
            Command::SetPlaying { slot, playing } => {
                let voice = &mut self.voices[slot.index()];
                if playing && !voice.playing {
                    voice.gain = voice.volume;
                }
                voice.playing = playing && voice.samples.is_some();
            }
            Command::Seek {
                slot,
                frame,
                serial,
            } => {
                let voice = &mut self.voices[slot.index()];
                let len = voice.samples.as_ref().map_or(0, |s| s.len());
                // The end of a block is the start of its next loop.
                voice.cursor = if frame < len { frame } else { 0 };
                voice.serial = serial;
            }
            Command::SetVolume { slot, volume } => {
                self.voices[slot.index()].volume = volume.clamp(0.0, 1.0);
            }
            Command::SetLooping { slot, looping } => {
                self.voices[slot.index()].looping = looping;
            }
        }
    }

    /// Mix both voices into an interleaved buffer and publish the playheads.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let smoothing = self.smoothing;
        for frame in out.chunks_mut(channels) {
            let mut mix = 0.0f32;
            for voice in self.voices.iter_mut() {
                if !voice.playing {
                    continue;
                }
                let Some(samples) = voice.samples.as_ref() else {
                    continue;
                };
                voice.gain += (voice.volume - voice.gain) * smoothing;
                mix += samples[voice.cursor] * voice.gain;
                voice.cursor += 1;
                if voice.cursor >= samples.len() {
                    if voice.looping {
                        voice.cursor = 0;
                    } else {
                        voice.cursor = samples.len() - 1;
                        voice.playing = false;
                    }
                }
            }
            frame.fill(mix.clamp(-1.0, 1.0));
        }
        self.publish();
    }

    fn publish(&self) {
        for (voice, cursor) in self.voices.iter().zip(self.shared.slots.iter()) {
            cursor.frame.store(voice.cursor as u64, Ordering::Relaxed);
            cursor.applied_serial.store(voice.serial, Ordering::Release);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ControlSlot {
    frames: Option<usize>,
    /// Serial and target frame of the last seek sent for this slot.
    pending: Option<(u64, usize)>,
}

/// Output device backed by the default cpal host.
///
/// The stream lives on its own thread; commands reach the callback through a
/// ring buffer and playheads come back through atomics.
pub struct CpalOutput {
    commands: HeapProd<Command>,
    retired: HeapCons<Arc<[f32]>>,
    shared: Arc<SharedPositions>,
    slots: [ControlSlot; 2],
    next_serial: u64,
    sample_rate: u32,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device, asking for `preferred_rate` when it is
    /// non-zero and supported.
    pub fn open(preferred_rate: u32) -> Result<Self> {
        let rb = HeapRb::<Command>::new(COMMAND_CAPACITY);
        let (prod, cons) = rb.split();
        let (retired_prod, retired) = HeapRb::<Arc<[f32]>>::new(RETIRED_CAPACITY).split();
        let shared = Arc::new(SharedPositions::default());
        let (ready_tx, ready_rx) = bounded::<std::result::Result<u32, String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("noise-output".into())
            .spawn(move || {
                let mixer = |rate| SlotMixer::new(thread_shared, retired_prod, rate);
                run_audio_stream(preferred_rate, cons, mixer, ready_tx, stop_rx)
            })
            .map_err(|e| NoiseError::OutputDevice(format!("cannot spawn output thread: {e}")))?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(NoiseError::OutputDevice(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(NoiseError::OutputDevice(
                    "output thread exited before the stream started".into(),
                ));
            }
        };
        log::info!("output stream running at {} Hz", sample_rate);

        Ok(Self {
            commands: prod,
            retired,
            shared,
            slots: Default::default(),
            next_serial: 1,
            sample_rate,
            stop_tx,
            thread: Some(thread),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn push(&mut self, cmd: Command) -> Result<()> {
        self.commands
            .try_push(cmd)
            .map_err(|_| NoiseError::OutputDevice("audio command queue is full".into()))
    }

    /// Free buffers the callback has let go of.
    fn reclaim(&mut self) {
        let freed = self.retired.pop_iter().count();
        if freed > 0 {
            log::trace!("reclaimed {} sample buffers", freed);
        }
    }

    fn serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }
}

impl OutputDevice for CpalOutput {
    fn load(&mut self, slot: SlotId, block: &EncodedBlock) -> Result<()> {
        self.reclaim();
        let decoded = wav::decode_block(block)?;
        if decoded.sample_rate() != self.sample_rate {
            return Err(NoiseError::OutputDevice(format!(
                "block is {} Hz but the stream runs at {} Hz",
                decoded.sample_rate(),
                self.sample_rate
            )));
        }
        let samples: Arc<[f32]> = decoded.into_samples().into();
        let frames = samples.len();
        let serial = self.serial();
        self.push(Command::Load {
            slot,
            samples,
            serial,
        })?;
        self.slots[slot.index()] = ControlSlot {
            frames: Some(frames),
            pending: Some((serial, 0)),
        };
        Ok(())
    }

    fn unload(&mut self, slot: SlotId) {
        if let Err(e) = self.push(Command::Unload(slot)) {
            log::warn!("could not unload {}: {}", slot, e);
        }
        self.slots[slot.index()] = ControlSlot::default();
        self.reclaim();
    }

    fn play(&mut self, slot: SlotId) -> Result<()> {
        if self.slots[slot.index()].frames.is_none() {
            return Err(NoiseError::OutputDevice(format!("{slot} has nothing loaded")));
        }
        self.push(Command::SetPlaying {
            slot,
            playing: true,
        })
    }

    fn pause(&mut self, slot: SlotId) -> Result<()> {
        self.push(Command::SetPlaying {
            slot,
            playing: false,
        })
    }

    fn set_position(&mut self, slot: SlotId, seconds: f64) -> Result<()> {
        let mut frame = (seconds.max(0.0) * self.sample_rate as f64).round() as usize;
        if let Some(frames) = self.slots[slot.index()].frames {
            if frame >= frames {
                frame = 0;
            }
        }
        let serial = self.serial();
        self.push(Command::Seek {
            slot,
            frame,
            serial,
        })?;
        self.slots[slot.index()].pending = Some((serial, frame));
        Ok(())
    }

    fn set_volume(&mut self, slot: SlotId, volume: f32) -> Result<()> {
        self.push(Command::SetVolume { slot, volume })
    }

    fn set_looping(&mut self, slot: SlotId, looping: bool) -> Result<()> {
        self.push(Command::SetLooping { slot, looping })
    }

    fn position(&self, slot: SlotId) -> Option<f64> {
        let control = self.slots[slot.index()];
        control.frames?;
        let frame = match control.pending {
            Some((serial, frame)) if self.shared.applied_serial(slot) < serial => frame as u64,
            _ => self.shared.frame(slot),
        };
        Some(frame as f64 / self.sample_rate as f64)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.reclaim();
    }
}

fn run_audio_stream<C, M>(
    preferred_rate: u32,
    commands: C,
    mixer: M,
    ready: Sender<std::result::Result<u32, String>>,
    stop_rx: Receiver<()>,
) where
    C: Consumer<Item = Command> + Send + 'static,
    M: FnOnce(u32) -> SlotMixer,
{
    let stream = match open_stream(preferred_rate, commands, mixer) {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            stream
        }
        Err(msg) => {
            log::error!("failed to open output stream: {msg}");
            let _ = ready.send(Err(msg));
            return;
        }
    };

    // Keep the stream alive until a stop signal arrives or the owner goes away.
    loop {
        match stop_rx.recv_timeout(Duration::from_millis(100)) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(stream);
    log::debug!("output stream closed");
}

fn open_stream<C, M>(
    preferred_rate: u32,
    commands: C,
    mixer: M,
) -> std::result::Result<(cpal::Stream, u32), String>
where
    C: Consumer<Item = Command> + Send + 'static,
    M: FnOnce(u32) -> SlotMixer,
{
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;
    let supported_config = device
        .default_output_config()
        .map_err(|e| format!("failed to get default output config: {e}"))?;
    let sample_format = supported_config.sample_format();
    let mut config: cpal::StreamConfig = supported_config.into();

    if preferred_rate != 0 && preferred_rate != config.sample_rate.0 {
        match device.supported_output_configs() {
            Ok(mut ranges) => {
                if let Some(range) = ranges.find(|r| {
                    r.channels() == config.channels
                        && r.sample_format() == sample_format
                        && r.min_sample_rate().0 <= preferred_rate
                        && preferred_rate <= r.max_sample_rate().0
                }) {
                    config = range
                        .with_sample_rate(cpal::SampleRate(preferred_rate))
                        .config();
                } else {
                    log::warn!(
                        "sample rate {} not supported, using {}",
                        preferred_rate,
                        config.sample_rate.0
                    );
                }
            }
            Err(e) => log::warn!("could not query supported output configs ({e}); using default"),
        }
    }

    let rate = config.sample_rate.0;
    let mixer = mixer(rate);
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32, C>(&device, &config, mixer, commands),
        SampleFormat::I16 => build_stream::<i16, C>(&device, &config, mixer, commands),
        SampleFormat::U16 => build_stream::<u16, C>(&device, &config, mixer, commands),
        other => return Err(format!("unsupported sample format {other:?}")),
    }
    .map_err(|e| format!("failed to build output stream: {e}"))?;
    stream
        .play()
        .map_err(|e| format!("failed to start output stream: {e}"))?;
    Ok((stream, rate))
}

fn build_stream<T, C>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: SlotMixer,
    mut commands: C,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
    C: Consumer<Item = Command> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch = vec![0.0f32; 8192 * channels.max(1)];
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            while let Some(cmd) = commands.try_pop() {
                mixer.handle_command(cmd);
            }
            if scratch.len() < data.len() {
                scratch.resize(data.len(), 0.0);
            }
            let buf = &mut scratch[..data.len()];
            mixer.render(buf, channels);
            for (dst, &src) in data.iter_mut().zip(buf.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| log::error!("output stream error: {err}"),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::Observer;

    fn mixer() -> (SlotMixer, Arc<SharedPositions>) {
        let (m, shared, _) = mixer_with_retired();
        (m, shared)
    }

    fn mixer_with_retired() -> (SlotMixer, Arc<SharedPositions>, HeapCons<Arc<[f32]>>) {
        let shared = Arc::new(SharedPositions::default());
        let (prod, cons) = HeapRb::<Arc<[f32]>>::new(RETIRED_CAPACITY).split();
        (SlotMixer::new(Arc::clone(&shared), prod, 1000), shared, cons)
    }

    fn load(m: &mut SlotMixer, slot: SlotId, samples: Vec<f32>, serial: u64) {
        m.handle_command(Command::Load {
            slot,
            samples: samples.into(),
            serial,
        });
    }

    #[test]
    fn loaded_slot_is_silent_until_played() {
        let (mut m, _) = mixer();
        load(&mut m, SlotId::One, vec![0.5; 8], 1);
        m.handle_command(Command::SetVolume {
            slot: SlotId::One,
            volume: 1.0,
        });
        let mut out = [1.0f32; 4];
        m.render(&mut out, 1);
        assert!(out.iter().all(|s| *s == 0.0));

        m.handle_command(Command::SetPlaying {
            slot: SlotId::One,
            playing: true,
        });
        m.render(&mut out, 1);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn looping_slot_wraps_and_reports_its_playhead() {
        let (mut m, shared) = mixer();
        load(&mut m, SlotId::Two, vec![0.1, 0.2, 0.3], 4);
        m.handle_command(Command::SetVolume {
            slot: SlotId::Two,
            volume: 1.0,
        });
        m.handle_command(Command::SetLooping {
            slot: SlotId::Two,
            looping: true,
        });
        m.handle_command(Command::SetPlaying {
            slot: SlotId::Two,
            playing: true,
        });
        let mut out = [0.0f32; 5];
        m.render(&mut out, 1);
        let expected = [0.1, 0.2, 0.3, 0.1, 0.2];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
        assert_eq!(shared.frame(SlotId::Two), 2);
        assert_eq!(shared.applied_serial(SlotId::Two), 4);
    }

    #[test]
    fn one_shot_slot_stops_at_the_end() {
        let (mut m, _) = mixer();
        load(&mut m, SlotId::One, vec![0.4; 2], 1);
        m.handle_command(Command::SetVolume {
            slot: SlotId::One,
            volume: 1.0,
        });
        m.handle_command(Command::SetPlaying {
            slot: SlotId::One,
            playing: true,
        });
        let mut out = [0.0f32; 4];
        m.render(&mut out, 1);
        assert!((out[1] - 0.4).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn both_voices_mix_into_every_channel() {
        let (mut m, _) = mixer();
        for (slot, level) in [(SlotId::One, 0.25), (SlotId::Two, 0.5)] {
            load(&mut m, slot, vec![level; 16], 1);
            m.handle_command(Command::SetVolume { slot, volume: 0.5 });
            m.handle_command(Command::SetPlaying {
                slot,
                playing: true,
            });
        }
        let mut out = [0.0f32; 8];
        m.render(&mut out, 2);
        assert!(out.iter().all(|s| (*s - 0.375).abs() < 1e-6));
    }

    #[test]
    fn volume_changes_glide() {
        let (mut m, _) = mixer();
        load(&mut m, SlotId::One, vec![1.0; 64], 1);
        m.handle_command(Command::SetPlaying {
            slot: SlotId::One,
            playing: true,
        });
        m.handle_command(Command::SetVolume {
            slot: SlotId::One,
            volume: 1.0,
        });
        let mut out = [0.0f32; 64];
        m.render(&mut out, 1);
        assert!(out[0] > 0.0 && out[0] < 0.5);
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
        assert!(out[63] > out[0]);
    }

    #[test]
    fn seek_and_unload() {
        let (mut m, shared) = mixer();
        load(&mut m, SlotId::One, (0..10).map(|i| i as f32 / 10.0).collect(), 1);
        m.handle_command(Command::Seek {
            slot: SlotId::One,
            frame: 7,
            serial: 2,
        });
        m.handle_command(Command::SetVolume {
            slot: SlotId::One,
            volume: 1.0,
        });
        m.handle_command(Command::SetPlaying {
            slot: SlotId::One,
            playing: true,
        });
        let mut out = [0.0f32; 1];
        m.render(&mut out, 1);
        assert!((out[0] - 0.7).abs() < 1e-6);
        assert_eq!(shared.frame(SlotId::One), 8);
        assert_eq!(shared.applied_serial(SlotId::One), 2);

        m.handle_command(Command::Unload(SlotId::One));
        m.render(&mut out, 1);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn seek_past_the_end_restarts_the_block() {
        let (mut m, shared) = mixer();
        load(&mut m, SlotId::One, vec![0.1, 0.2, 0.3, 0.4], 1);
        m.handle_command(Command::Seek {
            slot: SlotId::One,
            frame: 4,
            serial: 2,
        });
        m.handle_command(Command::SetVolume {
            slot: SlotId::One,
            volume: 1.0,
        });
        m.handle_command(Command::SetPlaying {
            slot: SlotId::One,
            playing: true,
        });
        let mut out = [0.0f32; 2];
        m.render(&mut out, 1);
        assert!((out[0] - 0.1).abs() < 1e-6);
        assert!((out[1] - 0.2).abs() < 1e-6);
        assert_eq!(shared.frame(SlotId::One), 2);

        m.handle_command(Command::Seek {
            slot: SlotId::One,
            frame: 99,
            serial: 3,
        });
        m.render(&mut out, 1);
        assert!((out[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn replaced_buffers_are_returned_not_freed() {
        let (mut m, _, mut retired) = mixer_with_retired();
        let first: Arc<[f32]> = vec![0.5; 8].into();
        let weak = Arc::downgrade(&first);
        m.handle_command(Command::Load {
            slot: SlotId::One,
            samples: first,
            serial: 1,
        });
        load(&mut m, SlotId::One, vec![0.25; 8], 2);
        assert!(weak.upgrade().is_some());

        m.handle_command(Command::Unload(SlotId::One));
        assert_eq!(retired.occupied_len(), 2);
        assert!(weak.upgrade().is_some());

        retired.pop_iter().for_each(drop);
        assert!(weak.upgrade().is_none());
    }
}
