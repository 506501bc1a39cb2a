//! cpal platform adapters
//!
//! Device enumeration, the playback mixer, and the [`AudioPlatform`]
//! implementation backed by a cpal output stream. cpal streams are not `Send`,
//! so each backend keeps its stream on a dedicated thread and drives it with
//! commands.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, FromSample, Host, Sample, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use crossbeam_channel::{Receiver, Sender};
use parlor_common::voice::{FRAME_LEN, VOICE_SAMPLE_RATE};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{DeviceContextConfig, LatencyHint};
use crate::error::VoiceError;

use super::context::{AudioBackend, AudioPlatform, ContextState};
use super::inbound::PlaybackSink;

// =============================================================================
// Constants
// =============================================================================

/// System default device display name
pub const SYSTEM_DEFAULT_DEVICE_NAME: &str = "System Default";

/// Maximum playback buffer per session in frames (prevents latency buildup)
const MAX_PLAYBACK_BUFFER_FRAMES: usize = 20;

/// Sample formats the adapters can convert from and to
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

// =============================================================================
// Audio Device
// =============================================================================

/// An audio device (input or output) as shown to the user
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    /// Whether this entry stands for the system default device
    pub is_default: bool,
}

impl AudioDevice {
    pub fn new(name: String, is_default: bool) -> Self {
        Self { name, is_default }
    }

    pub fn system_default() -> Self {
        Self::new(SYSTEM_DEFAULT_DEVICE_NAME.to_string(), true)
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for AudioDevice {}

// =============================================================================
// Device Enumeration
// =============================================================================

fn host() -> Host {
    cpal::default_host()
}

fn collect_devices(devices: impl Iterator<Item = Device>) -> Vec<AudioDevice> {
    let mut listed = vec![AudioDevice::system_default()];
    for device in devices {
        if let Ok(desc) = device.description() {
            let name = desc.name().to_string();
            if !listed.iter().any(|d| d.name == name) {
                listed.push(AudioDevice::new(name, false));
            }
        }
    }
    listed
}

/// Output devices, "System Default" first
pub fn list_output_devices() -> Vec<AudioDevice> {
    match host().output_devices() {
        Ok(devices) => collect_devices(devices),
        Err(_) => vec![AudioDevice::system_default()],
    }
}

/// Input devices, "System Default" first
pub fn list_input_devices() -> Vec<AudioDevice> {
    match host().input_devices() {
        Ok(devices) => collect_devices(devices),
        Err(_) => vec![AudioDevice::system_default()],
    }
}

fn is_default_name(name: &str) -> bool {
    name.is_empty() || name == SYSTEM_DEFAULT_DEVICE_NAME
}

/// Find an output device by name, falling back to the default
pub fn find_output_device(name: &str) -> Option<Device> {
    let host = host();
    if is_default_name(name) {
        return host.default_output_device();
    }
    host.output_devices()
        .ok()?
        .find(|d| d.description().is_ok_and(|desc| desc.name() == name))
        .or_else(|| host.default_output_device())
}

/// Find an input device by name, falling back to the default
pub fn find_input_device(name: &str) -> Option<Device> {
    let host = host();
    if is_default_name(name) {
        return host.default_input_device();
    }
    host.input_devices()
        .ok()?
        .find(|d| d.description().is_ok_and(|desc| desc.name() == name))
        .or_else(|| host.default_input_device())
}

/// Pick a mono layout at `sample_rate`, else stereo
pub(crate) fn pick_stream_format(
    configs: &[SupportedStreamConfigRange],
    sample_rate: u32,
) -> Option<(u16, SampleFormat)> {
    let usable = |channels: u16| {
        configs.iter().find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= sample_rate
                && c.max_sample_rate() >= sample_rate
                && SUPPORTED_FORMATS.contains(&c.sample_format())
        })
    };
    usable(1)
        .or_else(|| usable(2))
        .map(|c| (c.channels(), c.sample_format()))
}

// =============================================================================
// Mixer
// =============================================================================

#[derive(Default)]
struct MixerState {
    /// Pending mono samples per remote session
    buffers: HashMap<u32, Vec<f32>>,
    muted: HashSet<u32>,
    deafened: bool,
}

/// Sums the audio of every talking remote session into one output
///
/// Each session has its own buffer so simultaneous speakers are mixed rather
/// than played back to back.
#[derive(Clone, Default)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill `out` with the next mixed mono samples, silence where nothing is queued
    pub fn mix_into(&self, out: &mut [f32]) {
        out.fill(0.0);
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        let mut active = vec![false; out.len()];
        for buffer in state.buffers.values() {
            for ((dst, src), flag) in out.iter_mut().zip(buffer.iter()).zip(active.iter_mut()) {
                *dst += *src;
                *flag = true;
            }
        }
        for (dst, flag) in out.iter_mut().zip(active) {
            if flag {
                *dst = soft_clip(*dst);
            }
        }

        let consumed = out.len();
        for buffer in state.buffers.values_mut() {
            let drain = consumed.min(buffer.len());
            buffer.drain(..drain);
        }
        // Sessions that stopped talking free their buffers
        state.buffers.retain(|_, b| !b.is_empty());
    }

    /// Samples waiting for `session`
    pub fn buffered(&self, session: u32) -> usize {
        self.state
            .lock()
            .map(|s| s.buffers.get(&session).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_muted(&self, session: u32) -> bool {
        self.state
            .lock()
            .map(|s| s.muted.contains(&session))
            .unwrap_or(false)
    }

    pub fn is_deafened(&self) -> bool {
        self.state.lock().map(|s| s.deafened).unwrap_or(false)
    }
}

impl PlaybackSink for Mixer {
    fn queue_audio(&self, session: u32, samples: &[f32], channels: u16) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.deafened || state.muted.contains(&session) {
            return;
        }

        let buffer = state.buffers.entry(session).or_default();
        if channels <= 1 {
            buffer.extend_from_slice(samples);
        } else {
            let channels = channels as usize;
            buffer.extend(
                samples
                    .chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }

        let max = FRAME_LEN * MAX_PLAYBACK_BUFFER_FRAMES;
        if buffer.len() > max {
            let excess = buffer.len() - max;
            buffer.drain(..excess);
        }
    }

    fn remove(&self, session: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.buffers.remove(&session);
        }
    }

    fn set_deafened(&self, deafened: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.deafened = deafened;
            if deafened {
                state.buffers.clear();
            }
        }
    }

    fn set_session_muted(&self, session: u32, muted: bool) {
        if let Ok(mut state) = self.state.lock() {
            if muted {
                state.muted.insert(session);
                state.buffers.remove(&session);
            } else {
                state.muted.remove(&session);
            }
        }
    }
}

/// Level below which mixed samples pass through unchanged
const CLIP_KNEE: f32 = 0.8;

/// Soft clipping for summed speakers
///
/// Unity gain up to [`CLIP_KNEE`], then a tanh curve with matching slope that
/// approaches full scale.
fn soft_clip(sample: f32) -> f32 {
    let magnitude = sample.abs();
    if magnitude <= CLIP_KNEE {
        return sample;
    }
    let headroom = 1.0 - CLIP_KNEE;
    let over = (magnitude - CLIP_KNEE) / headroom;
    (CLIP_KNEE + headroom * over.tanh()).copysign(sample)
}

// =============================================================================
// cpal Platform
// =============================================================================

/// [`AudioPlatform`] backed by the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalPlatform;

#[async_trait]
impl AudioPlatform for CpalPlatform {
    async fn create(
        &self,
        config: &DeviceContextConfig,
    ) -> Result<Box<dyn AudioBackend>, VoiceError> {
        if config.sample_rate != VOICE_SAMPLE_RATE {
            return Err(VoiceError::Config(format!(
                "output must run at {}Hz, got {}Hz",
                VOICE_SAMPLE_RATE, config.sample_rate
            )));
        }
        let backend = CpalBackend::open(config.clone()).await?;
        Ok(Box::new(backend))
    }
}

enum OutputCommand {
    Play(oneshot::Sender<Result<(), VoiceError>>),
    Pause(oneshot::Sender<Result<(), VoiceError>>),
    Close(oneshot::Sender<Result<(), VoiceError>>),
}

/// A cpal output stream playing the [`Mixer`]
pub struct CpalBackend {
    sample_rate: u32,
    mixer: Mixer,
    commands: Sender<OutputCommand>,
    state: Arc<Mutex<ContextState>>,
    /// Set by the stream error callback (device unplugged, server died)
    failed: Arc<AtomicBool>,
}

impl CpalBackend {
    async fn open(config: DeviceContextConfig) -> Result<Self, VoiceError> {
        let mixer = Mixer::new();
        let failed = Arc::new(AtomicBool::new(false));
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_mixer = mixer.clone();
        let thread_failed = failed.clone();
        let sample_rate = config.sample_rate;
        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                run_output_thread(config, thread_mixer, thread_failed, commands_rx, ready_tx)
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn output thread: {}", e)))?;

        let initial = ready_rx
            .await
            .map_err(|_| VoiceError::Device("output thread exited during setup".into()))??;

        Ok(Self {
            sample_rate,
            mixer,
            commands: commands_tx,
            state: Arc::new(Mutex::new(initial)),
            failed,
        })
    }

    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), VoiceError>>) -> OutputCommand,
    ) -> Result<(), VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| VoiceError::Closed("audio output"))?;
        rx.await.map_err(|_| VoiceError::Closed("audio output"))?
    }

    fn set_state(&self, state: ContextState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> ContextState {
        if self.failed.load(Ordering::SeqCst) {
            return ContextState::Closed;
        }
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ContextState::Closed)
    }

    async fn resume(&self) -> Result<(), VoiceError> {
        self.command(OutputCommand::Play).await?;
        self.set_state(ContextState::Running);
        Ok(())
    }

    async fn suspend(&self) -> Result<(), VoiceError> {
        self.command(OutputCommand::Pause).await?;
        self.set_state(ContextState::Suspended);
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        let result = self.command(OutputCommand::Close).await;
        self.set_state(ContextState::Closed);
        match result {
            Err(VoiceError::Closed(_)) => Ok(()),
            other => other,
        }
    }

    fn playback(&self) -> Arc<dyn PlaybackSink> {
        Arc::new(self.mixer.clone())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.commands.send(OutputCommand::Close(tx));
    }
}

/// Owns the output stream until closed or every command sender is gone
fn run_output_thread(
    config: DeviceContextConfig,
    mixer: Mixer,
    failed: Arc<AtomicBool>,
    commands: Receiver<OutputCommand>,
    ready: oneshot::Sender<Result<ContextState, VoiceError>>,
) {
    let stream = match build_output(&config, mixer, failed) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // A refused start leaves the session suspended until resumed
    let initial = match stream.play() {
        Ok(()) => ContextState::Running,
        Err(e) => {
            warn!(error = %e, "output stream did not start, session suspended");
            ContextState::Suspended
        }
    };
    if ready.send(Ok(initial)).is_err() {
        return;
    }

    for command in commands.iter() {
        match command {
            OutputCommand::Play(reply) => {
                let _ = reply.send(
                    stream
                        .play()
                        .map_err(|e| VoiceError::Device(format!("failed to start output: {}", e))),
                );
            }
            OutputCommand::Pause(reply) => {
                let _ = reply.send(
                    stream
                        .pause()
                        .map_err(|e| VoiceError::Device(format!("failed to pause output: {}", e))),
                );
            }
            OutputCommand::Close(reply) => {
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }
    drop(stream);
    debug!("audio output closed");
}

fn buffer_size(latency: LatencyHint) -> BufferSize {
    match latency {
        LatencyHint::Interactive => BufferSize::Fixed(FRAME_LEN as u32 / 2),
        LatencyHint::Balanced => BufferSize::Default,
        LatencyHint::Playback => BufferSize::Fixed(FRAME_LEN as u32 * 2),
    }
}

fn build_output(
    config: &DeviceContextConfig,
    mixer: Mixer,
    failed: Arc<AtomicBool>,
) -> Result<Stream, VoiceError> {
    let device = find_output_device(&config.output_device)
        .ok_or_else(|| VoiceError::Unsupported("no audio output device".into()))?;

    let configs: Vec<SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| VoiceError::Device(format!("failed to get supported configs: {}", e)))?
        .collect();
    let (channels, format) = pick_stream_format(&configs, config.sample_rate).ok_or_else(|| {
        VoiceError::Device(format!(
            "output device doesn't support {}Hz",
            config.sample_rate
        ))
    })?;

    let mut stream_config = StreamConfig {
        channels,
        sample_rate: config.sample_rate,
        buffer_size: buffer_size(config.latency),
    };

    let stream =
        match build_output_stream(&device, &stream_config, format, mixer.clone(), failed.clone()) {
            Ok(stream) => stream,
            Err(e) if stream_config.buffer_size != BufferSize::Default => {
                debug!(error = %e, "fixed buffer size refused, using the device default");
                stream_config.buffer_size = BufferSize::Default;
                build_output_stream(&device, &stream_config, format, mixer, failed)?
            }
            Err(e) => return Err(e),
        };
    info!(channels, ?format, "audio output opened");
    Ok(stream)
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    format: SampleFormat,
    mixer: Mixer,
    failed: Arc<AtomicBool>,
) -> Result<Stream, VoiceError> {
    match format {
        SampleFormat::F32 => build_mixer_stream::<f32>(device, config, mixer, failed),
        SampleFormat::I16 => build_mixer_stream::<i16>(device, config, mixer, failed),
        SampleFormat::U16 => build_mixer_stream::<u16>(device, config, mixer, failed),
        other => Err(VoiceError::Device(format!(
            "unsupported sample format: {:?}",
            other
        ))),
    }
}

/// Output stream that plays the mono mix on every channel
fn build_mixer_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Mixer,
    failed: Arc<AtomicBool>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mixed: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixed.resize(data.len() / channels, 0.0);
                mixer.mix_into(&mut mixed);
                for (frame, sample) in data.chunks_exact_mut(channels).zip(mixed.iter()) {
                    let value = T::from_sample(*sample);
                    frame.fill(value);
                }
            },
            move |err| {
                warn!(error = %err, "audio output stream failed");
                failed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("failed to build output stream: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_device_equality() {
        let device1 = AudioDevice::new("Test".to_string(), false);
        let device2 = AudioDevice::new("Test".to_string(), true);
        let device3 = AudioDevice::new("Other".to_string(), false);
        assert_eq!(device1, device2);
        assert_ne!(device1, device3);
        assert!(AudioDevice::system_default().is_default);
    }

    #[test]
    fn test_list_devices_includes_default() {
        let devices = list_output_devices();
        assert_eq!(devices[0].name, SYSTEM_DEFAULT_DEVICE_NAME);
        let devices = list_input_devices();
        assert!(devices[0].is_default);
    }

    #[test]
    fn test_mixer_sums_sessions() {
        let mixer = Mixer::new();
        mixer.queue_audio(1, &[0.1; 4], 1);
        mixer.queue_audio(2, &[0.2; 2], 1);

        let mut out = [0.0f32; 4];
        mixer.mix_into(&mut out);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[2] - 0.1).abs() < 1e-6);
        assert_eq!(mixer.buffered(1), 0);
        assert_eq!(mixer.buffered(2), 0);

        // Nothing queued: silence
        mixer.mix_into(&mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_soft_clip_is_unity_below_knee() {
        for sample in [0.0, 0.01, -0.25, 0.5, -0.8, 0.8] {
            assert_eq!(soft_clip(sample), sample);
        }
        // Continuous at the knee and bounded above it
        assert!((soft_clip(0.8001) - 0.8001).abs() < 1e-4);
        for sample in [0.9_f32, 1.5, 4.0, 100.0] {
            let clipped = soft_clip(sample);
            assert!(clipped > CLIP_KNEE && clipped < 1.0 + 1e-6);
            assert_eq!(soft_clip(-sample), -clipped);
        }
        assert!(soft_clip(1.5) > soft_clip(0.9));
    }

    #[test]
    fn test_mixer_downmixes_interleaved_input() {
        let mixer = Mixer::new();
        mixer.queue_audio(3, &[0.2, 0.4, 0.6, 0.8], 2);
        assert_eq!(mixer.buffered(3), 2);
    }

    #[test]
    fn test_mixer_mute_and_deafen() {
        let mixer = Mixer::new();
        mixer.queue_audio(1, &[0.5; 8], 1);
        mixer.set_session_muted(1, true);
        assert_eq!(mixer.buffered(1), 0);
        mixer.queue_audio(1, &[0.5; 8], 1);
        assert_eq!(mixer.buffered(1), 0);
        assert!(mixer.is_muted(1));

        mixer.set_session_muted(1, false);
        mixer.queue_audio(1, &[0.5; 8], 1);
        assert_eq!(mixer.buffered(1), 8);

        mixer.set_deafened(true);
        assert_eq!(mixer.buffered(1), 0);
        mixer.queue_audio(2, &[0.5; 8], 1);
        assert_eq!(mixer.buffered(2), 0);
        assert!(mixer.is_deafened());
    }

    #[test]
    fn test_mixer_caps_buffer() {
        let mixer = Mixer::new();
        for _ in 0..MAX_PLAYBACK_BUFFER_FRAMES + 5 {
            mixer.queue_audio(4, &[0.0; FRAME_LEN], 1);
        }
        assert_eq!(mixer.buffered(4), FRAME_LEN * MAX_PLAYBACK_BUFFER_FRAMES);
        mixer.remove(4);
        assert_eq!(mixer.buffered(4), 0);
    }

    #[test]
    fn test_buffer_size_for_latency() {
        assert_eq!(buffer_size(LatencyHint::Balanced), BufferSize::Default);
        assert_eq!(
            buffer_size(LatencyHint::Interactive),
            BufferSize::Fixed(FRAME_LEN as u32 / 2)
        );
    }
}
