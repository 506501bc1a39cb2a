//! Voice session orchestration
//!
//! A [`VoiceSession`] wires capture, activation, the encoder and decoder pools
//! and playback together, and runs them from a single task. The
//! [`VoiceSessionHandle`] hosts that task on its own thread, since cpal streams
//! cannot move between threads.

use std::sync::Arc;
use std::thread::JoinHandle;

use parlor_common::codec::WorkerRole;
use parlor_common::voice::{VoiceQuality, VoiceTarget};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ActivationMode, AudioSettings};
use crate::error::VoiceError;

use super::activation::{VoiceActivationController, VoiceSessionState};
use super::capture::{FrameCapture, MicrophoneSource};
use super::codec::CodecFactory;
use super::context::{ContextState, DeviceContextManager};
use super::event::VoiceEvent;
use super::inbound::{InboundPacket, InboundRouter, PlaybackSink};
use super::ptt::{ControlEvent, ControlInput};
use super::transport::{BitrateHandle, EncodingTransport, PacketSink};
use super::worker::CodecWorkerPool;

// =============================================================================
// Commands
// =============================================================================

/// Commands to control a running session
#[derive(Debug)]
pub enum VoiceCommand {
    /// Explicit request to talk; answered with `Err(Muted)` while muted
    StartTransmitting(oneshot::Sender<Result<(), VoiceError>>),
    StopTransmitting,
    SetMute(bool),
    SetTarget(VoiceTarget),
    /// Update voice quality (bitrate) dynamically
    SetQuality(VoiceQuality),
    /// Mute all incoming audio
    SetDeafened(bool),
    MuteUser(u32),
    UnmuteUser(u32),
    /// Clean up the decoder and playback buffer of a session that left
    UserLeft(u32),
    Stop,
}

/// Inputs a session loop consumes
pub struct SessionIo {
    /// Mono blocks from the capture device; the session ends when this closes
    pub capture: mpsc::UnboundedReceiver<Vec<f32>>,
    /// Packets from the network; the session ends when this closes
    pub inbound: mpsc::UnboundedReceiver<InboundPacket>,
    /// Audio device failures; the first one ends the session
    pub device_errors: mpsc::UnboundedReceiver<String>,
    /// Push-to-talk events, if a control is bound
    pub control: Option<mpsc::UnboundedReceiver<ControlEvent>>,
}

// =============================================================================
// Voice Session
// =============================================================================

/// One joined voice session: everything between the microphone and the speakers
pub struct VoiceSession {
    capture: FrameCapture,
    controller: VoiceActivationController,
    router: InboundRouter,
    playback: Arc<dyn PlaybackSink>,
    bitrate: BitrateHandle,
    events: mpsc::UnboundedSender<VoiceEvent>,
}

impl VoiceSession {
    /// Build the pipeline for `settings`
    ///
    /// # Arguments
    /// * `codecs` - Codec implementation for both worker pools
    /// * `packet_sink` - Network side receiving encoded packets
    /// * `playback` - Where decoded remote audio is mixed
    /// * `events` - Channel for [`VoiceEvent`]s
    pub async fn new(
        settings: &AudioSettings,
        codecs: Arc<dyn CodecFactory>,
        packet_sink: Arc<dyn PacketSink>,
        playback: Arc<dyn PlaybackSink>,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> Self {
        let encoders = CodecWorkerPool::new(WorkerRole::Encoder, codecs.clone(), settings.max_workers);
        let decoders = CodecWorkerPool::new(WorkerRole::Decoder, codecs, settings.max_workers);
        let bitrate = BitrateHandle::new(settings.voice_quality);

        let mut controller =
            VoiceActivationController::new(settings.activation, settings.ptt_mode, events.clone());
        let transport = EncodingTransport::new(encoders, packet_sink, settings.codec, bitrate.clone());
        controller.attach_transport(Arc::new(transport)).await;

        let router = InboundRouter::new(decoders, playback.clone(), events.clone());

        Self {
            capture: FrameCapture::new(),
            controller,
            router,
            playback,
            bitrate,
            events,
        }
    }

    pub fn state(&self) -> VoiceSessionState {
        self.controller.state()
    }

    /// Hand a control binding to the activation controller
    pub fn controller_mut(&mut self) -> &mut VoiceActivationController {
        &mut self.controller
    }

    /// Run until stopped, a required input closes, or the audio device fails
    pub async fn run(
        mut self,
        mut io: SessionIo,
        mut commands: mpsc::UnboundedReceiver<VoiceCommand>,
    ) {
        let mut device_errors = Some(io.device_errors);
        loop {
            tokio::select! {
                biased;

                error = next_or_pending(&mut device_errors) => {
                    match error {
                        Some(error) => {
                            warn!(%error, "audio device failed, ending voice session");
                            let _ = self.events.send(VoiceEvent::AudioError(error));
                            break;
                        }
                        None => device_errors = None,
                    }
                }

                control = next_or_pending(&mut io.control) => {
                    match control {
                        Some(event) => self.controller.handle_control(event).await,
                        None => {
                            debug!("control input closed");
                            io.control = None;
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(VoiceCommand::Stop) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }

                block = io.capture.recv() => {
                    let Some(block) = block else {
                        debug!("capture closed, ending voice session");
                        break;
                    };
                    if !self.write_block(&block).await {
                        break;
                    }
                }

                packet = io.inbound.recv() => {
                    let Some(packet) = packet else {
                        debug!("inbound voice closed, ending voice session");
                        break;
                    };
                    if let Err(e) = self.router.handle(packet).await {
                        warn!(error = %e, "inbound voice packet failed");
                    }
                }
            }
        }

        self.controller.end().await;
        self.router.close_all().await;
        info!("voice session ended");
        let _ = self.events.send(VoiceEvent::SessionEnded);
    }

    /// Frame a captured block and offer every frame; `false` once the controller is closed
    async fn write_block(&mut self, block: &[f32]) -> bool {
        for frame in self.capture.push(block) {
            if let Err(e) = self.controller.write(frame).await {
                warn!(error = %e, "voice activation refused frame");
                return false;
            }
        }
        true
    }

    async fn handle_command(&mut self, command: VoiceCommand) {
        match command {
            VoiceCommand::StartTransmitting(reply) => {
                let _ = reply.send(self.controller.start_transmitting().await);
            }
            VoiceCommand::StopTransmitting => self.controller.stop_transmitting().await,
            VoiceCommand::SetMute(muted) => self.controller.set_mute(muted).await,
            VoiceCommand::SetTarget(target) => {
                self.capture.set_target(target);
                self.controller.set_target(target).await;
            }
            VoiceCommand::SetQuality(quality) => {
                debug!(bitrate = quality.bitrate(), "voice quality changed");
                self.bitrate.set(quality);
            }
            VoiceCommand::SetDeafened(deafened) => self.playback.set_deafened(deafened),
            VoiceCommand::MuteUser(session) => self.playback.set_session_muted(session, true),
            VoiceCommand::UnmuteUser(session) => self.playback.set_session_muted(session, false),
            VoiceCommand::UserLeft(session) => self.router.remove_session(session).await,
            VoiceCommand::Stop => {}
        }
    }
}

/// Next message of an optional channel; never resolves once the channel is gone
async fn next_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Voice Session Handle
// =============================================================================

/// Configuration for starting a voice session on real devices
pub struct VoiceSessionConfig {
    pub settings: AudioSettings,
    /// Process-wide device session manager
    pub devices: &'static DeviceContextManager,
    /// Network side receiving encoded packets
    pub packet_sink: Arc<dyn PacketSink>,
    /// Packets received from the network
    pub inbound: mpsc::UnboundedReceiver<InboundPacket>,
    /// Push-to-talk source, bound when the activation mode asks for it
    pub control_input: Arc<dyn ControlInput>,
    pub codecs: Arc<dyn CodecFactory>,
}

/// Handle for controlling an active voice session
pub struct VoiceSessionHandle {
    command_tx: mpsc::UnboundedSender<VoiceCommand>,
    /// The session thread; cpal streams are not `Send`
    handle: Option<JoinHandle<()>>,
}

impl VoiceSessionHandle {
    /// Start a voice session on a dedicated thread
    ///
    /// Returns a handle for controlling the session and a receiver for events.
    /// Setup failures are reported as [`VoiceEvent::AudioError`] followed by
    /// [`VoiceEvent::SessionEnded`].
    pub fn start(config: VoiceSessionConfig) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let thread_events = event_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("voice-session".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = thread_events.send(VoiceEvent::AudioError(format!(
                            "failed to create voice runtime: {}",
                            e
                        )));
                        let _ = thread_events.send(VoiceEvent::SessionEnded);
                        return;
                    }
                };
                runtime.block_on(run_voice_session(config, thread_events, command_rx));
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                let _ = event_tx.send(VoiceEvent::AudioError(format!(
                    "failed to spawn voice thread: {}",
                    e
                )));
                let _ = event_tx.send(VoiceEvent::SessionEnded);
                None
            }
        };

        (Self { command_tx, handle }, event_rx)
    }

    /// Start transmitting; fails with [`VoiceError::Muted`] while muted
    pub async fn start_transmitting(&self) -> Result<(), VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(VoiceCommand::StartTransmitting(tx))
            .map_err(|_| VoiceError::Closed("voice session"))?;
        rx.await.map_err(|_| VoiceError::Closed("voice session"))?
    }

    pub fn stop_transmitting(&self) {
        let _ = self.command_tx.send(VoiceCommand::StopTransmitting);
    }

    pub fn set_mute(&self, muted: bool) {
        let _ = self.command_tx.send(VoiceCommand::SetMute(muted));
    }

    pub fn set_target(&self, target: VoiceTarget) {
        let _ = self.command_tx.send(VoiceCommand::SetTarget(target));
    }

    /// Update voice quality without leaving the session
    pub fn set_quality(&self, quality: VoiceQuality) {
        let _ = self.command_tx.send(VoiceCommand::SetQuality(quality));
    }

    pub fn set_deafened(&self, deafened: bool) {
        let _ = self.command_tx.send(VoiceCommand::SetDeafened(deafened));
    }

    pub fn mute_user(&self, session: u32) {
        let _ = self.command_tx.send(VoiceCommand::MuteUser(session));
    }

    pub fn unmute_user(&self, session: u32) {
        let _ = self.command_tx.send(VoiceCommand::UnmuteUser(session));
    }

    pub fn user_left(&self, session: u32) {
        let _ = self.command_tx.send(VoiceCommand::UserLeft(session));
    }

    /// Stop the session
    ///
    /// The thread releases the devices on its own; this does not wait for it
    /// so unresponsive audio drivers can't block the caller.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(VoiceCommand::Stop);
        self.handle.take();
    }
}

impl Drop for VoiceSessionHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn fail(events: &mpsc::UnboundedSender<VoiceEvent>, error: VoiceError) {
    warn!(error = %error, "voice session setup failed");
    let _ = events.send(VoiceEvent::AudioError(error.to_string()));
    let _ = events.send(VoiceEvent::SessionEnded);
}

async fn run_voice_session(
    config: VoiceSessionConfig,
    events: mpsc::UnboundedSender<VoiceEvent>,
    commands: mpsc::UnboundedReceiver<VoiceCommand>,
) {
    let VoiceSessionConfig {
        settings,
        devices,
        packet_sink,
        inbound,
        control_input,
        codecs,
    } = config;

    let ctx = match devices.get_or_create(&settings.device).await {
        Ok(ctx) => ctx,
        Err(e) => return fail(&events, e),
    };
    if ctx.state() == ContextState::Suspended {
        // Deferred until the first user gesture where the platform requires one
        if let Err(e) = devices.auto_resume().await {
            warn!(error = %e, "could not resume audio output");
        }
    }

    let (microphone, channels) = match MicrophoneSource::open(&settings.input_device) {
        Ok(opened) => opened,
        Err(e) => return fail(&events, e),
    };
    if let Err(e) = microphone.start() {
        return fail(&events, e);
    }

    let mut session = VoiceSession::new(
        &settings,
        codecs,
        packet_sink,
        ctx.playback(),
        events.clone(),
    )
    .await;

    let control = if settings.activation == ActivationMode::PushToTalk {
        match control_input.bind(&settings.ptt_key) {
            Ok(binding) => session.controller_mut().attach_control(binding),
            Err(e) => {
                warn!(error = %e, key = %settings.ptt_key, "push-to-talk unavailable");
                None
            }
        }
    } else {
        None
    };

    let io = SessionIo {
        capture: channels.blocks,
        inbound,
        device_errors: channels.errors,
        control,
    };
    session.run(io, commands).await;
    microphone.stop();
}

// =============================================================================
// Tests
// =============================================================================
