//! Voice activation
//!
//! Decides which captured frames leave the client. In continuous mode every
//! frame is sent unless muted; in push-to-talk mode only while the control is
//! held (or toggled on). The first admitted frame opens an outbound stream and
//! anything that stops admission closes it again, so `StartedTalking` and
//! `StoppedTalking` always come in pairs.

use std::sync::Arc;

use parlor_common::voice::{AudioFrame, VoiceTarget};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ActivationMode, PttMode};
use crate::error::VoiceError;

use super::event::VoiceEvent;
use super::ptt::{ControlBinding, ControlEvent, PttLatch, PttState};
use super::transport::{DropSink, OutboundStream, Transport};

/// Snapshot of the local voice state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceSessionState {
    pub mode: ActivationMode,
    pub muted: bool,
    /// An outbound stream is open
    pub talking: bool,
}

/// Gates captured frames into outbound streams
pub struct VoiceActivationController {
    mode: ActivationMode,
    latch: PttLatch,
    transport: Arc<dyn Transport>,
    target: VoiceTarget,
    muted: bool,
    stream: Option<Box<dyn OutboundStream>>,
    binding: Option<ControlBinding>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    ended: bool,
}

impl VoiceActivationController {
    /// Create a controller with no transport attached (frames go to a [`DropSink`])
    pub fn new(
        mode: ActivationMode,
        ptt_mode: PttMode,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> Self {
        Self {
            mode,
            latch: PttLatch::new(ptt_mode),
            transport: Arc::new(DropSink::new()),
            target: VoiceTarget::default(),
            muted: false,
            stream: None,
            binding: None,
            events,
            ended: false,
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> VoiceSessionState {
        VoiceSessionState {
            mode: self.mode,
            muted: self.muted,
            talking: self.is_talking(),
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_talking(&self) -> bool {
        self.stream.is_some()
    }

    pub fn target(&self) -> VoiceTarget {
        self.target
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Whether a frame written now would be sent
    pub fn admits_frames(&self) -> bool {
        if self.ended || self.muted {
            return false;
        }
        match self.mode {
            ActivationMode::Continuous => true,
            ActivationMode::PushToTalk => self.latch.is_active(),
        }
    }

    // =========================================================================
    // Wiring
    // =========================================================================

    /// Replace the transport; an open stream on the old one is closed first
    pub async fn attach_transport(&mut self, transport: Arc<dyn Transport>) {
        self.close_stream().await;
        self.transport = transport;
    }

    /// Take ownership of a control binding
    ///
    /// Returns the binding's event receiver, which the caller feeds back
    /// through [`handle_control`](Self::handle_control). A previous binding is
    /// unbound.
    pub fn attach_control(
        &mut self,
        mut binding: ControlBinding,
    ) -> Option<mpsc::UnboundedReceiver<ControlEvent>> {
        if let Some(mut previous) = self.binding.take() {
            previous.unbind();
        }
        let events = binding.take_events();
        self.binding = Some(binding);
        events
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Offer a captured frame
    ///
    /// Frames that are not admitted (muted, or push-to-talk not active) are
    /// dropped silently. Transport failures are logged and drop the frame.
    pub async fn write(&mut self, frame: AudioFrame) -> Result<(), VoiceError> {
        if self.ended {
            return Err(VoiceError::Closed("voice session"));
        }
        if !self.admits_frames() {
            return Ok(());
        }
        if self.stream.is_none() && !self.open_stream().await {
            return Ok(());
        }

        let target = self.target;
        if let Some(stream) = self.stream.as_mut()
            && let Err(e) = stream.write(frame.with_target(target))
        {
            warn!(error = %e, "failed to write voice frame, closing stream");
            self.close_stream().await;
        }
        Ok(())
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// React to a push-to-talk press or release
    pub async fn handle_control(&mut self, event: ControlEvent) {
        if self.ended || self.mode != ActivationMode::PushToTalk {
            return;
        }
        let change = match event {
            ControlEvent::Pressed => self.latch.handle_press(),
            ControlEvent::Released => self.latch.handle_release(),
        };
        match change {
            Some(PttState::Transmitting) => debug!("push-to-talk engaged"),
            Some(PttState::Idle) => {
                debug!("push-to-talk released");
                self.close_stream().await;
            }
            None => {}
        }
    }

    /// Start transmitting now, regardless of the control input
    pub async fn start_transmitting(&mut self) -> Result<(), VoiceError> {
        if self.ended {
            return Err(VoiceError::Closed("voice session"));
        }
        if self.muted {
            return Err(VoiceError::Muted);
        }
        if self.mode == ActivationMode::PushToTalk {
            self.latch.force(true);
        }
        if self.stream.is_none() {
            self.open_stream().await;
        }
        Ok(())
    }

    /// Stop transmitting; in continuous mode the next frame opens a new stream
    pub async fn stop_transmitting(&mut self) {
        if self.mode == ActivationMode::PushToTalk {
            self.latch.force(false);
        }
        self.close_stream().await;
    }

    pub async fn set_mute(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        debug!(muted, "self-mute changed");
        if muted {
            self.close_stream().await;
        }
    }

    /// Address subsequent frames to `target`
    ///
    /// An open stream belongs to the old target and is closed; the next
    /// admitted frame opens one for the new target.
    pub async fn set_target(&mut self, target: VoiceTarget) {
        if self.target == target {
            return;
        }
        self.target = target;
        self.close_stream().await;
    }

    /// Switch activation mode; the push-to-talk latch starts released
    pub async fn set_mode(&mut self, mode: ActivationMode, ptt_mode: PttMode) {
        self.close_stream().await;
        self.mode = mode;
        self.latch.set_mode(ptt_mode);
    }

    /// Unbind the control input and close the outbound stream; later calls do nothing
    pub async fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Some(mut binding) = self.binding.take() {
            binding.unbind();
        }
        self.close_stream().await;
        debug!("voice activation ended");
    }

    // =========================================================================
    // Streams
    // =========================================================================

    async fn open_stream(&mut self) -> bool {
        match self.transport.open_voice_stream(self.target).await {
            Ok(stream) => {
                self.stream = Some(stream);
                let _ = self.events.send(VoiceEvent::StartedTalking);
                true
            }
            Err(e) => {
                warn!(target = %self.target, error = %e, "failed to open voice stream, dropping frame");
                false
            }
        }
    }

    async fn close_stream(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if let Err(e) = stream.end().await {
            warn!(error = %e, "error closing voice stream");
        }
        let _ = self.events.send(VoiceEvent::StoppedTalking);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::voice::testing::RecordingTransport;

    fn frame(position: u64) -> AudioFrame {
        AudioFrame::silence(VoiceTarget::Normal, position)
    }

    async fn controller(
        mode: ActivationMode,
        ptt_mode: PttMode,
    ) -> (
        VoiceActivationController,
        RecordingTransport,
        mpsc::UnboundedReceiver<VoiceEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut controller = VoiceActivationController::new(mode, ptt_mode, tx);
        let transport = RecordingTransport::new();
        controller.attach_transport(Arc::new(transport.clone())).await;
        (controller, transport, rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_continuous_forwards_every_frame() {
        let (mut c, transport, mut rx) =
            controller(ActivationMode::Continuous, PttMode::Hold).await;

        for position in 0..3 {
            c.write(frame(position)).await.unwrap();
        }
        let positions: Vec<u64> = transport.frames().iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(transport.opened(), vec![VoiceTarget::Normal]);
        assert!(c.state().talking);

        c.end().await;
        assert_eq!(transport.ended(), 1);
        assert_eq!(
            events(&mut rx),
            vec![VoiceEvent::StartedTalking, VoiceEvent::StoppedTalking]
        );
    }

    #[tokio::test]
    async fn test_push_to_talk_hold() {
        let (mut c, transport, mut rx) =
            controller(ActivationMode::PushToTalk, PttMode::Hold).await;

        c.write(frame(0)).await.unwrap();
        assert!(transport.frames().is_empty());

        c.handle_control(ControlEvent::Pressed).await;
        c.write(frame(1)).await.unwrap();
        c.write(frame(2)).await.unwrap();
        c.handle_control(ControlEvent::Released).await;
        assert!(!c.is_talking());
        c.write(frame(3)).await.unwrap();

        let positions: Vec<u64> = transport.frames().iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(transport.ended(), 1);
        assert_eq!(
            events(&mut rx),
            vec![VoiceEvent::StartedTalking, VoiceEvent::StoppedTalking]
        );
    }

    #[tokio::test]
    async fn test_push_to_talk_toggle() {
        let (mut c, transport, _rx) =
            controller(ActivationMode::PushToTalk, PttMode::Toggle).await;

        c.handle_control(ControlEvent::Pressed).await;
        c.handle_control(ControlEvent::Released).await;
        c.write(frame(0)).await.unwrap();
        assert!(c.is_talking());

        c.handle_control(ControlEvent::Pressed).await;
        assert!(!c.is_talking());
        c.write(frame(1)).await.unwrap();
        assert_eq!(transport.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_mute_closes_stream_once() {
        let (mut c, transport, mut rx) =
            controller(ActivationMode::Continuous, PttMode::Hold).await;

        c.write(frame(0)).await.unwrap();
        c.set_mute(true).await;
        c.set_mute(true).await;
        c.write(frame(1)).await.unwrap();
        assert_eq!(transport.frames().len(), 1);
        assert_eq!(
            events(&mut rx),
            vec![VoiceEvent::StartedTalking, VoiceEvent::StoppedTalking]
        );

        c.set_mute(false).await;
        c.write(frame(2)).await.unwrap();
        assert_eq!(transport.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_start_transmitting_while_muted() {
        let (mut c, transport, mut rx) =
            controller(ActivationMode::PushToTalk, PttMode::Hold).await;
        c.set_mute(true).await;

        assert_eq!(c.start_transmitting().await, Err(VoiceError::Muted));
        assert!(transport.opened().is_empty());
        assert!(events(&mut rx).is_empty());

        c.set_mute(false).await;
        c.start_transmitting().await.unwrap();
        // Already open: a second request changes nothing
        c.start_transmitting().await.unwrap();
        assert_eq!(transport.opened().len(), 1);
        c.write(frame(0)).await.unwrap();
        assert_eq!(transport.frames().len(), 1);

        c.stop_transmitting().await;
        c.stop_transmitting().await;
        assert_eq!(
            events(&mut rx),
            vec![VoiceEvent::StartedTalking, VoiceEvent::StoppedTalking]
        );
    }

    #[tokio::test]
    async fn test_drop_sink_still_reports_talking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut c = VoiceActivationController::new(ActivationMode::Continuous, PttMode::Hold, tx);

        c.write(frame(0)).await.unwrap();
        c.set_mute(true).await;
        assert_eq!(
            events(&mut rx),
            vec![VoiceEvent::StartedTalking, VoiceEvent::StoppedTalking]
        );
    }

    #[tokio::test]
    async fn test_end_unbinds_control() {
        let (mut c, _transport, _rx) =
            controller(ActivationMode::PushToTalk, PttMode::Hold).await;
        let unbound = Arc::new(AtomicBool::new(false));
        let flag = unbound.clone();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let events = c.attach_control(ControlBinding::new(control_rx, move || {
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(events.is_some());

        c.end().await;
        assert!(unbound.load(Ordering::SeqCst));
        assert!(matches!(
            c.write(frame(0)).await,
            Err(VoiceError::Closed(_))
        ));
        // Ending twice is harmless
        c.end().await;
    }

    #[tokio::test]
    async fn test_target_change_reopens_stream() {
        let (mut c, transport, _rx) =
            controller(ActivationMode::Continuous, PttMode::Hold).await;

        c.write(frame(0)).await.unwrap();
        c.set_target(VoiceTarget::Whisper).await;
        c.write(frame(1)).await.unwrap();

        assert_eq!(
            transport.opened(),
            vec![VoiceTarget::Normal, VoiceTarget::Whisper]
        );
        let targets: Vec<VoiceTarget> = transport.frames().iter().map(|f| f.target).collect();
        assert_eq!(targets, vec![VoiceTarget::Normal, VoiceTarget::Whisper]);
    }

    #[tokio::test]
    async fn test_open_failure_drops_frame() {
        let (mut c, transport, mut rx) =
            controller(ActivationMode::Continuous, PttMode::Hold).await;
        transport.set_fail_open(true);

        c.write(frame(0)).await.unwrap();
        assert!(!c.is_talking());
        assert!(events(&mut rx).is_empty());

        transport.set_fail_open(false);
        c.write(frame(1)).await.unwrap();
        assert!(c.is_talking());
    }

    #[tokio::test]
    async fn test_control_ignored_in_continuous_mode() {
        let (mut c, transport, _rx) =
            controller(ActivationMode::Continuous, PttMode::Hold).await;
        c.write(frame(0)).await.unwrap();
        c.handle_control(ControlEvent::Released).await;
        assert!(c.is_talking());
        assert_eq!(transport.ended(), 0);
    }
}
