//! Test doubles shared by the voice unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parlor_common::codec::WorkerRole;
use parlor_common::voice::{AudioFrame, Codec, FRAME_LEN, VoiceTarget};

use crate::error::VoiceError;

use super::codec::{CodecFactory, CodecTransform};
use super::inbound::PlaybackSink;
use super::transport::{OutboundPacket, OutboundStream, PacketSink, Transport};

/// Sample value the fake decoder fills concealed frames with
pub const PLC_MARKER: f32 = -1.0;

// =============================================================================
// Codec
// =============================================================================

/// Factory for deterministic fake codecs
///
/// Encoded packets are `[frames since creation, bitrate in kbps, 0xAA]`.
/// Decoding a packet yields a frame filled with its first byte; concealment
/// yields a frame of [`PLC_MARKER`].
#[derive(Default)]
pub struct FakeCodecFactory {
    created: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak_live: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
    panic_on_encode: Arc<AtomicBool>,
}

impl FakeCodecFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Codec instances created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most codec instances that existed at the same time
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    /// Make codecs report zero channels, producing malformed responses
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    /// Make encoding panic, killing the worker thread
    pub fn set_panic_on_encode(&self, panic: bool) {
        self.panic_on_encode.store(panic, Ordering::SeqCst);
    }
}

impl CodecFactory for FakeCodecFactory {
    fn create(
        &self,
        _role: WorkerRole,
        _codec: Codec,
        channels: u16,
    ) -> Result<Box<dyn CodecTransform>, VoiceError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeCodec {
            frames: 0,
            channels,
            live: self.live.clone(),
            broken: self.broken.clone(),
            panic_on_encode: self.panic_on_encode.clone(),
        }))
    }
}

struct FakeCodec {
    frames: u64,
    channels: u16,
    live: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
    panic_on_encode: Arc<AtomicBool>,
}

impl CodecTransform for FakeCodec {
    fn encode(&mut self, _samples: &[f32], bitrate: i32) -> Result<Vec<u8>, VoiceError> {
        if self.panic_on_encode.load(Ordering::SeqCst) {
            panic!("fake encoder crashed");
        }
        let packet = vec![self.frames as u8, (bitrate / 1000) as u8, 0xAA];
        self.frames += 1;
        Ok(packet)
    }

    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<f32>, VoiceError> {
        self.frames += 1;
        let value = match packet {
            Some(bytes) => bytes.first().copied().map(f32::from).unwrap_or(0.0),
            None => PLC_MARKER,
        };
        Ok(vec![value; FRAME_LEN * self.channels.max(1) as usize])
    }

    fn channels(&self) -> u16 {
        if self.broken.load(Ordering::SeqCst) {
            0
        } else {
            self.channels
        }
    }
}

impl Drop for FakeCodec {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Playback
// =============================================================================

/// Playback sink that records what it was asked to play
#[derive(Default)]
pub struct RecordingPlayback {
    queued: Mutex<Vec<(u32, Vec<f32>, u16)>>,
    removed: Mutex<Vec<u32>>,
    deafened: AtomicBool,
    muted: Mutex<HashSet<u32>>,
}

impl RecordingPlayback {
    /// First sample of every frame queued for `session`, in order
    pub fn first_samples(&self, session: u32) -> Vec<f32> {
        self.queued
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == session)
            .filter_map(|(_, samples, _)| samples.first().copied())
            .collect()
    }

    pub fn removed(&self) -> Vec<u32> {
        self.removed.lock().unwrap().clone()
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self, session: u32) -> bool {
        self.muted.lock().unwrap().contains(&session)
    }
}

impl PlaybackSink for RecordingPlayback {
    fn queue_audio(&self, session: u32, samples: &[f32], channels: u16) {
        self.queued
            .lock()
            .unwrap()
            .push((session, samples.to_vec(), channels));
    }

    fn remove(&self, session: u32) {
        self.removed.lock().unwrap().push(session);
    }

    fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::SeqCst);
    }

    fn set_session_muted(&self, session: u32, muted: bool) {
        let mut set = self.muted.lock().unwrap();
        if muted {
            set.insert(session);
        } else {
            set.remove(&session);
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
struct TransportLog {
    opened: Mutex<Vec<VoiceTarget>>,
    frames: Mutex<Vec<AudioFrame>>,
    ended: AtomicUsize,
    fail_open: AtomicBool,
}

/// Transport that records every stream opened on it
#[derive(Default, Clone)]
pub struct RecordingTransport {
    log: Arc<TransportLog>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets of every opened stream
    pub fn opened(&self) -> Vec<VoiceTarget> {
        self.log.opened.lock().unwrap().clone()
    }

    /// Every frame written, over all streams
    pub fn frames(&self) -> Vec<AudioFrame> {
        self.log.frames.lock().unwrap().clone()
    }

    /// Streams that were ended
    pub fn ended(&self) -> usize {
        self.log.ended.load(Ordering::SeqCst)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.log.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open_voice_stream(
        &self,
        target: VoiceTarget,
    ) -> Result<Box<dyn OutboundStream>, VoiceError> {
        if self.log.fail_open.load(Ordering::SeqCst) {
            return Err(VoiceError::Device("transport unavailable".into()));
        }
        self.log.opened.lock().unwrap().push(target);
        Ok(Box::new(RecordingStream {
            target,
            log: self.log.clone(),
            ended: false,
        }))
    }
}

struct RecordingStream {
    target: VoiceTarget,
    log: Arc<TransportLog>,
    ended: bool,
}

#[async_trait]
impl OutboundStream for RecordingStream {
    fn target(&self) -> VoiceTarget {
        self.target
    }

    fn write(&mut self, frame: AudioFrame) -> Result<(), VoiceError> {
        if self.ended {
            return Err(VoiceError::Closed("recording stream"));
        }
        self.log.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn end(&mut self) -> Result<(), VoiceError> {
        if !self.ended {
            self.ended = true;
            self.log.ended.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// Packet Sink
// =============================================================================

/// Packet sink that keeps everything it is given
#[derive(Default)]
pub struct RecordingPacketSink {
    packets: Mutex<Vec<OutboundPacket>>,
    ended: Mutex<Vec<VoiceTarget>>,
}

impl RecordingPacketSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn packets(&self) -> Vec<OutboundPacket> {
        self.packets.lock().unwrap().clone()
    }

    pub fn ended(&self) -> Vec<VoiceTarget> {
        self.ended.lock().unwrap().clone()
    }
}

impl PacketSink for RecordingPacketSink {
    fn send_packet(&self, packet: OutboundPacket) -> Result<(), VoiceError> {
        self.packets.lock().unwrap().push(packet);
        Ok(())
    }

    fn end_transmission(&self, target: VoiceTarget) -> Result<(), VoiceError> {
        self.ended.lock().unwrap().push(target);
        Ok(())
    }
}
