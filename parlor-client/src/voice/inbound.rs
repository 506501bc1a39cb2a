//! Inbound voice: remote packets to decoded playback
//!
//! Every remote session that is talking gets a [`RemoteVoiceStream`] with its
//! own decoder unit, so codec state never mixes between speakers. Gaps in the
//! packet sequence are filled with concealed frames.

use std::collections::HashMap;
use std::sync::Arc;

use parlor_common::codec::{CodecRequest, CodecResponse};
use parlor_common::voice::{Codec, VoiceTarget};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::VoiceError;

use super::event::VoiceEvent;
use super::worker::{BorrowedWorker, CodecWorkerPool};

/// Longest run of lost packets that is concealed; longer gaps are skipped
const MAX_CONCEALED_FRAMES: u64 = 5;

// =============================================================================
// Seams
// =============================================================================

/// A voice packet received from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Remote session the audio belongs to
    pub session: u32,
    pub codec: Codec,
    pub target: VoiceTarget,
    /// Frame sequence number
    pub position: u64,
    /// `None` marks a packet known to be lost
    pub payload: Option<Vec<u8>>,
    /// Last packet of the transmission
    pub last: bool,
}

/// Where decoded remote audio ends up
pub trait PlaybackSink: Send + Sync {
    /// Queue decoded samples (interleaved when `channels > 1`) for a session
    fn queue_audio(&self, session: u32, samples: &[f32], channels: u16);

    /// Drop everything buffered for a session
    fn remove(&self, session: u32);

    /// Silence all incoming audio
    fn set_deafened(&self, deafened: bool);

    /// Silence one session
    fn set_session_muted(&self, session: u32, muted: bool);
}

// =============================================================================
// Remote Voice Stream
// =============================================================================

/// Decode pipeline for one talking remote session
pub struct RemoteVoiceStream {
    session: u32,
    codec: Codec,
    worker: Option<BorrowedWorker>,
    playback: Option<JoinHandle<()>>,
    next_position: Option<u64>,
}

impl RemoteVoiceStream {
    /// Attach a decoder unit to `session`
    pub fn new(
        session: u32,
        codec: Codec,
        worker: BorrowedWorker,
        responses: mpsc::UnboundedReceiver<CodecResponse>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Self {
        let playback = tokio::spawn(play_decoded(session, responses, sink));
        Self {
            session,
            codec,
            worker: Some(worker),
            playback: Some(playback),
            next_position: None,
        }
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Post a packet for decoding, concealing any gap before it
    pub fn push(&mut self, packet: InboundPacket) -> Result<(), VoiceError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or(VoiceError::Closed("remote voice stream"))?;

        let Some(following) = packet.position.checked_add(1) else {
            warn!(session = self.session, position = packet.position, "voice packet position out of range, dropped");
            return Ok(());
        };

        if let Some(expected) = self.next_position {
            if packet.position < expected {
                trace!(session = self.session, position = packet.position, "late voice packet dropped");
                return Ok(());
            }
            let missing = packet.position - expected;
            if missing > MAX_CONCEALED_FRAMES {
                debug!(session = self.session, missing, "voice gap too long to conceal");
            } else {
                for position in expected..packet.position {
                    worker.post(CodecRequest::Decode {
                        codec: self.codec,
                        buffer: None,
                        target: packet.target,
                        position,
                    })?;
                }
            }
        }

        self.next_position = Some(following);
        worker.post(CodecRequest::Decode {
            codec: self.codec,
            buffer: packet.payload,
            target: packet.target,
            position: packet.position,
        })
    }

    /// Release the decoder once everything posted so far reached playback
    pub async fn close(&mut self) -> Result<(), VoiceError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = worker.finish().await;
        if let Some(playback) = self.playback.take() {
            let _ = playback.await;
        }
        result
    }
}

async fn play_decoded(
    session: u32,
    mut responses: mpsc::UnboundedReceiver<CodecResponse>,
    sink: Arc<dyn PlaybackSink>,
) {
    while let Some(response) = responses.recv().await {
        if let CodecResponse::Decoded {
            buffer, channels, ..
        } = response
        {
            sink.queue_audio(session, &buffer, channels);
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Demultiplexes inbound packets into per-session decode streams
pub struct InboundRouter {
    pool: Arc<CodecWorkerPool>,
    playback: Arc<dyn PlaybackSink>,
    streams: HashMap<u32, RemoteVoiceStream>,
    events: mpsc::UnboundedSender<VoiceEvent>,
}

impl InboundRouter {
    pub fn new(
        pool: Arc<CodecWorkerPool>,
        playback: Arc<dyn PlaybackSink>,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> Self {
        Self {
            pool,
            playback,
            streams: HashMap::new(),
            events,
        }
    }

    /// Sessions currently talking, in ascending order
    pub fn active_sessions(&self) -> Vec<u32> {
        let mut sessions: Vec<u32> = self.streams.keys().copied().collect();
        sessions.sort_unstable();
        sessions
    }

    /// Route one packet
    ///
    /// When every decoder unit is busy, packets of sessions without a stream
    /// are dropped rather than waiting (waiting here would stall the packets
    /// that end the other streams).
    pub async fn handle(&mut self, packet: InboundPacket) -> Result<(), VoiceError> {
        let session = packet.session;
        let last = packet.last;

        if let Some(stream) = self.streams.get(&session)
            && stream.codec() != packet.codec
        {
            debug!(session, "remote codec changed, restarting decoder");
            self.finish(session).await?;
        }

        if !self.streams.contains_key(&session) {
            let (tx, rx) = mpsc::unbounded_channel();
            let Some(worker) = self.pool.try_borrow(tx)? else {
                warn!(session, "no decoder available, dropping voice packet");
                return Ok(());
            };
            let stream =
                RemoteVoiceStream::new(session, packet.codec, worker, rx, self.playback.clone());
            self.streams.insert(session, stream);
            let _ = self.events.send(VoiceEvent::RemoteTalkingStarted(session));
        }

        let pushed = match self.streams.get_mut(&session) {
            Some(stream) => stream.push(packet),
            None => Ok(()),
        };
        if let Err(e) = pushed {
            warn!(session, error = %e, "remote voice stream failed");
            let _ = self.finish(session).await;
            return Err(e);
        }

        if last {
            self.finish(session).await?;
        }
        Ok(())
    }

    /// End a session's stream, keeping already decoded audio queued
    pub async fn finish(&mut self, session: u32) -> Result<(), VoiceError> {
        let Some(mut stream) = self.streams.remove(&session) else {
            return Ok(());
        };
        let result = stream.close().await;
        let _ = self.events.send(VoiceEvent::RemoteTalkingStopped(session));
        result
    }

    /// A remote session left: stop decoding and discard its buffered audio
    pub async fn remove_session(&mut self, session: u32) {
        if let Err(e) = self.finish(session).await {
            warn!(session, error = %e, "error closing remote voice stream");
        }
        self.playback.remove(session);
    }

    /// End every stream
    pub async fn close_all(&mut self) {
        for session in self.active_sessions() {
            if let Err(e) = self.finish(session).await {
                warn!(session, error = %e, "error closing remote voice stream");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
