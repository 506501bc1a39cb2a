//! Outbound voice transport seams
//!
//! The activation controller writes frames into an [`OutboundStream`] opened
//! from a [`Transport`]. [`EncodingTransport`] is the real one: each stream
//! borrows an encoder unit, and encoded packets go to a [`PacketSink`] (the
//! network side). [`DropSink`] stands in when no transport is attached.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use async_trait::async_trait;
use parlor_common::codec::{CodecRequest, CodecResponse};
use parlor_common::voice::{AudioFrame, Codec, VOICE_CHANNELS, VoiceQuality, VoiceTarget};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::VoiceError;

use super::worker::{BorrowedWorker, CodecWorkerPool};

// =============================================================================
// Seams
// =============================================================================

/// Opens outbound voice streams
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_voice_stream(
        &self,
        target: VoiceTarget,
    ) -> Result<Box<dyn OutboundStream>, VoiceError>;
}

/// One transmission, from the first frame to the end of talking
#[async_trait]
pub trait OutboundStream: Send {
    fn target(&self) -> VoiceTarget;

    /// Queue a frame; never blocks
    fn write(&mut self, frame: AudioFrame) -> Result<(), VoiceError>;

    /// Flush and close; later calls are no-ops
    async fn end(&mut self) -> Result<(), VoiceError>;
}

/// An encoded voice packet ready for the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub codec: Codec,
    pub target: VoiceTarget,
    pub position: u64,
    pub payload: Vec<u8>,
}

/// Network side of the outbound path
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: OutboundPacket) -> Result<(), VoiceError>;

    /// Signal that the transmission to `target` is over
    fn end_transmission(&self, target: VoiceTarget) -> Result<(), VoiceError>;
}

// =============================================================================
// Drop Sink
// =============================================================================

/// Transport that discards everything
#[derive(Debug, Default, Clone)]
pub struct DropSink {
    dropped: Arc<AtomicU64>,
}

impl DropSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames discarded so far, over all streams
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for DropSink {
    async fn open_voice_stream(
        &self,
        target: VoiceTarget,
    ) -> Result<Box<dyn OutboundStream>, VoiceError> {
        Ok(Box::new(DropStream {
            target,
            dropped: self.dropped.clone(),
        }))
    }
}

struct DropStream {
    target: VoiceTarget,
    dropped: Arc<AtomicU64>,
}

#[async_trait]
impl OutboundStream for DropStream {
    fn target(&self) -> VoiceTarget {
        self.target
    }

    fn write(&mut self, frame: AudioFrame) -> Result<(), VoiceError> {
        trace!(position = frame.position, "no transport attached, dropping frame");
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn end(&mut self) -> Result<(), VoiceError> {
        Ok(())
    }
}

// =============================================================================
// Bitrate
// =============================================================================

/// Shared, live-adjustable encoder bitrate
#[derive(Debug, Clone)]
pub struct BitrateHandle(Arc<AtomicI32>);

impl BitrateHandle {
    pub fn new(quality: VoiceQuality) -> Self {
        Self(Arc::new(AtomicI32::new(quality.bitrate())))
    }

    /// Applies from the next encoded frame on
    pub fn set(&self, quality: VoiceQuality) {
        self.0.store(quality.bitrate(), Ordering::Relaxed);
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Encoding Transport
// =============================================================================

/// Transport that encodes frames on pooled workers and hands packets to a sink
pub struct EncodingTransport {
    pool: Arc<CodecWorkerPool>,
    sink: Arc<dyn PacketSink>,
    codec: Codec,
    bitrate: BitrateHandle,
}

impl EncodingTransport {
    pub fn new(
        pool: Arc<CodecWorkerPool>,
        sink: Arc<dyn PacketSink>,
        codec: Codec,
        bitrate: BitrateHandle,
    ) -> Self {
        Self {
            pool,
            sink,
            codec,
            bitrate,
        }
    }

    pub fn bitrate(&self) -> BitrateHandle {
        self.bitrate.clone()
    }
}

#[async_trait]
impl Transport for EncodingTransport {
    async fn open_voice_stream(
        &self,
        target: VoiceTarget,
    ) -> Result<Box<dyn OutboundStream>, VoiceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = self.pool.borrow(tx).await?;
        debug!(worker = worker.id(), %target, "opened outbound voice stream");

        let packets = tokio::spawn(send_packets(rx, self.sink.clone(), self.codec));
        Ok(Box::new(EncodeStream {
            target,
            codec: self.codec,
            bitrate: self.bitrate.clone(),
            sink: self.sink.clone(),
            worker: Some(worker),
            packets: Some(packets),
        }))
    }
}

/// Turn encoder responses into packets until the unit is released
async fn send_packets(
    mut responses: mpsc::UnboundedReceiver<CodecResponse>,
    sink: Arc<dyn PacketSink>,
    codec: Codec,
) {
    while let Some(response) = responses.recv().await {
        let CodecResponse::Encoded {
            target,
            buffer,
            byte_offset,
            byte_length,
            position,
        } = response
        else {
            continue;
        };
        // Empty payload: the encoder dropped this frame
        if byte_length == 0 {
            continue;
        }
        let Some(payload) = buffer.get(byte_offset..byte_offset + byte_length) else {
            continue;
        };

        let packet = OutboundPacket {
            codec,
            target,
            position,
            payload: payload.to_vec(),
        };
        if let Err(e) = sink.send_packet(packet) {
            warn!(position, error = %e, "failed to send voice packet");
        }
    }
}

struct EncodeStream {
    target: VoiceTarget,
    codec: Codec,
    bitrate: BitrateHandle,
    sink: Arc<dyn PacketSink>,
    worker: Option<BorrowedWorker>,
    packets: Option<JoinHandle<()>>,
}

#[async_trait]
impl OutboundStream for EncodeStream {
    fn target(&self) -> VoiceTarget {
        self.target
    }

    fn write(&mut self, frame: AudioFrame) -> Result<(), VoiceError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or(VoiceError::Closed("outbound voice stream"))?;
        let position = frame.position;
        let target = frame.target;
        worker.post(CodecRequest::Encode {
            codec: self.codec,
            target,
            buffer: frame.into_samples(),
            channels: VOICE_CHANNELS,
            bitrate: self.bitrate.get(),
            position,
        })
    }

    async fn end(&mut self) -> Result<(), VoiceError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = worker.finish().await;
        if let Some(packets) = self.packets.take() {
            let _ = packets.await;
        }
        if let Err(e) = self.sink.end_transmission(self.target) {
            warn!(target = %self.target, error = %e, "failed to end transmission");
        }
        debug!(target = %self.target, "closed outbound voice stream");
        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use parlor_common::codec::WorkerRole;

    use crate::voice::testing::{FakeCodecFactory, RecordingPacketSink};

    fn frame(position: u64) -> AudioFrame {
        AudioFrame::silence(VoiceTarget::Normal, position)
    }

    #[tokio::test]
    async fn test_drop_sink_discards() {
        let sink = DropSink::new();
        let mut stream = sink.open_voice_stream(VoiceTarget::Shout).await.unwrap();
        assert_eq!(stream.target(), VoiceTarget::Shout);
        stream.write(frame(0)).unwrap();
        stream.write(frame(1)).unwrap();
        stream.end().await.unwrap();
        stream.end().await.unwrap();
        assert_eq!(sink.dropped_frames(), 2);
    }

    #[tokio::test]
    async fn test_encoding_transport_sends_packets_in_order() {
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, FakeCodecFactory::new(), 1);
        let sink = RecordingPacketSink::new();
        let transport = EncodingTransport::new(
            pool.clone(),
            sink.clone(),
            Codec::Opus,
            BitrateHandle::new(VoiceQuality::High),
        );

        let mut stream = transport.open_voice_stream(VoiceTarget::Normal).await.unwrap();
        for position in 10..13 {
            stream.write(frame(position)).unwrap();
        }
        stream.end().await.unwrap();

        let packets = sink.packets();
        let positions: Vec<u64> = packets.iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![10, 11, 12]);
        assert!(packets.iter().all(|p| p.codec == Codec::Opus && !p.payload.is_empty()));
        assert_eq!(sink.ended(), vec![VoiceTarget::Normal]);
        assert_eq!(pool.idle_workers(), 1);

        // Closed streams refuse frames
        assert!(matches!(
            stream.write(frame(13)),
            Err(VoiceError::Closed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_streams_share_bounded_pool() {
        const UNITS: usize = 2;
        const STREAMS: u64 = 6;
        const FRAMES: u64 = 4;

        let factory = FakeCodecFactory::new();
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, factory.clone(), UNITS);
        let sink = RecordingPacketSink::new();
        let transport = Arc::new(EncodingTransport::new(
            pool.clone(),
            sink.clone(),
            Codec::Opus,
            BitrateHandle::new(VoiceQuality::High),
        ));
        let open = Arc::new(AtomicUsize::new(0));
        let peak_open = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for stream_index in 0..STREAMS {
            let transport = transport.clone();
            let pool = pool.clone();
            let open = open.clone();
            let peak_open = peak_open.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = transport.open_voice_stream(VoiceTarget::Normal).await.unwrap();
                let now_open = open.fetch_add(1, Ordering::SeqCst) + 1;
                peak_open.fetch_max(now_open, Ordering::SeqCst);
                assert!(pool.busy_workers() <= UNITS);

                for frame_index in 0..FRAMES {
                    stream.write(frame(stream_index * 100 + frame_index)).unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                open.fetch_sub(1, Ordering::SeqCst);
                stream.end().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak_open.load(Ordering::SeqCst) <= UNITS);
        assert!(factory.peak_live() <= UNITS);
        assert!(pool.live_workers() <= UNITS);
        assert_eq!(pool.busy_workers(), 0);

        // Every stream starts from fresh codec state, even on a reused unit
        let packets = sink.packets();
        assert_eq!(packets.len() as u64, STREAMS * FRAMES);
        for packet in &packets {
            let frame_index = packet.position % 100;
            assert_eq!(u64::from(packet.payload[0]), frame_index);
        }
        assert_eq!(factory.created() as u64, STREAMS);
        assert_eq!(sink.ended().len() as u64, STREAMS);
    }

    #[tokio::test]
    async fn test_bitrate_change_applies_to_next_frame() {
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, FakeCodecFactory::new(), 1);
        let sink = RecordingPacketSink::new();
        let bitrate = BitrateHandle::new(VoiceQuality::High);
        let transport =
            EncodingTransport::new(pool, sink.clone(), Codec::Opus, bitrate.clone());

        let mut stream = transport.open_voice_stream(VoiceTarget::Normal).await.unwrap();
        stream.write(frame(0)).unwrap();
        transport.bitrate().set(VoiceQuality::Low);
        stream.write(frame(1)).unwrap();
        stream.end().await.unwrap();

        // The fake codec reports the bitrate in kbps as the second byte
        let kbps: Vec<u8> = sink.packets().iter().map(|p| p.payload[1]).collect();
        assert_eq!(kbps, vec![64, 16]);
        assert_eq!(bitrate.get(), 16000);
    }
}
