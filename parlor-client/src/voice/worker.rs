//! Pooled codec workers
//!
//! Each worker unit is an OS thread owning its own codec state, fed through a
//! crossbeam channel and answering on a tokio channel. A unit serves one
//! stream at a time, so responses need no correlation ids: whatever comes back
//! belongs to the stream that borrowed the unit.
//!
//! Recycling protocol: the borrower posts `reset`, the unit drops its codec
//! state and acknowledges, and only after that acknowledgment (which follows
//! every earlier response) does the unit go back to the idle list. A unit that
//! answers with anything malformed is retired instead.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parlor_common::codec::{CodecRequest, CodecResponse, WorkerRole};
use parlor_common::voice::{Codec, FRAME_LEN, VOICE_CHANNELS};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::VoiceError;

use super::codec::{CodecFactory, CodecTransform};

// =============================================================================
// Worker Thread
// =============================================================================

/// Codec state of a unit, rebuilt when the codec or layout changes
struct ActiveCodec {
    codec: Codec,
    channels: u16,
    transform: Box<dyn CodecTransform>,
}

fn transform_for<'a>(
    state: &'a mut Option<ActiveCodec>,
    factory: &dyn CodecFactory,
    role: WorkerRole,
    codec: Codec,
    channels: u16,
) -> Result<&'a mut Box<dyn CodecTransform>, VoiceError> {
    let reusable =
        matches!(state, Some(active) if active.codec == codec && active.channels == channels);
    if !reusable {
        let transform = factory.create(role, codec, channels)?;
        *state = Some(ActiveCodec {
            codec,
            channels,
            transform,
        });
    }
    state
        .as_mut()
        .map(|active| &mut active.transform)
        .ok_or_else(|| VoiceError::Codec("codec state missing".into()))
}

/// Body of a worker thread; exits once every request sender is gone
fn run_worker(
    id: u64,
    role: WorkerRole,
    factory: Arc<dyn CodecFactory>,
    requests: Receiver<CodecRequest>,
    responses: mpsc::UnboundedSender<CodecResponse>,
) {
    let mut state: Option<ActiveCodec> = None;

    for request in requests.iter() {
        let response = match request {
            CodecRequest::Reset => {
                state = None;
                CodecResponse::reset_ack(role)
            }
            CodecRequest::Encode {
                codec,
                target,
                buffer,
                channels,
                bitrate,
                position,
            } => {
                let packet = transform_for(&mut state, factory.as_ref(), role, codec, channels)
                    .and_then(|transform| transform.encode(&buffer, bitrate))
                    .unwrap_or_else(|e| {
                        warn!(worker = id, position, error = %e, "encode failed, dropping frame");
                        Vec::new()
                    });
                let byte_length = packet.len();
                CodecResponse::Encoded {
                    target,
                    buffer: packet,
                    byte_offset: 0,
                    byte_length,
                    position,
                }
            }
            CodecRequest::Decode {
                codec,
                buffer,
                target,
                position,
            } => {
                let (samples, channels) =
                    transform_for(&mut state, factory.as_ref(), role, codec, VOICE_CHANNELS)
                        .and_then(|transform| {
                            let channels = transform.channels();
                            transform
                                .decode(buffer.as_deref())
                                .map(|samples| (samples, channels))
                        })
                        .unwrap_or_else(|e| {
                            warn!(worker = id, position, error = %e, "decode failed, playing silence");
                            (vec![0.0; FRAME_LEN * VOICE_CHANNELS as usize], VOICE_CHANNELS)
                        });
                CodecResponse::Decoded {
                    target,
                    buffer: samples,
                    channels,
                    position,
                }
            }
        };

        if responses.send(response).is_err() {
            break;
        }
    }
    trace!(worker = id, %role, "codec worker exiting");
}

// =============================================================================
// Worker Unit
// =============================================================================

struct WorkerUnit {
    id: u64,
    requests: Sender<CodecRequest>,
    responses: mpsc::UnboundedReceiver<CodecResponse>,
    /// Detached on drop; the thread exits when its request channel closes
    _thread: JoinHandle<()>,
}

// =============================================================================
// Pool
// =============================================================================

/// Bounded pool of codec worker units of one role
pub struct CodecWorkerPool {
    role: WorkerRole,
    factory: Arc<dyn CodecFactory>,
    max_workers: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerUnit>>,
    live: AtomicUsize,
    next_id: AtomicU64,
}

impl CodecWorkerPool {
    /// Create an empty pool; units are spawned on demand up to `max_workers`
    pub fn new(role: WorkerRole, factory: Arc<dyn CodecFactory>, max_workers: usize) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        Arc::new(Self {
            role,
            factory,
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Units that currently exist, busy or idle
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Units currently lent out
    pub fn busy_workers(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Borrow a unit, waiting while `max_workers` units are busy
    ///
    /// Every response except the reset acknowledgment is forwarded to
    /// `downstream`; the channel closes once the unit is recycled or retired.
    pub async fn borrow(
        self: &Arc<Self>,
        downstream: mpsc::UnboundedSender<CodecResponse>,
    ) -> Result<BorrowedWorker, VoiceError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VoiceError::Closed("codec worker pool"))?;
        self.lease(permit, downstream)
    }

    /// Borrow a unit only if one is available right now
    pub fn try_borrow(
        self: &Arc<Self>,
        downstream: mpsc::UnboundedSender<CodecResponse>,
    ) -> Result<Option<BorrowedWorker>, VoiceError> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => self.lease(permit, downstream).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn lease(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        downstream: mpsc::UnboundedSender<CodecResponse>,
    ) -> Result<BorrowedWorker, VoiceError> {
        let recycled = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        let unit = match recycled {
            Some(unit) => unit,
            None => self.spawn_unit()?,
        };

        let id = unit.id;
        let requests = unit.requests.clone();
        let retired = Arc::new(AtomicBool::new(false));
        let reset_requested = Arc::new(AtomicBool::new(false));
        let (completion_tx, completion_rx) = oneshot::channel();

        tokio::spawn(forward_responses(
            self.clone(),
            unit,
            permit,
            downstream,
            reset_requested.clone(),
            retired.clone(),
            completion_tx,
        ));

        trace!(worker = id, role = %self.role, "codec worker borrowed");
        Ok(BorrowedWorker {
            id,
            role: self.role,
            requests,
            retired,
            reset_requested,
            completion: Some(completion_rx),
        })
    }

    fn spawn_unit(&self) -> Result<WorkerUnit, VoiceError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let role = self.role;
        let factory = self.factory.clone();

        let thread = std::thread::Builder::new()
            .name(format!("codec-{}-{}", role, id))
            .spawn(move || run_worker(id, role, factory, request_rx, response_tx))
            .map_err(|e| VoiceError::Codec(format!("failed to spawn codec worker: {}", e)))?;

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(worker = id, %role, live, "spawned codec worker");
        Ok(WorkerUnit {
            id,
            requests: request_tx,
            responses: response_rx,
            _thread: thread,
        })
    }

    fn recycle(&self, unit: WorkerUnit) {
        trace!(worker = unit.id, role = %self.role, "codec worker recycled");
        match self.idle.lock() {
            Ok(mut idle) => idle.push(unit),
            Err(poisoned) => poisoned.into_inner().push(unit),
        }
    }

    fn retire(&self, unit: WorkerUnit, reason: &VoiceError) {
        let live = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        warn!(worker = unit.id, role = %self.role, live, error = %reason, "codec worker retired");
    }
}

/// Drain one lease's responses until the unit is recycled or retired
async fn forward_responses(
    pool: Arc<CodecWorkerPool>,
    mut unit: WorkerUnit,
    permit: OwnedSemaphorePermit,
    downstream: mpsc::UnboundedSender<CodecResponse>,
    reset_requested: Arc<AtomicBool>,
    retired: Arc<AtomicBool>,
    completion: oneshot::Sender<Result<(), VoiceError>>,
) {
    let outcome = loop {
        let Some(response) = unit.responses.recv().await else {
            break Err(VoiceError::Closed("codec worker"));
        };

        if let Err(e) = response.validate(pool.role) {
            error!(worker = unit.id, role = %pool.role, error = %e, "malformed codec response");
            break Err(e.into());
        }

        if response.is_reset_ack() {
            if reset_requested.load(Ordering::SeqCst) {
                break Ok(());
            }
            error!(worker = unit.id, "reset acknowledged without a reset request");
            break Err(VoiceError::Protocol(
                "unsolicited reset acknowledgment".into(),
            ));
        }

        // A gone consumer still needs the unit drained up to its reset ack
        let _ = downstream.send(response);
    };

    match &outcome {
        Ok(()) => pool.recycle(unit),
        Err(reason) => {
            retired.store(true, Ordering::SeqCst);
            pool.retire(unit, reason);
        }
    }
    drop(downstream);
    drop(permit);
    let _ = completion.send(outcome);
}

// =============================================================================
// Borrowed Worker
// =============================================================================

/// Exclusive use of one worker unit
///
/// Dropping without [`BorrowedWorker::finish`] still posts the reset, so the
/// unit is recycled in the background.
pub struct BorrowedWorker {
    id: u64,
    role: WorkerRole,
    requests: Sender<CodecRequest>,
    retired: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
    completion: Option<oneshot::Receiver<Result<(), VoiceError>>>,
}

impl BorrowedWorker {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Post an encode (encoder units) or decode (decoder units) request
    pub fn post(&self, request: CodecRequest) -> Result<(), VoiceError> {
        if self.reset_requested.load(Ordering::SeqCst) || self.retired.load(Ordering::SeqCst) {
            return Err(VoiceError::Closed("codec worker"));
        }

        let fits = matches!(
            (&request, self.role),
            (CodecRequest::Encode { .. }, WorkerRole::Encoder)
                | (CodecRequest::Decode { .. }, WorkerRole::Decoder)
        );
        if !fits {
            return Err(VoiceError::Protocol(format!(
                "{} posted to an {} worker",
                request.action(),
                self.role
            )));
        }

        self.requests
            .send(request)
            .map_err(|_| VoiceError::Closed("codec worker"))
    }

    /// Reset the unit and wait until it is back in the pool
    ///
    /// Every response to earlier requests has been forwarded when this returns.
    pub async fn finish(mut self) -> Result<(), VoiceError> {
        self.request_reset();
        match self.completion.take() {
            Some(completion) => completion
                .await
                .unwrap_or(Err(VoiceError::Closed("codec worker pool"))),
            None => Ok(()),
        }
    }

    fn request_reset(&self) {
        if !self.reset_requested.swap(true, Ordering::SeqCst) {
            let _ = self.requests.send(CodecRequest::Reset);
        }
    }
}

impl Drop for BorrowedWorker {
    fn drop(&mut self) {
        self.request_reset();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parlor_common::voice::VoiceTarget;

    use crate::voice::testing::FakeCodecFactory;

    fn encode(position: u64) -> CodecRequest {
        CodecRequest::Encode {
            codec: Codec::Opus,
            target: VoiceTarget::Normal,
            buffer: vec![0.25; FRAME_LEN],
            channels: 1,
            bitrate: 32000,
            position,
        }
    }

    fn decode(position: u64) -> CodecRequest {
        CodecRequest::Decode {
            codec: Codec::Opus,
            buffer: Some(vec![7]),
            target: VoiceTarget::Normal,
            position,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CodecResponse>) -> Vec<CodecResponse> {
        let mut out = Vec::new();
        while let Ok(response) = rx.try_recv() {
            out.push(response);
        }
        out
    }

    #[tokio::test]
    async fn test_responses_forwarded_before_completion() {
        let factory = FakeCodecFactory::new();
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, factory.clone(), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = pool.borrow(tx).await.unwrap();
        for position in 0..3 {
            worker.post(encode(position)).unwrap();
        }
        worker.finish().await.unwrap();

        let responses = drain(&mut rx);
        let positions: Vec<u64> = responses
            .iter()
            .map(|r| match r {
                CodecResponse::Encoded { position, .. } => *position,
                other => panic!("unexpected response {:?}", other),
            })
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);
        // The reset ack is consumed by the pool, and the channel is closed
        assert!(rx.recv().await.is_none());
        assert_eq!(pool.idle_workers(), 1);
        assert_eq!(pool.live_workers(), 1);
    }

    #[tokio::test]
    async fn test_recycled_unit_starts_from_clean_state() {
        let factory = FakeCodecFactory::new();
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, factory.clone(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = pool.borrow(tx).await.unwrap();
        let first_id = first.id();
        first.post(encode(0)).unwrap();
        first.post(encode(1)).unwrap();
        first.finish().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let second = pool.borrow(tx).await.unwrap();
        assert_eq!(second.id(), first_id);
        second.post(encode(0)).unwrap();
        second.finish().await.unwrap();

        match drain(&mut rx).as_slice() {
            [CodecResponse::Encoded { buffer, .. }] => {
                // Frame counter restarted: the codec state was rebuilt
                assert_eq!(buffer[0], 0);
            }
            other => panic!("unexpected responses {:?}", other),
        }
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_borrow_waits_at_capacity() {
        let factory = FakeCodecFactory::new();
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, factory, 2);

        let (tx, _rx_a) = mpsc::unbounded_channel();
        let a = pool.borrow(tx).await.unwrap();
        let (tx, _rx_b) = mpsc::unbounded_channel();
        let _b = pool.borrow(tx).await.unwrap();

        assert_eq!(pool.busy_workers(), 2);

        let (tx, _rx_c) = mpsc::unbounded_channel();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.borrow(tx)).await;
        assert!(blocked.is_err(), "third borrow must wait while two units are busy");
        let (tx, _rx_c) = mpsc::unbounded_channel();
        assert!(pool.try_borrow(tx).unwrap().is_none());

        a.finish().await.unwrap();
        let (tx, _rx_c) = mpsc::unbounded_channel();
        let c = tokio::time::timeout(Duration::from_secs(5), pool.borrow(tx))
            .await
            .expect("borrow after recycle")
            .unwrap();
        assert_eq!(pool.live_workers(), 2);
        drop(c);
    }

    #[tokio::test]
    async fn test_malformed_response_retires_unit() {
        let factory = FakeCodecFactory::new();
        factory.set_broken(true);
        let pool = CodecWorkerPool::new(WorkerRole::Decoder, factory.clone(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = pool.borrow(tx).await.unwrap();
        let broken_id = worker.id();
        worker.post(decode(0)).unwrap();

        let result = worker.finish().await;
        assert!(matches!(result, Err(VoiceError::Protocol(_))));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.idle_workers(), 0);

        // The pool keeps working with a fresh unit
        factory.set_broken(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = pool.borrow(tx).await.unwrap();
        assert_ne!(worker.id(), broken_id);
        worker.post(decode(1)).unwrap();
        worker.finish().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_reset_ack_retires_unit() {
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, FakeCodecFactory::new(), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = pool.borrow(tx).await.unwrap();
        let stray_id = worker.id();

        // Bypass `post`, which refuses resets, so the unit acks one nobody asked for
        worker.requests.send(CodecRequest::Reset).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !worker.retired.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("unit retired");

        assert!(matches!(
            worker.post(encode(0)),
            Err(VoiceError::Closed(_))
        ));
        assert!(matches!(
            worker.finish().await,
            Err(VoiceError::Protocol(_))
        ));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.busy_workers(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let fresh = pool.borrow(tx).await.unwrap();
        assert_ne!(fresh.id(), stray_id);
        fresh.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_crashed_unit_is_retired() {
        let factory = FakeCodecFactory::new();
        factory.set_panic_on_encode(true);
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, factory, 1);

        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = pool.borrow(tx).await.unwrap();
        worker.post(encode(0)).unwrap();
        assert!(matches!(
            worker.finish().await,
            Err(VoiceError::Closed(_))
        ));
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_request_kind_must_match_role() {
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, FakeCodecFactory::new(), 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = pool.borrow(tx).await.unwrap();

        assert!(matches!(
            worker.post(decode(0)),
            Err(VoiceError::Protocol(_))
        ));
        assert!(matches!(
            worker.post(CodecRequest::Reset),
            Err(VoiceError::Protocol(_))
        ));
        worker.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_borrow_is_recycled() {
        let pool = CodecWorkerPool::new(WorkerRole::Encoder, FakeCodecFactory::new(), 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = pool.borrow(tx).await.unwrap();
        worker.post(encode(0)).unwrap();
        drop(worker);

        let (tx, _rx) = mpsc::unbounded_channel();
        let again = tokio::time::timeout(Duration::from_secs(5), pool.borrow(tx))
            .await
            .expect("unit recycled after drop")
            .unwrap();
        assert_eq!(pool.live_workers(), 1);
        again.finish().await.unwrap();
    }
}
