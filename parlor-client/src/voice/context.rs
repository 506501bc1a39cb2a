//! Shared audio device session
//!
//! A process owns exactly one live audio device session. The manager creates
//! it on first demand, rebuilds it when it was closed (by us or by the
//! platform), and serializes every state transition. Resuming a suspended
//! session is retried with exponential backoff, and resumes triggered by
//! internal logic wait for the first user gesture on platforms with autoplay
//! restrictions.
//!
//! State graph:
//! ```text
//! Uninitialized -> Creating -> Running <-> Suspended
//!                     |           \          /
//!                     |            -> Closed <-
//!                     +-> Suspended (platform started it suspended)
//! Closed -> Creating (next get_or_create)
//! ```

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceContextConfig, RetrySettings};
use crate::error::VoiceError;

use super::gesture::GestureGate;
use super::inbound::PlaybackSink;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Creating,
    Running,
    Suspended,
    Closed,
}

impl ContextState {
    /// Whether the state graph allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Uninitialized, Creating)
                | (Creating, Running)
                | (Creating, Suspended)
                | (Creating, Uninitialized)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Closed)
                | (Suspended, Closed)
                | (Closed, Creating)
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Creating => "creating",
            ContextState::Running => "running",
            ContextState::Suspended => "suspended",
            ContextState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Platform Seams
// =============================================================================

/// A live platform audio session
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Sample rate the session actually runs at
    fn sample_rate(&self) -> u32;

    /// State as the platform sees it (`Running`, `Suspended` or `Closed`)
    fn state(&self) -> ContextState;

    async fn resume(&self) -> Result<(), VoiceError>;

    async fn suspend(&self) -> Result<(), VoiceError>;

    async fn close(&self) -> Result<(), VoiceError>;

    /// Sink that remote voice streams are mixed into
    fn playback(&self) -> Arc<dyn PlaybackSink>;
}

/// Factory for platform audio sessions
#[async_trait]
pub trait AudioPlatform: Send + Sync {
    /// Open a new session
    ///
    /// Returns [`VoiceError::Unsupported`] when the platform has no audio at all.
    async fn create(
        &self,
        config: &DeviceContextConfig,
    ) -> Result<Box<dyn AudioBackend>, VoiceError>;
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff for resume retries
///
/// At most `max_attempts` platform resume calls are made. Failed attempt `n`
/// (1-based) is followed by a backoff of `base_delay * 2^(n-1)`; there is no
/// attempt after the last backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Whether attempt `attempt` (1-based) may be made at all
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Backoff after failed attempt `attempt`, or `None` past the ceiling
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if !self.allows_attempt(attempt) {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }

    /// Every backoff in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let policy = *self;
        (1..=policy.max_attempts).filter_map(move |attempt| policy.backoff_after(attempt))
    }

    /// Total time spent waiting if every attempt fails
    pub fn total_backoff(&self) -> Duration {
        self.delays().sum()
    }
}

// =============================================================================
// Device Context
// =============================================================================

/// Handle to the live audio device session
pub struct DeviceContext {
    generation: u64,
    config: DeviceContextConfig,
    backend: Box<dyn AudioBackend>,
    state: Mutex<ContextState>,
    ready_fired: AtomicBool,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("sample_rate", &self.sample_rate())
            .finish()
    }
}

impl DeviceContext {
    fn new(
        generation: u64,
        config: DeviceContextConfig,
        backend: Box<dyn AudioBackend>,
        initial: ContextState,
    ) -> Self {
        Self {
            generation,
            config,
            backend,
            state: Mutex::new(initial),
            ready_fired: AtomicBool::new(false),
        }
    }

    /// Increments every time the session is rebuilt
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Configuration the session was created with
    pub fn config(&self) -> &DeviceContextConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.backend.sample_rate()
    }

    /// Where decoded remote audio is played
    pub fn playback(&self) -> Arc<dyn PlaybackSink> {
        self.backend.playback()
    }

    /// Current state; a platform-side close is picked up here
    pub fn state(&self) -> ContextState {
        let mut state = lock(&self.state);
        if *state != ContextState::Closed && self.backend.state() == ContextState::Closed {
            *state = ContextState::Closed;
        }
        *state
    }

    fn set_state(&self, next: ContextState) -> Result<ContextState, VoiceError> {
        let mut state = lock(&self.state);
        let previous = *state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(VoiceError::InvalidState(format!(
                "{} -> {} is not a valid transition",
                previous, next
            )));
        }
        *state = next;
        debug!(generation = self.generation, from = %previous, to = %next, "device context transition");
        Ok(previous)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Subscribers
// =============================================================================

/// Device context transitions that can be observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// The session reached `Running` for the first time
    Ready,
    /// The session went from `Running` to `Suspended`
    Suspend,
    /// The session went from `Suspended` back to `Running`
    Resume,
}

/// Callback invoked on a [`ContextEvent`]
pub type ContextListener = Arc<dyn Fn(&Arc<DeviceContext>) + Send + Sync>;

/// Handle returned by [`DeviceContextManager::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(SubscriptionId, ContextEvent, ContextListener)>,
}

/// Run listeners one by one; a panicking listener is logged and skipped
fn dispatch(event: ContextEvent, listeners: &[ContextListener], ctx: &Arc<DeviceContext>) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(ctx))).is_err() {
            warn!(?event, generation = ctx.generation(), "device context subscriber panicked");
        }
    }
}

/// Clears the `creating` flag even if the creating future is dropped
struct CreatingGuard<'a>(&'a AtomicBool);

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Manager
// =============================================================================

static GLOBAL_MANAGER: OnceCell<DeviceContextManager> = OnceCell::new();

/// Owner of the single shared audio device session
pub struct DeviceContextManager {
    platform: Arc<dyn AudioPlatform>,
    retry: RetryPolicy,
    /// Serializes session creation
    creation: AsyncMutex<()>,
    /// Serializes resume/suspend/close
    transitions: AsyncMutex<()>,
    /// Most recent session; may be `Closed`, in which case it is rebuilt on demand
    current: Mutex<Option<Arc<DeviceContext>>>,
    creating: AtomicBool,
    generation: AtomicU64,
    subscribers: Mutex<Subscribers>,
    gesture: GestureGate,
    resume_deferred: AtomicBool,
}

impl DeviceContextManager {
    pub fn new(platform: Arc<dyn AudioPlatform>, retry: RetryPolicy) -> Self {
        Self {
            platform,
            retry,
            creation: AsyncMutex::new(()),
            transitions: AsyncMutex::new(()),
            current: Mutex::new(None),
            creating: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            subscribers: Mutex::new(Subscribers::default()),
            gesture: GestureGate::new(),
            resume_deferred: AtomicBool::new(false),
        }
    }

    /// Install the process-wide manager
    ///
    /// Fails if one was already installed.
    pub fn install_global(manager: DeviceContextManager) -> Result<&'static Self, VoiceError> {
        GLOBAL_MANAGER
            .set(manager)
            .map_err(|_| VoiceError::InvalidState("device context manager already installed".into()))?;
        GLOBAL_MANAGER
            .get()
            .ok_or_else(|| VoiceError::InvalidState("device context manager missing".into()))
    }

    /// The process-wide manager, if installed
    pub fn global() -> Option<&'static Self> {
        GLOBAL_MANAGER.get()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Gesture latch; hosts call [`Self::user_gesture`] rather than triggering it directly
    pub fn gesture(&self) -> &GestureGate {
        &self.gesture
    }

    /// Manager-level view of the session state
    pub fn state(&self) -> ContextState {
        if self.creating.load(Ordering::SeqCst) {
            return ContextState::Creating;
        }
        lock(&self.current)
            .as_ref()
            .map(|ctx| ctx.state())
            .unwrap_or(ContextState::Uninitialized)
    }

    /// The live session, if there is one
    pub fn current(&self) -> Option<Arc<DeviceContext>> {
        lock(&self.current)
            .as_ref()
            .filter(|ctx| ctx.state() != ContextState::Closed)
            .cloned()
    }

    /// Return the live session, creating it if absent or closed
    ///
    /// Concurrent callers wait on the same creation and receive the same
    /// session. If a session is already live, `config` is ignored.
    pub async fn get_or_create(
        &self,
        config: &DeviceContextConfig,
    ) -> Result<Arc<DeviceContext>, VoiceError> {
        if let Some(ctx) = self.current() {
            return Ok(ctx);
        }

        let _creation = self.creation.lock().await;
        if let Some(ctx) = self.current() {
            return Ok(ctx);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let backend = {
            self.creating.store(true, Ordering::SeqCst);
            let _guard = CreatingGuard(&self.creating);
            debug!(generation, sample_rate = config.sample_rate, "creating device context");
            match self.platform.create(config).await {
                Ok(backend) => backend,
                Err(e) => {
                    error!(generation, error = %e, "device context creation failed");
                    return Err(e);
                }
            }
        };

        let initial = match backend.state() {
            state @ (ContextState::Running | ContextState::Suspended) => state,
            other => {
                return Err(VoiceError::Device(format!(
                    "platform returned a session in state {}",
                    other
                )));
            }
        };

        let ctx = Arc::new(DeviceContext::new(
            generation,
            config.clone(),
            backend,
            initial,
        ));
        *lock(&self.current) = Some(ctx.clone());
        info!(
            generation,
            sample_rate = ctx.sample_rate(),
            state = %initial,
            "device context created"
        );

        if initial == ContextState::Running {
            self.mark_ready(&ctx);
        }
        Ok(ctx)
    }

    /// Resume a suspended session, retrying with backoff
    ///
    /// Resuming a running session succeeds without touching the platform.
    /// When every attempt fails the session stays `Suspended` and
    /// [`VoiceError::ResumeExhausted`] is returned; a later call starts over.
    /// The transition lock is released during backoff, so a `close` or
    /// `suspend` issued meanwhile is not held up; a close ends the retries
    /// with [`VoiceError::Closed`].
    pub async fn resume(&self) -> Result<Arc<DeviceContext>, VoiceError> {
        let ctx = {
            let _transition = self.transitions.lock().await;
            let ctx = self
                .current()
                .ok_or_else(|| VoiceError::InvalidState("no device context to resume".into()))?;
            match ctx.state() {
                ContextState::Running => return Ok(ctx),
                ContextState::Suspended => {}
                other => {
                    return Err(VoiceError::InvalidState(format!(
                        "cannot resume from {}",
                        other
                    )));
                }
            }
            ctx
        };

        let mut waited = Duration::ZERO;
        let mut last_error = None;
        let mut attempt = 1;
        while self.retry.allows_attempt(attempt) {
            {
                let _transition = self.transitions.lock().await;
                match ctx.state() {
                    ContextState::Running => return Ok(ctx),
                    ContextState::Closed => return Err(VoiceError::Closed("device context")),
                    _ => {}
                }
                match ctx.backend.resume().await {
                    Ok(()) => return self.finish_resume(ctx),
                    Err(e @ VoiceError::Unsupported(_)) => return Err(e),
                    Err(e) => last_error = Some(e),
                }
            }

            let Some(delay) = self.retry.backoff_after(attempt) else {
                break;
            };
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = ?last_error,
                "device context resume failed"
            );
            tokio::time::sleep(delay).await;
            waited += delay;
            attempt += 1;
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt allowed".to_string());
        error!(
            attempts = self.retry.max_attempts,
            error = %last_error,
            "giving up on resuming device context"
        );
        Err(VoiceError::ResumeExhausted {
            attempts: self.retry.max_attempts,
            elapsed: waited,
            last_error,
        })
    }

    fn finish_resume(&self, ctx: Arc<DeviceContext>) -> Result<Arc<DeviceContext>, VoiceError> {
        ctx.set_state(ContextState::Running)?;
        info!(generation = ctx.generation(), "device context resumed");
        self.notify(ContextEvent::Resume, &ctx);
        self.mark_ready(&ctx);
        Ok(ctx)
    }

    /// Resume requested by internal logic rather than the user
    ///
    /// Before the first user gesture the request is remembered and issued by
    /// [`Self::user_gesture`]; `Ok(None)` means it was deferred.
    pub async fn auto_resume(&self) -> Result<Option<Arc<DeviceContext>>, VoiceError> {
        if !self.gesture.is_open() {
            self.resume_deferred.store(true, Ordering::SeqCst);
            // The gesture may have landed between the check and the store
            if !(self.gesture.is_open() && self.resume_deferred.swap(false, Ordering::SeqCst)) {
                debug!("deferring device context resume until the first user gesture");
                return Ok(None);
            }
        }
        self.resume().await.map(Some)
    }

    /// Record a qualifying user input
    ///
    /// The first call opens the gesture gate and issues any deferred resume.
    pub async fn user_gesture(&self) -> Result<Option<Arc<DeviceContext>>, VoiceError> {
        if !self.gesture.trigger() {
            return Ok(None);
        }
        if self.resume_deferred.swap(false, Ordering::SeqCst) {
            return self.resume().await.map(Some);
        }
        Ok(None)
    }

    /// Suspend a running session
    pub async fn suspend(&self) -> Result<(), VoiceError> {
        let _transition = self.transitions.lock().await;
        let Some(ctx) = self.current() else {
            return Err(VoiceError::InvalidState("no device context to suspend".into()));
        };
        if ctx.state() == ContextState::Suspended {
            return Ok(());
        }

        ctx.backend.suspend().await?;
        ctx.set_state(ContextState::Suspended)?;
        info!(generation = ctx.generation(), "device context suspended");
        self.notify(ContextEvent::Suspend, &ctx);
        Ok(())
    }

    /// The platform suspended the session on its own (e.g. an incoming call)
    ///
    /// Suspend subscribers are notified and a gesture-gated resume is requested.
    pub async fn handle_interruption(&self) -> Result<Option<Arc<DeviceContext>>, VoiceError> {
        {
            let _transition = self.transitions.lock().await;
            let Some(ctx) = self.current() else {
                return Ok(None);
            };
            if ctx.state() != ContextState::Running {
                return Ok(None);
            }
            ctx.set_state(ContextState::Suspended)?;
            info!(generation = ctx.generation(), "device context interrupted by platform");
            self.notify(ContextEvent::Suspend, &ctx);
        }
        self.auto_resume().await
    }

    /// Close the session; the next [`Self::get_or_create`] builds a new one
    pub async fn close(&self) -> Result<(), VoiceError> {
        let _transition = self.transitions.lock().await;
        let Some(ctx) = self.current() else {
            return Ok(());
        };

        let result = ctx.backend.close().await;
        ctx.set_state(ContextState::Closed)?;
        info!(generation = ctx.generation(), "device context closed");
        result
    }

    /// Observe a transition
    ///
    /// A `Ready` subscription made while the session is running fires
    /// immediately with the current session.
    pub fn subscribe(
        &self,
        event: ContextEvent,
        listener: impl Fn(&Arc<DeviceContext>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let listener: ContextListener = Arc::new(listener);
        let id = {
            let mut subscribers = lock(&self.subscribers);
            subscribers.next_id += 1;
            let id = SubscriptionId(subscribers.next_id);
            subscribers.entries.push((id, event, listener.clone()));
            id
        };

        if event == ContextEvent::Ready
            && let Some(ctx) = self.current()
            && ctx.state() == ContextState::Running
        {
            dispatch(event, &[listener], &ctx);
        }
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.entries.len();
        subscribers.entries.retain(|(entry, _, _)| *entry != id);
        subscribers.entries.len() != before
    }

    fn mark_ready(&self, ctx: &Arc<DeviceContext>) {
        if !ctx.ready_fired.swap(true, Ordering::SeqCst) {
            self.notify(ContextEvent::Ready, ctx);
        }
    }

    fn notify(&self, event: ContextEvent, ctx: &Arc<DeviceContext>) {
        let listeners: Vec<ContextListener> = lock(&self.subscribers)
            .entries
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        dispatch(event, &listeners, ctx);
    }
}

// =============================================================================
// Tests
// =============================================================================
