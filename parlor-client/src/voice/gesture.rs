//! User gesture gate
//!
//! Platforms with autoplay restrictions refuse to start audio until the user
//! has interacted with the application. The gate is a one-shot latch flipped by
//! the first qualifying input; listeners registered before that moment run
//! exactly once and are then dropped.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

type GestureListener = Box<dyn FnOnce() + Send>;

/// One-shot latch for the first user gesture
#[derive(Default)]
pub struct GestureGate {
    open: AtomicBool,
    listeners: Mutex<Vec<GestureListener>>,
}

impl GestureGate {
    /// Create a closed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a user gesture has been observed
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Record a user gesture
    ///
    /// Returns `true` only for the call that opened the gate. Pending listeners
    /// are removed and run once, outside the lock.
    pub fn trigger(&self) -> bool {
        if self.open.swap(true, Ordering::SeqCst) {
            return false;
        }

        let listeners = match self.listeners.lock() {
            Ok(mut listeners) => std::mem::take(&mut *listeners),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        tracing::debug!(listeners = listeners.len(), "first user gesture");
        for listener in listeners {
            listener();
        }
        true
    }

    /// Run `listener` on the first gesture, or right away if it already happened
    pub fn on_open(&self, listener: impl FnOnce() + Send + 'static) {
        if self.is_open() {
            listener();
            return;
        }

        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the lock so a concurrent trigger can't strand the listener
        if self.is_open() {
            drop(listeners);
            listener();
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Number of listeners still waiting for the first gesture
    pub fn pending_listeners(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}
