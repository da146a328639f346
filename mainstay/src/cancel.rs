//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a cloneable flag with callback registrations.
//! Callbacks run exactly once, on the thread that calls
//! [`cancel`](CancellationToken::cancel) (or immediately on the registering
//! thread if the token is already cancelled). Registrations are slot-keyed
//! and removed when their guard drops.

use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Slab<Callback>>,
}

/// A cloneable cancellation flag. All clones observe the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token and runs every registered callback.
    ///
    /// Idempotent: only the first call runs callbacks.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drain under the lock, invoke outside it: callbacks are free to
        // register against (or clone) this token.
        let drained: Vec<Callback> = {
            let mut slots = self.inner.callbacks.lock();
            let drained = slots.drain().collect();
            drained
        };
        for callback in drained {
            callback();
        }
    }

    /// Registers a callback to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately on
    /// the current thread. Dropping the returned registration removes the
    /// callback without running it.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancelled() {
            callback();
            return CancelRegistration { slot: None };
        }
        let key = {
            let mut slots = self.inner.callbacks.lock();
            // A cancel may have raced in between the check and the lock; the
            // drain in `cancel` holds the same lock, so re-check under it.
            if self.is_cancelled() {
                drop(slots);
                callback();
                return CancelRegistration { slot: None };
            }
            slots.insert(Box::new(callback))
        };
        CancelRegistration {
            slot: Some((Arc::downgrade(&self.inner), key)),
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Keeps a cancellation callback registered; removes it on drop.
#[must_use = "dropping the registration removes the callback"]
pub struct CancelRegistration {
    slot: Option<(Weak<CancelInner>, usize)>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some((inner, key)) = self.slot.take()
            && let Some(inner) = inner.upgrade()
        {
            let mut slots = inner.callbacks.lock();
            if slots.contains(key) {
                slots.remove(key);
            }
        }
    }
}
