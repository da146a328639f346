//! Transition event hooks.
//!
//! Hosts register listeners to observe joinable tasks (re)acquiring the main
//! thread. `on_transitioning_to_main_thread` fires when a main-thread
//! continuation is requested from another thread; exactly one
//! `on_transitioned_to_main_thread` follows, either after the continuation
//! runs on the main thread, or when the request is cancelled, or when the
//! undelivered job is discarded (reported as cancelled). Nothing fires when
//! execution merely stays on the main thread, or when it leaves it.

use crate::context::ContextInner;
use crate::task::Id;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Observer of main-thread transitions.
///
/// Listener panics are not swallowed; they propagate to whichever caller
/// triggered the transition.
pub trait TransitionListener: Send + Sync + 'static {
    /// A main-thread continuation for `task` was requested from another
    /// thread. Runs on the requesting thread.
    fn on_transitioning_to_main_thread(&self, task: Id) {
        let _ = task;
    }

    /// The request above was resolved. Runs on the main thread after the
    /// continuation executes, or on the thread that delivered cancellation.
    fn on_transitioned_to_main_thread(&self, task: Id, cancelled: bool) {
        let _ = (task, cancelled);
    }
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: DashMap<usize, Arc<dyn TransitionListener>>,
    next_key: AtomicUsize,
}

impl ListenerRegistry {
    pub(crate) fn insert(&self, listener: Arc<dyn TransitionListener>) -> usize {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(key, listener);
        key
    }

    pub(crate) fn remove(&self, key: usize) {
        self.listeners.remove(&key);
    }

    pub(crate) fn transitioning(&self, task: Id) {
        for entry in self.listeners.iter() {
            entry.value().on_transitioning_to_main_thread(task);
        }
    }

    pub(crate) fn transitioned(&self, task: Id, cancelled: bool) {
        for entry in self.listeners.iter() {
            entry.value().on_transitioned_to_main_thread(task, cancelled);
        }
    }
}

/// Keeps a [`TransitionListener`] registered; deregisters on drop.
#[must_use = "dropping the registration removes the listener"]
pub struct ListenerRegistration {
    ctx: Arc<ContextInner>,
    key: usize,
}

impl ListenerRegistration {
    pub(crate) fn new(ctx: Arc<ContextInner>, key: usize) -> Self {
        Self { ctx, key }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.ctx.listeners.remove(self.key);
    }
}

/// One requested main-thread transition, not yet balanced.
///
/// Fires `transitioning` on creation. Whoever ends up resolving the request
/// calls [`finish`](Self::finish); if the pending transition is dropped
/// unresolved (the job was discarded), drop reports it as cancelled so the
/// one-for-one balance holds on every path.
pub(crate) struct TransitionPending {
    ctx: Arc<ContextInner>,
    task: Id,
    done: bool,
}

impl TransitionPending {
    pub(crate) fn begin(ctx: Arc<ContextInner>, task: Id) -> Self {
        ctx.listeners.transitioning(task);
        Self {
            ctx,
            task,
            done: false,
        }
    }

    pub(crate) fn finish(mut self, cancelled: bool) {
        self.done = true;
        self.ctx.listeners.transitioned(self.task, cancelled);
    }
}

impl Drop for TransitionPending {
    fn drop(&mut self) {
        if !self.done {
            self.ctx.listeners.transitioned(self.task, true);
        }
    }
}
