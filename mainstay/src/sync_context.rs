//! The per-task post/send sink.
//!
//! Installed around every execution segment of a joinable task, so code
//! that captures [`SyncContext::current`] and calls it later, from any
//! thread and even after the task completed, keeps the task identity it was
//! captured under. That is what lets a "posted message" survive a `run`
//! boundary: an active task routes the callback through its own main-thread
//! queue (subject to admission), a completed one falls back to the host's
//! sink.

use crate::context::ambient;
use crate::task::core::TaskCore;
use crate::task::queue::{Job, Work};
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::thread;

/// A capturable handle to one task's post/send sink.
#[derive(Clone)]
pub struct SyncContext {
    core: Arc<TaskCore>,

    /// Captured at install time: segments executing on the main thread hand
    /// posts to the main-thread queue, pool segments hand them to the pool.
    main_affinitized: bool,
}

impl SyncContext {
    /// The sink installed for the current execution segment, if any.
    pub fn current() -> Option<SyncContext> {
        ambient::current_sync_context()
    }

    pub(crate) fn for_task(core: Arc<TaskCore>) -> Self {
        let main_affinitized = core.ctx.is_main_thread();
        Self {
            core,
            main_affinitized,
        }
    }

    /// Schedules `f` asynchronously under this task's identity.
    ///
    /// Main-affinitized contexts queue onto the task's main-thread work
    /// (falling back to the host sink once the task has completed); pool
    /// contexts hand the callback straight to the pool.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ctx = self.core.ctx.clone();
        if !self.main_affinitized {
            ctx.spawn_pool(Box::new(f));
            return;
        }

        let rejected = ctx.enqueue_main(Job::run(self.core.clone(), Box::new(f)));
        if let Some(job) = rejected {
            // The task completed; the message still belongs to the main
            // thread, so hand it to the host loop.
            if let Work::Run(f) = job.work {
                ctx.post_to_host_or_pool(f);
            }
        }
    }

    /// Runs `f` on the main thread and returns its result, blocking the
    /// caller until it has run. Called on the main thread, it runs inline.
    ///
    /// The blocked main thread of a `run` picks the callback up through its
    /// admission set, possibly after unrelated admitted work. If nobody can
    /// pump the main thread, this blocks forever; that is the
    /// synchronous-send contract, and callers are expected to arrange
    /// joining.
    ///
    /// Panics from `f` resume on the caller.
    pub fn send<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.core.ctx.clone();
        // On the main thread, or on a headless context where main-thread
        // affinity is moot, deliver inline.
        if ctx.is_main_thread() || !ctx.has_main_post() {
            return f();
        }

        struct Latch<R> {
            slot: Mutex<Option<thread::Result<R>>>,
            done: Condvar,
        }
        let latch = Arc::new(Latch {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });

        let delivery = {
            let latch = latch.clone();
            Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(f));
                *latch.slot.lock() = Some(result);
                latch.done.notify_all();
            })
        };

        let rejected = ctx.enqueue_main(Job::run(self.core.clone(), delivery));
        if let Some(job) = rejected
            && let Work::Run(f) = job.work
        {
            ctx.post_to_host_or_pool(f);
        }

        let mut slot = latch.slot.lock();
        while slot.is_none() {
            latch.done.wait(&mut slot);
        }
        match slot.take().expect("latch signalled with a result") {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// The id of the task this context was captured under.
    pub fn owner(&self) -> crate::task::Id {
        self.core.id
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("owner", &self.core.id)
            .field("main_affinitized", &self.main_affinitized)
            .finish()
    }
}
