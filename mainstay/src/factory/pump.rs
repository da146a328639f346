//! The re-entrant pump and the synchronous wait paths.
//!
//! A `run`/`join` on the main thread parks here and lends the thread to the
//! admitted continuations of its dependency closure: pop one job under the
//! state lock, execute it on this stack outside the lock, repeat. Nested
//! blockers push frames; the innermost one runs the loop and its admission
//! set is the union over the stack, so work relevant to an outer frame
//! stays relevant in the inner one.
//!
//! A blocked worker thread cannot run main-thread work; it parks on the
//! condvar and drains only its own task's rerouted pool jobs, which is what
//! keeps a worker from deadlocking against its own continuation.

use crate::cancel::CancellationToken;
use crate::context::ContextInner;
use crate::context::ambient;
use crate::task::JoinError;
use crate::task::core::TaskCore;
use crate::task::queue::{Job, Work};
use crate::utils::ScopeGuard;
use std::sync::Arc;
use std::time::Duration;

/// How long a blocked thread parks before re-checking on its own. Wake-ups
/// normally arrive through the condvar; the timeout only covers signal
/// races.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// Executes one dequeued job on the calling thread.
pub(crate) fn execute(job: Job) {
    let Job {
        owner,
        work,
        switch,
        transition,
    } = job;

    // A grant must be claimed before it runs; losing the claim means the
    // request was cancelled and this job is a tombstone.
    let switch_pending = match &switch {
        Some(switch) => match switch.claim_grant() {
            Ok(pending) => pending,
            Err(_tombstoned) => return,
        },
        None => None,
    };

    tracing::trace!(task = owner.id.as_u64(), "dispatching continuation");
    match work {
        Work::Poll => owner.poll(),
        Work::Run(f) => {
            let _ambient = ambient::enter_task(&owner);
            f();
        }
    }

    if let Some(pending) = switch_pending {
        pending.finish(false);
    }
    if let Some(pending) = transition {
        pending.finish(false);
    }
}

/// Blocks the calling thread until `core` completes.
///
/// Main thread: enters the re-entrant pump. Worker thread: parks, draining
/// `core`'s own rerouted pool work. Returns `Err(JoinError::Cancelled)`
/// when the wait (not the task) is cancelled; the task keeps running.
pub(crate) fn block_on_core(
    ctx: &Arc<ContextInner>,
    core: &Arc<TaskCore>,
    cancel: Option<&CancellationToken>,
) -> Result<(), JoinError> {
    if core.is_completed() {
        return Ok(());
    }

    // A firing token must interrupt the park promptly.
    let _cancel_wakeup = cancel.map(|token| {
        let ctx = ctx.clone();
        token.on_cancel(move || {
            ctx.wake.notify_all();
        })
    });

    if ctx.is_main_thread() {
        block_on_main(ctx, core, cancel)
    } else {
        block_on_worker(ctx, core, cancel)
    }
}

fn block_on_main(
    ctx: &Arc<ContextInner>,
    core: &Arc<TaskCore>,
    cancel: Option<&CancellationToken>,
) -> Result<(), JoinError> {
    ctx.state.lock().push_main_blocker(core.id);
    let _frame = {
        let ctx = ctx.clone();
        let root = core.id;
        ScopeGuard::new(move || {
            ctx.state.lock().pop_main_blocker(root);
            ctx.wake.notify_all();
        })
    };

    loop {
        if core.is_completed() {
            return Ok(());
        }
        if let Some(token) = cancel
            && token.is_cancelled()
        {
            return Err(JoinError::Cancelled);
        }

        let job = {
            let mut st = ctx.state.lock();
            match st.next_admissible_main_job() {
                Some(job) => Some(job),
                None => {
                    if !core.is_completed() {
                        ctx.wake.wait_for(&mut st, PARK_TIMEOUT);
                    }
                    None
                }
            }
        };
        if let Some(job) = job {
            execute(job);
        }
    }
}

fn block_on_worker(
    ctx: &Arc<ContextInner>,
    core: &Arc<TaskCore>,
    cancel: Option<&CancellationToken>,
) -> Result<(), JoinError> {
    ctx.state.lock().set_worker_blocked(core.id, true);
    let _unblock = {
        let ctx = ctx.clone();
        let root = core.id;
        ScopeGuard::new(move || ctx.state.lock().set_worker_blocked(root, false))
    };

    loop {
        if core.is_completed() {
            return Ok(());
        }
        if let Some(token) = cancel
            && token.is_cancelled()
        {
            return Err(JoinError::Cancelled);
        }

        let job = {
            let mut st = ctx.state.lock();
            match st.pop_pool_job(core.id) {
                Some(job) => Some(job),
                None => {
                    if !core.is_completed() {
                        ctx.wake.wait_for(&mut st, PARK_TIMEOUT);
                    }
                    None
                }
            }
        };
        if let Some(job) = job {
            execute(job);
        }
    }
}
