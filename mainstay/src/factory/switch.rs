//! The main-thread and pool switch awaitables.
//!
//! A switch to the main thread queues a grant on the ambient task and
//! completes when the pump (or the host loop) polls the task on the main
//! thread. Cancellation claims the pending grant first: the awaiter resumes
//! on a worker thread with a cancellation failure, and the grant left in the
//! queue becomes a tombstone that never runs.

use crate::cancel::{CancelRegistration, CancellationToken};
use crate::context::ambient;
use crate::events::TransitionPending;
use crate::factory::Factory;
use crate::task::core::{Lane, TaskCore};
use crate::task::queue::{Job, Work};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Failure of a single switch await; the enclosing task is free to
/// continue.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchError {
    #[error("switch to the main thread was cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Queued,
    Granted,
    Cancelled,
}

struct SwitchInner {
    phase: Phase,
    /// Transition balance for this request; taken by whichever path
    /// resolves it.
    pending: Option<TransitionPending>,
    /// Awaiter waker, used by the free-floating grant and by cancellation.
    waker: Option<Waker>,
}

/// Shared state of one queued switch request. Referenced by the awaiting
/// future, the queued grant job, and the cancellation registration.
pub(crate) struct SwitchCore {
    task: Arc<TaskCore>,
    /// True when the request was made outside any joinable task and the
    /// owner is a transient free-floating record.
    detached: bool,
    inner: Mutex<SwitchInner>,
}

/// The queued grant was cancelled; the popped job must not run.
pub(crate) struct Tombstoned;

impl SwitchCore {
    fn new(task: Arc<TaskCore>, pending: Option<TransitionPending>, detached: bool) -> Arc<Self> {
        Arc::new(Self {
            task,
            detached,
            inner: Mutex::new(SwitchInner {
                phase: Phase::Queued,
                pending,
                waker: None,
            }),
        })
    }

    pub(crate) fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    fn set_waker(&self, waker: Waker) {
        self.inner.lock().waker = Some(waker);
    }

    /// Claims the grant on the dispatching thread. Returns the transition
    /// balance to resolve after the continuation runs.
    pub(crate) fn claim_grant(&self) -> Result<Option<TransitionPending>, Tombstoned> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Queued => {
                inner.phase = Phase::Granted;
                Ok(inner.pending.take())
            }
            Phase::Granted => Ok(None),
            Phase::Cancelled => Err(Tombstoned),
        }
    }

    /// Wakes a free-floating awaiter after its grant ran on the main
    /// thread.
    pub(crate) fn wake_awaiter(&self) {
        let waker = self.inner.lock().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Claims the request for cancellation. The failure is delivered on a
    /// worker thread, never the main thread.
    fn cancel(self: &Arc<Self>) {
        let (pending, waker) = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Queued {
                return;
            }
            inner.phase = Phase::Cancelled;
            (inner.pending.take(), inner.waker.take())
        };
        if let Some(pending) = pending {
            pending.finish(true);
        }
        if self.detached {
            if let Some(waker) = waker {
                let task = self.task.clone();
                self.task.ctx.spawn_pool(Box::new(move || {
                    waker.wake();
                    task.complete();
                }));
            } else {
                self.task.complete();
            }
        } else {
            self.task.set_lane(Lane::Pool);
            self.task.ctx.spawn_pool_poll(&self.task);
        }
    }

    /// Puts a grant that was claimed but could not complete on the main
    /// thread back in line.
    pub(crate) fn requeue(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Granted {
                return;
            }
            inner.phase = Phase::Queued;
        }
        drop(self.task.ctx.enqueue_main(Job {
            owner: self.task.clone(),
            work: Work::Poll,
            switch: Some(self.clone()),
            transition: None,
        }));
    }
}

enum SwitchFutureState {
    Init,
    Queued {
        core: Arc<SwitchCore>,
        _registration: Option<CancelRegistration>,
    },
    Done,
}

/// Awaitable returned by [`Factory::switch_to_main_thread`]. Completion
/// means the awaiter is executing on the main thread (no-op on headless
/// contexts).
#[must_use = "futures do nothing unless awaited"]
pub struct SwitchToMainThread {
    factory: Factory,
    always_yield: bool,
    cancel: Option<CancellationToken>,
    state: SwitchFutureState,
}

impl SwitchToMainThread {
    pub(crate) fn new(factory: Factory) -> Self {
        Self {
            factory,
            always_yield: false,
            cancel: None,
            state: SwitchFutureState::Init,
        }
    }

    /// Queues the continuation even when already on the main thread.
    pub fn always_yield(mut self) -> Self {
        self.always_yield = true;
        self
    }

    /// Ties the request to a cancellation token. A cancelled request fails
    /// this await on a worker thread; it never lands on the main thread.
    pub fn cancellable_with(mut self, token: &CancellationToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    fn request(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), SwitchError>> {
        let ctx = self.factory.ctx().clone();

        if let Some(token) = &self.cancel
            && token.is_cancelled()
        {
            return Poll::Ready(Err(SwitchError::Cancelled));
        }
        // No main-thread sink installed: switching is a no-op everywhere.
        if !ctx.has_main_post() {
            return Poll::Ready(Ok(()));
        }
        if ctx.is_main_thread() && !self.always_yield {
            return Poll::Ready(Ok(()));
        }

        let ambient = ambient::current_task().filter(|core| Arc::ptr_eq(&core.ctx, &ctx));
        let (switch, job) = match ambient {
            Some(task) => {
                task.set_lane(Lane::Main);
                let pending = (!ctx.is_main_thread())
                    .then(|| TransitionPending::begin(ctx.clone(), task.id));
                let switch = SwitchCore::new(task.clone(), pending, false);
                let job = Job {
                    owner: task,
                    work: Work::Poll,
                    switch: Some(switch.clone()),
                    transition: None,
                };
                (switch, job)
            }
            None => {
                // Outside any task: park the continuation on a transient
                // free-floating task so future joins can still reach it.
                let task = ctx.new_detached_core(self.factory.collection_id());
                let pending = (!ctx.is_main_thread())
                    .then(|| TransitionPending::begin(ctx.clone(), task.id));
                let switch = SwitchCore::new(task.clone(), pending, true);
                switch.set_waker(cx.waker().clone());
                let grant = {
                    let switch = switch.clone();
                    let task = task.clone();
                    Box::new(move || {
                        switch.wake_awaiter();
                        task.complete();
                    })
                };
                let job = Job {
                    owner: task,
                    work: Work::Run(grant),
                    switch: Some(switch.clone()),
                    transition: None,
                };
                (switch, job)
            }
        };

        let registration = self.cancel.as_ref().map(|token| {
            let switch = switch.clone();
            token.on_cancel(move || switch.cancel())
        });

        drop(ctx.enqueue_main(job));
        self.state = SwitchFutureState::Queued {
            core: switch,
            _registration: registration,
        };
        Poll::Pending
    }
}

impl Future for SwitchToMainThread {
    type Output = Result<(), SwitchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let switch = match &this.state {
            SwitchFutureState::Init => {
                let poll = this.request(cx);
                if poll.is_ready() {
                    this.state = SwitchFutureState::Done;
                }
                return poll;
            }
            SwitchFutureState::Queued { core, .. } => core.clone(),
            SwitchFutureState::Done => panic!("SwitchToMainThread polled after completion"),
        };

        match switch.phase() {
            Phase::Cancelled => {
                this.state = SwitchFutureState::Done;
                Poll::Ready(Err(SwitchError::Cancelled))
            }
            Phase::Granted => {
                if switch.detached || this.factory.ctx().is_main_thread() {
                    this.state = SwitchFutureState::Done;
                    Poll::Ready(Ok(()))
                } else {
                    // A stale wake polled us off-main after the grant; line
                    // up again rather than resume on the wrong thread.
                    switch.requeue();
                    Poll::Pending
                }
            }
            Phase::Queued => {
                switch.set_waker(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Unpin for SwitchToMainThread {}

/// Awaitable returned by [`Factory::switch_to_thread_pool`]. Completion
/// means the awaiter is executing on a pool worker.
#[must_use = "futures do nothing unless awaited"]
pub struct SwitchToThreadPool {
    factory: Factory,
    scheduled: bool,
}

impl SwitchToThreadPool {
    pub(crate) fn new(factory: Factory) -> Self {
        Self {
            factory,
            scheduled: false,
        }
    }

    fn reschedule(&self, cx: &mut Context<'_>) {
        let ctx = self.factory.ctx();
        match ambient::current_task().filter(|core| Arc::ptr_eq(&core.ctx, ctx)) {
            Some(task) => {
                task.set_lane(Lane::Pool);
                ctx.spawn_pool_poll(&task);
            }
            None => {
                let waker = cx.waker().clone();
                ctx.spawn_pool(Box::new(move || waker.wake()));
            }
        }
    }
}

impl Future for SwitchToThreadPool {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let ctx = self.factory.ctx();
        let on_main = ctx.is_main_thread();

        if self.scheduled {
            if on_main {
                // A stale main-queue resume ran us here; push off again.
                self.reschedule(cx);
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        } else if !on_main
            && ambient::current_task()
                .filter(|core| Arc::ptr_eq(&core.ctx, ctx))
                .is_none_or(|core| core.lane() == Lane::Pool)
        {
            // Already off the main thread with pool resumption in effect.
            Poll::Ready(())
        } else {
            self.scheduled = true;
            self.reschedule(cx);
            Poll::Pending
        }
    }
}

impl Unpin for SwitchToThreadPool {}
