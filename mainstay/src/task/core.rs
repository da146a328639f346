use crate::context::ContextInner;
use crate::context::ambient;
use crate::task::join::{JoinError, Promise};
use crate::task::queue::Job;
use crate::task::{Id, TaskState};
use futures::future::BoxFuture;
use futures::task::ArcWake;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

/// Which execution discipline resumes a suspended task.
///
/// The lane mirrors what a captured synchronization context would be in a
/// host with one: after a switch to the main thread, resumptions keep
/// landing there until the task explicitly moves back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lane {
    Pool,
    Main,
}

const LANE_POOL: u8 = 0;
const LANE_MAIN: u8 = 1;

const STATE_RUNNING: u8 = 0;
const STATE_COMPLETED_SYNC: u8 = 1;
const STATE_COMPLETED_ASYNC: u8 = 2;

type PanicSink = Box<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// The Arc-shared cell behind one joinable task.
///
/// The future slot serializes polls: a poller takes the future out, polls it
/// outside every lock, and puts it back. A wake that arrives while the
/// future is out sets the repoll flag, and the active poller re-issues the
/// wake on its way out so the resumption lands on the right lane.
pub(crate) struct TaskCore {
    pub(crate) id: Id,
    pub(crate) ctx: Arc<ContextInner>,

    /// The thread `run`/`run_async` was invoked on.
    pub(crate) owner_thread: ThreadId,

    lane: AtomicU8,
    state: AtomicU8,
    repoll: AtomicBool,

    /// True while the creating call polls the task inline; completion
    /// observed here counts as synchronous.
    inline_poll: AtomicBool,

    future: Mutex<Option<BoxFuture<'static, ()>>>,

    /// Completes the typed promise when a poll panics (the future is gone
    /// at that point, so the wrapper cannot do it).
    panic_sink: PanicSink,
}

impl TaskCore {
    pub(crate) fn new(
        ctx: Arc<ContextInner>,
        future: BoxFuture<'static, ()>,
        panic_sink: PanicSink,
        lane: Lane,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Id::next(),
            ctx,
            owner_thread: thread::current().id(),
            lane: AtomicU8::new(lane_to_u8(lane)),
            state: AtomicU8::new(STATE_RUNNING),
            repoll: AtomicBool::new(false),
            inline_poll: AtomicBool::new(false),
            future: Mutex::new(Some(future)),
            panic_sink,
        })
    }

    /// A transient task with no future of its own; it only carries queued
    /// continuations.
    pub(crate) fn new_detached(ctx: Arc<ContextInner>, lane: Lane) -> Arc<Self> {
        Arc::new(Self {
            id: Id::next(),
            ctx,
            owner_thread: thread::current().id(),
            lane: AtomicU8::new(lane_to_u8(lane)),
            state: AtomicU8::new(STATE_RUNNING),
            repoll: AtomicBool::new(false),
            inline_poll: AtomicBool::new(false),
            future: Mutex::new(None),
            panic_sink: Box::new(|_| {}),
        })
    }

    pub(crate) fn lane(&self) -> Lane {
        match self.lane.load(Ordering::Acquire) {
            LANE_MAIN => Lane::Main,
            _ => Lane::Pool,
        }
    }

    pub(crate) fn set_lane(&self, lane: Lane) {
        self.lane.store(lane_to_u8(lane), Ordering::Release);
    }

    pub(crate) fn task_state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            STATE_COMPLETED_SYNC => TaskState::CompletedSynchronously,
            STATE_COMPLETED_ASYNC => TaskState::CompletedAsynchronously,
            _ => TaskState::Running,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_RUNNING
    }

    /// Polls the task's future on the calling thread, to its next suspension
    /// or to completion. The ambient slot holds this task for the duration.
    pub(crate) fn poll(self: &Arc<Self>) {
        let Some(mut future) = self.future.lock().take() else {
            // Completed, or another thread is mid-poll; leave a note either
            // way, the active poller re-checks on its way out.
            if !self.is_completed() {
                self.repoll.store(true, Ordering::Release);
            }
            return;
        };

        let waker = futures::task::waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let _ambient = ambient::enter_task(self);
            catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        match poll {
            Err(payload) => {
                (self.panic_sink)(payload);
                self.complete();
            }
            Ok(Poll::Ready(())) => self.complete(),
            Ok(Poll::Pending) => {
                *self.future.lock() = Some(future);
                // A wake raced with this poll; replay it so the task lands
                // on whatever lane it chose during the poll.
                if self.repoll.swap(false, Ordering::AcqRel) {
                    ArcWake::wake_by_ref(self);
                }
            }
        }
    }

    /// Runs the creating call's inline poll (the synchronous prefix of the
    /// async operation).
    pub(crate) fn poll_inline(self: &Arc<Self>) {
        self.inline_poll.store(true, Ordering::Release);
        self.poll();
        self.inline_poll.store(false, Ordering::Release);
    }

    /// Marks the task completed, removes it from the shared tables, and
    /// discards undelivered continuations.
    pub(crate) fn complete(self: &Arc<Self>) {
        if self.is_completed() {
            return;
        }
        let inline = self.inline_poll.load(Ordering::Acquire);
        let cleanup = {
            let mut st = self.ctx.state.lock();
            let cleanup = st.complete_task(self.id, inline);
            let encoded = match cleanup.kind {
                TaskState::CompletedSynchronously => STATE_COMPLETED_SYNC,
                _ => STATE_COMPLETED_ASYNC,
            };
            self.state.store(encoded, Ordering::Release);
            cleanup
        };

        // Dropping undelivered jobs can fire transition hooks; do it outside
        // the state lock.
        drop(cleanup.dropped);
        self.ctx.wake.notify_all();
    }
}

fn lane_to_u8(lane: Lane) -> u8 {
    match lane {
        Lane::Pool => LANE_POOL,
        Lane::Main => LANE_MAIN,
    }
}

impl ArcWake for TaskCore {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.is_completed() {
            return;
        }
        match arc_self.lane() {
            Lane::Main => {
                // Rejected means the task completed concurrently; the job is
                // just dropped.
                drop(arc_self.ctx.enqueue_main(Job::poll(arc_self.clone())));
            }
            Lane::Pool => arc_self.ctx.spawn_pool_poll(arc_self),
        }
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("owner_thread", &self.owner_thread)
            .field("lane", &self.lane())
            .field("state", &self.task_state())
            .finish()
    }
}

/// Wraps the user's future so its output lands in the task's promise while
/// the stored future stays type-erased.
#[pin_project]
pub(crate) struct TaskBody<F: Future> {
    #[pin]
    inner: F,
    promise: Arc<Promise<F::Output>>,
}

impl<F: Future> TaskBody<F> {
    pub(crate) fn new(inner: F, promise: Arc<Promise<F::Output>>) -> Self {
        Self { inner, promise }
    }
}

impl<F: Future> Future for TaskBody<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(value) => {
                this.promise.complete(Ok(value));
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Builds the panic sink that completes a typed promise with the panic
/// payload.
pub(crate) fn panic_sink_for<T: Send + 'static>(promise: &Arc<Promise<T>>) -> PanicSink {
    let promise = promise.clone();
    Box::new(move |payload| promise.complete(Err(JoinError::Panicked(payload))))
}
