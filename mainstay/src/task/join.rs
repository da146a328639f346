use crate::context::ambient;
use crate::factory::pump;
use crate::task::core::TaskCore;
use crate::task::{Id, TaskState};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Why a joinable task's outcome is unavailable.
pub enum JoinError {
    /// The synchronous wait was abandoned; the task keeps running detached.
    Cancelled,

    /// The task's future panicked. The payload is what the panic carried.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl JoinError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panicked(_))
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error is not [`JoinError::Panicked`].
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            JoinError::Panicked(payload) => payload,
            JoinError::Cancelled => panic!("JoinError::into_panic on a cancellation"),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => write!(f, "JoinError::Cancelled"),
            JoinError::Panicked(_) => write!(f, "JoinError::Panicked(..)"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => write!(f, "synchronous wait was cancelled"),
            JoinError::Panicked(_) => write!(f, "joinable task panicked"),
        }
    }
}

impl std::error::Error for JoinError {}

/// One-shot completion cell shared between a task's body and its handle.
pub(crate) struct Promise<T> {
    inner: Mutex<PromiseInner<T>>,
}

struct PromiseInner<T> {
    value: Option<Result<T, JoinError>>,
    fulfilled: bool,
    waker: Option<Waker>,
}

impl<T> Promise<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PromiseInner {
                value: None,
                fulfilled: false,
                waker: None,
            }),
        }
    }

    /// First completion wins; later calls are ignored.
    pub(crate) fn complete(&self, value: Result<T, JoinError>) {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.fulfilled {
                return;
            }
            inner.fulfilled = true;
            inner.value = Some(value);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn try_take(&self) -> Option<Result<T, JoinError>> {
        self.inner.lock().value.take()
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>> {
        let mut inner = self.inner.lock();
        match inner.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// An owned claim to a joinable task's outcome.
///
/// Dropping the handle detaches the task: it keeps running, its result is
/// discarded. Awaiting the handle from inside another joinable task holds a
/// join edge for the duration of the await, so a synchronous blocker on the
/// awaiting task admits this one's main-thread work too.
pub struct JoinHandle<T> {
    core: Arc<TaskCore>,
    promise: Arc<Promise<T>>,

    /// Join edge registered by the async path, released on ready or drop.
    joined_from: Option<Id>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(core: Arc<TaskCore>, promise: Arc<Promise<T>>) -> Self {
        Self {
            core,
            promise,
            joined_from: None,
        }
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    /// Takes the outcome of an already-completed task.
    pub(crate) fn into_outcome(self) -> Option<Result<T, JoinError>> {
        self.promise.try_take()
    }

    /// The task's unique identity.
    pub fn id(&self) -> Id {
        self.core.id
    }

    /// Whether the task has run to completion (or panicked).
    pub fn is_finished(&self) -> bool {
        self.core.is_completed()
    }

    pub fn state(&self) -> TaskState {
        self.core.task_state()
    }

    /// Blocks the calling thread until the task completes and returns its
    /// outcome.
    ///
    /// On the main thread this enters the re-entrant pump: main-thread
    /// continuations of this task (and of everything reachable through its
    /// join graph) execute on the caller's stack while it waits. On a worker
    /// thread it parks, draining this task's rerouted pool work inline.
    pub fn join(self) -> Result<T, JoinError> {
        let ctx = self.core.ctx.clone();

        // Joining from inside another task also links the two for the
        // duration, so an outer blocker on the caller admits this task.
        let ambient_edge = ambient::current_task()
            .filter(|caller| Arc::ptr_eq(&caller.ctx, &ctx) && caller.id != self.core.id)
            .map(|caller| caller.id);
        if let Some(from) = ambient_edge {
            ctx.state.lock().add_join_edge(from, self.core.id);
        }
        let _release = ambient_edge.map(|from| {
            let ctx = ctx.clone();
            let to = self.core.id;
            ScopeGuard::new(move || ctx.state.lock().release_join_edge(from, to))
        });

        pump::block_on_core(&ctx, &self.core, None)
            .expect("uncancellable wait cannot be cancelled");
        self.promise
            .try_take()
            .expect("completed task must have fulfilled its promise")
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.joined_from.is_none() && !self.core.is_completed() {
            let target = self.core.id;
            let edge = ambient::current_task()
                .filter(|caller| Arc::ptr_eq(&caller.ctx, &self.core.ctx) && caller.id != target)
                .map(|caller| caller.id);
            if let Some(from) = edge {
                let added = {
                    let mut st = self.core.ctx.state.lock();
                    let target_alive = st.task(target).is_some();
                    if target_alive {
                        st.add_join_edge(from, target);
                    }
                    target_alive
                };
                if added {
                    self.joined_from = Some(from);
                }
            }
        }

        let poll = self.promise.poll_take(cx);
        if poll.is_ready()
            && let Some(from) = self.joined_from.take()
        {
            self.core
                .ctx
                .state
                .lock()
                .release_join_edge(from, self.core.id);
        }
        poll
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(from) = self.joined_from.take() {
            self.core
                .ctx
                .state
                .lock()
                .release_join_edge(from, self.core.id);
        }
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
