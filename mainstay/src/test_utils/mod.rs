//! Shared fixtures for the crate's tests.

use crate::context::Context;
use crate::events::TransitionListener;
use crate::host::{Dispatcher, WorkerPool};
use crate::task::Id;
use dashmap::DashMap;
use futures::task::ArcWake;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

/// A context whose main thread is the calling (test) thread, backed by a
/// dispatcher sink and a small worker pool.
pub(crate) fn context_on_current_thread() -> (Context, Dispatcher) {
    let dispatcher = Dispatcher::new();
    let ctx = Context::builder()
        .main_thread_post(dispatcher.clone())
        .thread_pool(
            WorkerPool::builder()
                .worker_threads(2)
                .try_build()
                .expect("worker pool"),
        )
        .try_build()
        .expect("context");
    (ctx, dispatcher)
}

/// A context with no main-thread sink: switching to the main thread is a
/// no-op.
pub(crate) fn headless_context() -> Context {
    Context::builder()
        .thread_pool(
            WorkerPool::builder()
                .worker_threads(2)
                .try_build()
                .expect("worker pool"),
        )
        .try_build()
        .expect("context")
}

// --- recorded transition calls ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Transitioning,
    Transitioned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Transitioning { task: Id },
    Transitioned { task: Id, cancelled: bool },
}

#[derive(Debug, Default)]
pub(crate) struct TransitionRecorder {
    calls: DashMap<Method, Vec<Call>>,
}

impl TransitionRecorder {
    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls.entry(method).or_default().push(call);
    }

    pub(crate) fn transitioning_count(&self, task: Id) -> usize {
        self.calls
            .get(&Method::Transitioning)
            .map_or(0, |calls| {
                calls
                    .iter()
                    .filter(|call| matches!(call, Call::Transitioning { task: t } if *t == task))
                    .count()
            })
    }

    pub(crate) fn transitioned_count(&self, task: Id) -> usize {
        self.calls.get(&Method::Transitioned).map_or(0, |calls| {
            calls
                .iter()
                .filter(|call| matches!(call, Call::Transitioned { task: t, .. } if *t == task))
                .count()
        })
    }

    pub(crate) fn cancelled_count(&self, task: Id) -> usize {
        self.calls.get(&Method::Transitioned).map_or(0, |calls| {
            calls
                .iter()
                .filter(
                    |call| matches!(call, Call::Transitioned { task: t, cancelled: true } if *t == task),
                )
                .count()
        })
    }
}

impl TransitionListener for TransitionRecorder {
    fn on_transitioning_to_main_thread(&self, task: Id) {
        self.record(Method::Transitioning, Call::Transitioning { task });
    }

    fn on_transitioned_to_main_thread(&self, task: Id, cancelled: bool) {
        self.record(Method::Transitioned, Call::Transitioned { task, cancelled });
    }
}

// --- a manual-reset event usable from both sync and async code ---

#[derive(Default)]
struct FlagState {
    set: bool,
    wakers: Vec<Waker>,
}

#[derive(Default)]
struct FlagInner {
    state: Mutex<FlagState>,
    cond: Condvar,
}

/// Manual-reset event: `set` releases every current and future waiter.
#[derive(Clone, Default)]
pub(crate) struct AsyncFlag {
    inner: Arc<FlagInner>,
}

impl AsyncFlag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self) {
        let wakers = {
            let mut state = self.inner.state.lock();
            state.set = true;
            std::mem::take(&mut state.wakers)
        };
        self.inner.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.inner.state.lock().set
    }

    pub(crate) fn wait(&self) -> FlagWait {
        FlagWait { flag: self.clone() }
    }

    /// Blocking wait; returns whether the flag was set within `timeout`.
    pub(crate) fn wait_blocking(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.set {
            if self
                .inner
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.set;
            }
        }
        true
    }
}

pub(crate) struct FlagWait {
    flag: AsyncFlag,
}

impl Future for FlagWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let mut state = self.flag.inner.state.lock();
        if state.set {
            Poll::Ready(())
        } else {
            state.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Completes after `duration`, off every interesting thread (a dedicated
/// timer thread sets the flag).
pub(crate) fn delay(duration: Duration) -> FlagWait {
    let flag = AsyncFlag::new();
    {
        let flag = flag.clone();
        thread::spawn(move || {
            thread::sleep(duration);
            flag.set();
        });
    }
    flag.wait()
}

// --- a wake-counting waker, the safe rendition of a mock raw waker ---

#[derive(Debug, Default)]
pub(crate) struct WakeCount {
    count: AtomicUsize,
}

impl WakeCount {
    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl ArcWake for WakeCount {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A waker that increments a counter every time it is woken.
pub(crate) fn counting_waker() -> (Waker, Arc<WakeCount>) {
    let data = Arc::new(WakeCount::default());
    (futures::task::waker(data.clone()), data)
}

/// Spin-waits (sleeping) until `cond` holds or `deadline` elapses.
pub(crate) fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
