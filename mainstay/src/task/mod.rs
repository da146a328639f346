//! Joinable tasks: identity, queues, the shared task cell, and join
//! handles.

pub(crate) mod core;
pub mod id;
pub mod join;
pub(crate) mod queue;

pub use id::{Id, current, try_current};
pub use join::{JoinError, JoinHandle};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Where a joinable task is in its life. Monotonic toward completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,

    /// The task finished while a caller was synchronously blocked on it (or
    /// within the creating call's own synchronous prefix).
    CompletedSynchronously,

    /// The task finished on its own, with no synchronous observer.
    CompletedAsynchronously,
}

/// Yields once to the task's current lane.
///
/// On the main thread the continuation goes to the back of the task's own
/// main-thread queue, so other admitted work gets a turn; on the pool it is
/// rescheduled onto a worker.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
