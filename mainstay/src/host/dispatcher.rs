use crate::host::{MainThreadPost, Runnable};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long a frame waits for new messages before re-checking its exit
/// predicate.
const FRAME_PARK_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Default)]
struct DispatcherShared {
    queue: Mutex<VecDeque<Runnable>>,
    wake: Condvar,
}

/// A minimal main-thread message loop for standalone hosts and tests.
///
/// Callbacks posted from any thread are executed, in order, by whichever
/// frame the owning thread is currently running. Frames nest: a callback may
/// push another frame (the modal-loop model), and posts keep being delivered
/// to the innermost frame until its exit predicate clears.
#[derive(Clone, Default)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs posted callbacks until `exit` returns true.
    ///
    /// The predicate is re-checked after every callback and periodically
    /// while idle. Must be called on the thread acting as the main thread;
    /// re-entrant calls nest.
    pub fn run_frame(&self, mut exit: impl FnMut() -> bool) {
        loop {
            if exit() {
                return;
            }
            let job = {
                let mut queue = self.shared.queue.lock();
                match queue.pop_front() {
                    Some(job) => Some(job),
                    None => {
                        self.shared.wake.wait_for(&mut queue, FRAME_PARK_TIMEOUT);
                        queue.pop_front()
                    }
                }
            };
            if let Some(job) = job {
                job();
            }
        }
    }

    /// Runs every callback queued so far, then returns.
    pub fn drain(&self) {
        loop {
            let job = self.shared.queue.lock().pop_front();
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }

    /// Number of callbacks waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl MainThreadPost for Dispatcher {
    fn post(&self, f: Runnable) {
        self.shared.queue.lock().push_back(f);
        self.shared.wake.notify_all();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}
