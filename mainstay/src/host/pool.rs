use crate::host::{PoolSpawner, Runnable};
use anyhow::{Result, anyhow};
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::iter;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    ThreadNameFn(Arc::new(move || {
        format!("mainstay-worker-{}", NEXT.fetch_add(1, Ordering::Relaxed))
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures a [`WorkerPool`].
#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads. Defaults to one per CPU core.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the pool.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the pool.
    thread_stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "Worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of threads spawned by the pool.
    ///
    /// The default name fn yields worker names with a monotonically
    /// increasing N: "mainstay-worker-{N}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured `WorkerPool` and starts its threads.
    pub fn try_build(self) -> Result<WorkerPool> {
        let num_workers = match self.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };
        if num_workers == 0 {
            return Err(anyhow!("worker_threads must be greater than 0"));
        }
        WorkerPool::start(num_workers, &self)
    }
}

/// How long a worker parks before re-checking the queues on its own.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

struct Shared {
    injector: Injector<Runnable>,
    shutdown: AtomicBool,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

/// A fixed-size pool of worker threads fed through a global injector queue,
/// with per-worker local queues and work stealing between workers.
///
/// Workers park when there is nothing to run and are woken by `spawn`.
/// Dropping the pool shuts it down and joins every thread; queued work that
/// never ran is dropped.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// A pool with one worker per CPU core.
    pub fn try_new() -> Result<WorkerPool> {
        Builder::new().try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    fn start(num_workers: usize, builder: &Builder) -> Result<WorkerPool> {
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            shutdown: AtomicBool::new(false),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        // Crossbeam local queues and their stealers.
        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let w = CbWorker::new_lifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let handles = local_queues
            .into_iter()
            .enumerate()
            .map(|(i, local_queue)| {
                // Give each worker the list of all *other* workers' stealers,
                // shuffled so their search orders differ and contention drops.
                let mut other_stealers = stealers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, s)| s.clone())
                    .collect::<Vec<_>>();
                fastrand::shuffle(&mut other_stealers);

                spawn_worker_thread(builder, shared.clone(), local_queue, other_stealers)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkerPool {
            shared,
            handles: Mutex::new(handles),
        })
    }

    fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .map(|h| h.join())
            .filter(|r| r.is_err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

impl PoolSpawner for WorkerPool {
    fn spawn(&self, f: Runnable) {
        self.shared.injector.push(f);
        self.shared.wake.notify_one();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.lock().len())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Err(e) = self.join_all() {
            tracing::error!("worker pool shutdown: {e:?}");
        }
    }
}

fn spawn_worker_thread(
    builder: &Builder,
    shared: Arc<Shared>,
    local: CbWorker<Runnable>,
    stealers: Vec<Stealer<Runnable>>,
) -> Result<thread::JoinHandle<()>> {
    let mut thread_builder = thread::Builder::new().name((builder.thread_name.0)());
    if let Some(stack_size) = builder.thread_stack_size {
        thread_builder = thread_builder.stack_size(stack_size);
    }

    let handle = thread_builder.spawn(move || worker_loop(&shared, &local, &stealers))?;
    Ok(handle)
}

fn worker_loop(shared: &Shared, local: &CbWorker<Runnable>, stealers: &[Stealer<Runnable>]) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match find_work(shared, local, stealers) {
            Some(job) => {
                // A panicking job must not take the worker thread down with it.
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    let name = thread::current().name().unwrap_or("<unnamed>").to_owned();
                    eprintln!("Worker thread {name} caught a panicking job: {payload:?}");
                }
            }
            None => {
                let mut guard = shared.sleep_lock.lock();
                // Re-check under the lock: a spawn may have raced with us.
                if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                    shared.wake.wait_for(&mut guard, PARK_TIMEOUT);
                }
            }
        }
    }
}

fn find_work(
    shared: &Shared,
    local: &CbWorker<Runnable>,
    stealers: &[Stealer<Runnable>],
) -> Option<Runnable> {
    // Local queue first (hot cache), then batches from the injector, then
    // steal from the other workers.
    local.pop().or_else(|| {
        iter::repeat_with(|| {
            shared
                .injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(|s| s.steal()).collect())
        })
        .take(4)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    })
}
