//! Host integration seams.
//!
//! Mainstay does not own an event loop or a thread pool; the host does. Two
//! traits describe what it consumes: a main-thread post sink
//! ([`MainThreadPost`]) and a way to run closures on worker threads
//! ([`PoolSpawner`]). [`Dispatcher`] and [`WorkerPool`] are default
//! implementations for standalone hosts and tests.

pub mod dispatcher;
pub mod pool;

pub use dispatcher::Dispatcher;
pub use pool::WorkerPool;

/// A closure handed to the host for execution.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// Sink that schedules a callback for main-thread execution by the host's
/// event loop.
///
/// Mainstay posts two kinds of callbacks here: wake-ups that let an idle
/// main thread notice newly queued work, and callbacks that outlived their
/// owning task. Both may arrive while the host runs nested (modal) loop
/// frames; the host must keep delivering them.
pub trait MainThreadPost: Send + Sync + 'static {
    fn post(&self, f: Runnable);
}

/// A thread pool able to run a closure on some worker thread.
pub trait PoolSpawner: Send + Sync + 'static {
    fn spawn(&self, f: Runnable);
}
