//! Mainstay reconciles two execution disciplines inside one process: a
//! distinguished "main thread" (an event-loop or dispatcher thread that
//! cannot be displaced) and a multithreaded worker pool. Code that starts on
//! the main thread may synchronously wait for async work that itself needs
//! the main thread, without deadlocking, because the blocked main thread
//! lends itself to the awaited work's main-thread continuations.
//!
//! Admission is strictly scoped: while a [`Factory::run`] call blocks the
//! main thread, only continuations owned by tasks reachable through the
//! blocker's join graph are dispatched. Everything else stays queued until
//! a [`TaskCollection::join`] scope (or a direct join) makes it relevant.
//!
//! The host supplies the real event loop and thread pool through the
//! [`host`] traits; [`host::Dispatcher`] and [`host::WorkerPool`] are
//! default implementations for standalone hosts and tests.

pub mod cancel;
pub mod collection;
pub mod context;
pub mod events;
pub mod factory;
pub mod host;
pub mod sync_context;
pub mod task;

pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cancel::CancellationToken;
pub use collection::{JoinGuard, TaskCollection};
pub use context::{Builder, Context, SuppressGuard};
pub use events::{ListenerRegistration, TransitionListener};
pub use factory::{
    Factory, MainThreadScheduler, PoolScheduler, SwitchError, SwitchToMainThread,
    SwitchToThreadPool,
};
pub use sync_context::SyncContext;
pub use task::{Id, JoinError, JoinHandle, TaskState, yield_now};
