//! Entry points for creating and synchronously completing joinable tasks.
//!
//! A [`Factory`] constructs tasks over a context (optionally attaching them
//! to a collection), implements the synchronous [`run`](Factory::run) that
//! blocks the caller while lending the main thread to admitted work, and
//! produces the switch awaitables that move execution between the main
//! thread and the pool.

pub(crate) mod pump;
pub(crate) mod switch;

#[cfg(test)]
mod tests;

pub use switch::{SwitchError, SwitchToMainThread, SwitchToThreadPool};

use crate::cancel::CancellationToken;
use crate::collection::{CollectionGuard, TaskCollection};
use crate::context::ContextInner;
use crate::context::ambient;
use crate::context::state::CollectionId;
use crate::events::TransitionPending;
use crate::task::core::{Lane, TaskBody, TaskCore, panic_sink_for};
use crate::task::join::{JoinHandle, Promise};
use crate::task::queue::{Job, Work};
use crate::task::JoinError;
use futures::FutureExt;
use futures::task::{FutureObj, Spawn, SpawnError};
use std::future::Future;
use std::panic::resume_unwind;
use std::sync::Arc;

/// Where a new task's first poll happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    /// Inline on the creating thread (the synchronous prefix of
    /// `run`/`run_async`).
    Inline,
    /// Queued for the main thread.
    Main,
    /// Spawned on the pool.
    Pool,
}

/// Creates joinable tasks and blocks on them.
///
/// Cheap to clone. Factories created through
/// [`Context::create_factory`](crate::Context::create_factory) attach every
/// task they create to their collection; the context-default factory
/// attaches to none.
#[derive(Clone)]
pub struct Factory {
    ctx: Arc<ContextInner>,
    collection: Option<Arc<CollectionGuard>>,
}

impl Factory {
    pub(crate) fn new(ctx: Arc<ContextInner>, collection: Option<Arc<CollectionGuard>>) -> Self {
        Self { ctx, collection }
    }

    pub(crate) fn ctx(&self) -> &Arc<ContextInner> {
        &self.ctx
    }

    pub(crate) fn collection_id(&self) -> Option<CollectionId> {
        self.collection.as_ref().map(|guard| guard.id())
    }

    /// Starts `future` as a joinable task and synchronously blocks until it
    /// completes, returning its output.
    ///
    /// The future's synchronous prefix runs on the calling thread. While
    /// blocked on the main thread, the caller pumps main-thread
    /// continuations of this task and of everything reachable through its
    /// join graph, and nothing else. While blocked on a worker thread,
    /// main-thread work still needs the main thread: someone must be
    /// pumping it, typically through a join (see
    /// [`TaskCollection::join`]).
    ///
    /// Panics from the task are resumed on the caller.
    pub fn run<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.run_inner(future, None) {
            Ok(value) => value,
            Err(JoinError::Panicked(payload)) => resume_unwind(payload),
            Err(JoinError::Cancelled) => unreachable!("run without a token cannot be cancelled"),
        }
    }

    /// Like [`run`](Factory::run), but the synchronous wait can be
    /// abandoned through `token`. An abandoned task keeps running detached.
    ///
    /// On a worker thread cancellation interrupts the wait promptly; on the
    /// main thread it takes effect at the next pump iteration.
    pub fn run_cancellable<F>(&self, future: F, token: &CancellationToken) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.run_inner(future, Some(token))
    }

    /// [`run`](Factory::run) with `collection` acting as an extra join set:
    /// main-thread work of the collection's members is admitted for the
    /// whole call, without an explicit join scope in the body.
    pub fn run_joined<F>(&self, collection: &TaskCollection, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (handle, core) = self.make_task(future, Placement::Inline, Some(collection.id()));
        core.poll_inline();
        match self.block_and_take(handle, None) {
            Ok(value) => value,
            Err(JoinError::Panicked(payload)) => resume_unwind(payload),
            Err(JoinError::Cancelled) => unreachable!("run without a token cannot be cancelled"),
        }
    }

    /// Starts `future` as a joinable task and returns a handle to it.
    ///
    /// The synchronous prefix runs on the calling thread before this
    /// returns. The task is attached to the factory's collection and, when
    /// created inside another joinable task, becomes that task's child
    /// (unless relevance is suppressed).
    pub fn run_async<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (handle, core) = self.make_task(future, Placement::Inline, None);
        core.poll_inline();
        handle
    }

    /// An awaitable that completes on the main thread.
    pub fn switch_to_main_thread(&self) -> SwitchToMainThread {
        SwitchToMainThread::new(self.clone())
    }

    /// An awaitable that completes on a pool worker.
    pub fn switch_to_thread_pool(&self) -> SwitchToThreadPool {
        SwitchToThreadPool::new(self.clone())
    }

    /// A scheduler that starts futures as joinable tasks pinned to the main
    /// thread.
    pub fn main_scheduler(&self) -> MainThreadScheduler {
        MainThreadScheduler {
            factory: self.clone(),
        }
    }

    /// A scheduler that starts futures as joinable tasks on the pool.
    pub fn pool_scheduler(&self) -> PoolScheduler {
        PoolScheduler {
            factory: self.clone(),
        }
    }

    fn run_inner<F>(&self, future: F, cancel: Option<&CancellationToken>) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (handle, core) = self.make_task(future, Placement::Inline, None);
        core.poll_inline();
        self.block_and_take(handle, cancel)
    }

    fn block_and_take<T>(
        &self,
        handle: JoinHandle<T>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, JoinError> {
        pump::block_on_core(&self.ctx, handle.core(), cancel)?;
        Ok(handle
            .into_outcome()
            .expect("completed task must have fulfilled its promise")?)
    }

    /// Builds the task record and decides where its first poll happens.
    /// `Inline` placements are polled by the caller after this returns.
    fn make_task<F>(
        &self,
        future: F,
        placement: Placement,
        joined: Option<CollectionId>,
    ) -> (JoinHandle<F::Output>, Arc<TaskCore>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let promise = Arc::new(Promise::new());
        let body = TaskBody::new(future, promise.clone()).boxed();
        let lane = match placement {
            Placement::Main => Lane::Main,
            Placement::Pool => Lane::Pool,
            Placement::Inline => {
                if self.ctx.is_main_thread() {
                    Lane::Main
                } else {
                    Lane::Pool
                }
            }
        };
        let core = TaskCore::new(self.ctx.clone(), body, panic_sink_for(&promise), lane);

        let parent = ambient::current_task()
            .filter(|ambient| Arc::ptr_eq(&ambient.ctx, &self.ctx))
            .map(|ambient| ambient.id);
        {
            let mut st = self.ctx.state.lock();
            st.insert_task(
                core.clone(),
                parent,
                self.collection_id(),
                Default::default(),
            );
            if let Some(collection) = joined {
                st.join_collection(core.id, collection);
            }
        }

        match placement {
            Placement::Inline => {}
            Placement::Main => {
                let pending = (!self.ctx.is_main_thread())
                    .then(|| TransitionPending::begin(self.ctx.clone(), core.id));
                drop(self.ctx.enqueue_main(Job {
                    owner: core.clone(),
                    work: Work::Poll,
                    switch: None,
                    transition: pending,
                }));
            }
            Placement::Pool => self.ctx.spawn_pool_poll(&core),
        }

        (JoinHandle::new(core.clone(), promise), core)
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("has_collection", &self.collection.is_some())
            .finish()
    }
}

/// Starts futures as joinable tasks whose execution begins (and whose
/// resumptions land) on the main thread. Usable wherever a
/// [`futures::task::Spawn`] is expected.
#[derive(Clone, Debug)]
pub struct MainThreadScheduler {
    factory: Factory,
}

impl MainThreadScheduler {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (handle, _core) = self.factory.make_task(future, Placement::Main, None);
        handle
    }
}

impl Spawn for MainThreadScheduler {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        drop(self.spawn(future));
        Ok(())
    }
}

/// Starts futures as joinable tasks on the worker pool.
#[derive(Clone, Debug)]
pub struct PoolScheduler {
    factory: Factory,
}

impl PoolScheduler {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (handle, _core) = self.factory.make_task(future, Placement::Pool, None);
        handle
    }
}

impl Spawn for PoolScheduler {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        drop(self.spawn(future));
        Ok(())
    }
}
