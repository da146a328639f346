//! The process-wide anchor.
//!
//! A [`Context`] identifies the main thread (the thread that built it),
//! holds the host seams, and owns the shared coordination state: the task
//! table, the join graph, and the blocker stack, all behind one mutex. One
//! context per application is the expected shape, instantiated explicitly.

pub(crate) mod ambient;
pub(crate) mod state;

use crate::collection::TaskCollection;
use crate::events::{ListenerRegistration, ListenerRegistry, TransitionListener};
use crate::factory::Factory;
use crate::host::{MainThreadPost, PoolSpawner, Runnable, WorkerPool};
use crate::task::core::{Lane, TaskCore};
use crate::task::queue::Job;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use state::{State, TaskFlags};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub(crate) struct ContextInner {
    main_thread: ThreadId,
    main_post: Option<Arc<dyn MainThreadPost>>,
    pool: Arc<dyn PoolSpawner>,

    pub(crate) state: Mutex<State>,

    /// Signalled whenever a queue or a completion changes; synchronous
    /// blockers park on it.
    pub(crate) wake: Condvar,

    pub(crate) listeners: ListenerRegistry,
}

impl ContextInner {
    pub(crate) fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Whether the host installed a main-thread post sink. Without one the
    /// context is "headless": main-thread switches are no-ops.
    pub(crate) fn has_main_post(&self) -> bool {
        self.main_post.is_some()
    }

    /// Queues a main-thread job on its owner and signals every waiter: the
    /// condvar for blocked pumps, and a host wake-up so an idle main thread
    /// notices. Returns the job if the owner already completed.
    pub(crate) fn enqueue_main(self: &Arc<Self>, job: Job) -> Option<Job> {
        let rejected = self.state.lock().enqueue_main(job);
        if rejected.is_none() {
            self.wake.notify_all();
            self.post_host_wakeup();
        }
        rejected
    }

    /// Schedules a poll of `core` on the pool lane, honoring the
    /// worker-blocker reroute: when a worker thread is synchronously blocked
    /// on this task, the job lands in the task's pool queue instead of the
    /// global pool, so the blocked worker runs it inline.
    pub(crate) fn spawn_pool_poll(self: &Arc<Self>, core: &Arc<TaskCore>) {
        let global = self.state.lock().route_pool_poll(core);
        match global {
            Some(job) => {
                self.pool.spawn(Box::new(move || crate::factory::pump::execute(job)));
            }
            None => {
                self.wake.notify_all();
            }
        }
    }

    pub(crate) fn spawn_pool(&self, f: Runnable) {
        self.pool.spawn(f);
    }

    /// Hands a callback to the host's main-thread sink, or to the pool on a
    /// headless context.
    pub(crate) fn post_to_host_or_pool(&self, f: Runnable) {
        match &self.main_post {
            Some(post) => post.post(f),
            None => self.pool.spawn(f),
        }
    }

    fn post_host_wakeup(self: &Arc<Self>) {
        if let Some(post) = &self.main_post {
            let ctx = self.clone();
            post.post(Box::new(move || ctx.host_drain_one()));
        }
    }

    /// Runs one queued main-thread job on behalf of the host loop. While a
    /// synchronous blocker is active this is a pure wake-up (the pump owns
    /// dispatch); otherwise any task's queued work is eligible.
    pub(crate) fn host_drain_one(self: &Arc<Self>) {
        let job = self.state.lock().host_drain_job();
        if let Some(job) = job {
            crate::factory::pump::execute(job);
        }
    }

    /// Creates a transient free-floating task that only carries queued
    /// continuations, reachable through `membership` joins.
    pub(crate) fn new_detached_core(
        self: &Arc<Self>,
        membership: Option<state::CollectionId>,
    ) -> Arc<TaskCore> {
        let core = TaskCore::new_detached(self.clone(), Lane::Main);
        self.state
            .lock()
            .insert_task(core.clone(), None, membership, TaskFlags::FREE_FLOATING);
        core
    }
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("main_thread", &self.main_thread)
            .field("headless", &self.main_post.is_none())
            .finish()
    }
}

/// Configures a [`Context`].
#[derive(Default)]
pub struct Builder {
    main_post: Option<Arc<dyn MainThreadPost>>,
    pool: Option<Arc<dyn PoolSpawner>>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the host's main-thread post sink.
    ///
    /// Without one the context is headless: switching to the main thread is
    /// a no-op everywhere and posted callbacks fall back to the pool.
    pub fn main_thread_post<P: MainThreadPost>(mut self, post: P) -> Self {
        self.main_post = Some(Arc::new(post));
        self
    }

    /// Installs the host's thread pool. Defaults to a [`WorkerPool`] with
    /// one worker per CPU core.
    pub fn thread_pool<P: PoolSpawner>(mut self, pool: P) -> Self {
        self.pool = Some(Arc::new(pool));
        self
    }

    /// Creates the configured `Context`, designating the current thread as
    /// the main thread.
    pub fn try_build(self) -> Result<Context> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(WorkerPool::try_new()?),
        };
        Ok(Context {
            inner: Arc::new(ContextInner {
                main_thread: thread::current().id(),
                main_post: self.main_post,
                pool,
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                listeners: ListenerRegistry::default(),
            }),
        })
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("has_main_post", &self.main_post.is_some())
            .field("has_pool", &self.pool.is_some())
            .finish()
    }
}

/// The process-wide coordination anchor. Cheap to clone; all clones share
/// one state.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    /// Whether the calling thread is this context's main thread.
    pub fn is_main_thread(&self) -> bool {
        self.inner.is_main_thread()
    }

    /// The context-default factory: its tasks belong to no collection.
    pub fn factory(&self) -> Factory {
        Factory::new(self.inner.clone(), None)
    }

    pub fn create_collection(&self) -> TaskCollection {
        TaskCollection::new(self.inner.clone(), None)
    }

    pub fn create_named_collection(&self, display_name: impl Into<String>) -> TaskCollection {
        TaskCollection::new(self.inner.clone(), Some(display_name.into()))
    }

    /// A factory whose tasks become members of `collection` at creation.
    pub fn create_factory(&self, collection: &TaskCollection) -> Factory {
        Factory::new(self.inner.clone(), Some(collection.guard().clone()))
    }

    /// Hides the ambient task until the guard drops, so work started inside
    /// the scope is unrelated to the enclosing task and needs an explicit
    /// join to reach a blocked main thread.
    pub fn suppress_relevance(&self) -> SuppressGuard {
        SuppressGuard {
            _inner: ambient::suppress(),
        }
    }

    /// Registers a transition listener; it stays active until the returned
    /// registration drops.
    pub fn add_transition_listener(
        &self,
        listener: Arc<dyn TransitionListener>,
    ) -> ListenerRegistration {
        let key = self.inner.listeners.insert(listener);
        ListenerRegistration::new(self.inner.clone(), key)
    }
}

/// Scope during which the ambient task identity is hidden. See
/// [`Context::suppress_relevance`].
#[must_use = "relevance is restored when the guard drops"]
pub struct SuppressGuard {
    _inner: ambient::AmbientGuard,
}
