//! The shared coordination state: the task table, the collection table, the
//! join graph, and the synchronous-blocker stack.
//!
//! Everything here is guarded by the context's single mutex. Traversals
//! (dependency closures, admission picks) happen under the lock; the chosen
//! job is executed after the lock is released. Undelivered jobs returned by
//! [`State::complete_task`] must likewise be dropped outside the lock, since
//! dropping them can fire transition hooks.

use crate::task::core::TaskCore;
use crate::task::queue::{Job, WorkQueue};
use crate::task::{Id, TaskState};
use bitflags::bitflags;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a collection within its context.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub(crate) struct CollectionId(u64);

impl CollectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TaskFlags: u8 {
        /// A transient task that exists only to carry queued continuations
        /// (created when a switch is requested outside any task).
        const FREE_FLOATING = 1;

        /// The main thread is synchronously blocked on this task.
        const BLOCKED_ON_MAIN = 1 << 1;

        /// A worker thread is synchronously blocked on this task.
        const BLOCKED_ON_WORKER = 1 << 2;
    }
}

#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub(crate) core: Arc<TaskCore>,
    pub(crate) flags: TaskFlags,

    /// Continuations that must execute on the main thread.
    pub(crate) main_queue: WorkQueue,

    /// Continuations rerouted here while a worker thread is synchronously
    /// blocked on this task; that worker drains them inline.
    pub(crate) pool_queue: WorkQueue,

    pub(crate) parent: Option<Id>,
    pub(crate) children: HashSet<Id>,

    /// Edge-counted direct joins: tasks whose work this task admits.
    pub(crate) joins: HashMap<Id, usize>,

    /// Edge-counted collection joins: collections whose members this task
    /// admits.
    pub(crate) joined_collections: HashMap<CollectionId, usize>,

    /// Collections this task is a member of.
    memberships: HashSet<CollectionId>,
}

#[derive(Debug, Default)]
pub(crate) struct CollectionRecord {
    /// Refcounted membership: `add` twice needs `remove` twice.
    pub(crate) members: HashMap<Id, usize>,

    /// Edge-counted open join scopes, by joiner task.
    pub(crate) joiners: HashMap<Id, usize>,

    pub(crate) display_name: Option<String>,
}

/// One synchronous blocker on the main thread. Frames nest; the innermost
/// one runs the pump, and its admission set is the union over the stack.
#[derive(Debug)]
struct BlockerFrame {
    root: Id,
    cache: HashSet<Id>,
    cache_version: Option<u64>,
}

/// Everything returned by [`State::complete_task`] that must be handled
/// outside the lock.
pub(crate) struct CompletionCleanup {
    pub(crate) kind: TaskState,
    pub(crate) dropped: Vec<Job>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    tasks: HashMap<Id, TaskRecord>,
    collections: HashMap<CollectionId, CollectionRecord>,

    /// Stack of synchronous blockers on the main thread.
    blockers: Vec<BlockerFrame>,

    /// Bumped on every mutation that can change a dependency closure;
    /// blocker caches are recomputed lazily when it moves.
    version: u64,

    /// Rotating cursor for round-robin scans over admitted tasks.
    rotation: usize,
}

impl State {
    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    // --- task table ---

    pub(crate) fn insert_task(
        &mut self,
        core: Arc<TaskCore>,
        parent: Option<Id>,
        membership: Option<CollectionId>,
        flags: TaskFlags,
    ) {
        let id = core.id;
        let mut record = TaskRecord {
            core,
            flags,
            main_queue: WorkQueue::new(),
            pool_queue: WorkQueue::new(),
            parent: None,
            children: HashSet::new(),
            joins: HashMap::new(),
            joined_collections: HashMap::new(),
            memberships: HashSet::new(),
        };

        if let Some(parent) = parent
            && let Some(parent_record) = self.tasks.get_mut(&parent)
        {
            parent_record.children.insert(id);
            record.parent = Some(parent);
        }

        if let Some(collection) = membership
            && let Some(collection_record) = self.collections.get_mut(&collection)
        {
            *collection_record.members.entry(id).or_insert(0) += 1;
            record.memberships.insert(collection);
        }

        self.tasks.insert(id, record);
        self.bump();
    }

    /// Removes a completed task: detaches it from its parent and its
    /// collections, closes both queues, and reports whether completion was
    /// observed by a synchronous blocker.
    pub(crate) fn complete_task(&mut self, id: Id, inline: bool) -> CompletionCleanup {
        let Some(mut record) = self.tasks.remove(&id) else {
            return CompletionCleanup {
                kind: TaskState::CompletedAsynchronously,
                dropped: Vec::new(),
            };
        };

        if let Some(parent) = record.parent
            && let Some(parent_record) = self.tasks.get_mut(&parent)
        {
            parent_record.children.remove(&id);
        }
        for collection in record.memberships.iter() {
            if let Some(collection_record) = self.collections.get_mut(collection) {
                collection_record.members.remove(&id);
            }
        }
        // Open joins held by the completed task (scopes and `run_joined`
        // admissions alike) die with it.
        for collection in record.joined_collections.keys() {
            if let Some(collection_record) = self.collections.get_mut(collection) {
                collection_record.joiners.remove(&id);
            }
        }

        let blocked = record
            .flags
            .intersects(TaskFlags::BLOCKED_ON_MAIN | TaskFlags::BLOCKED_ON_WORKER);
        let kind = if blocked || inline {
            TaskState::CompletedSynchronously
        } else {
            TaskState::CompletedAsynchronously
        };

        let mut dropped = record.main_queue.close();
        dropped.extend(record.pool_queue.close());

        self.bump();
        CompletionCleanup { kind, dropped }
    }

    pub(crate) fn task(&self, id: Id) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    // --- queues ---

    /// Appends a main-thread job to its owner's queue. Returns the job back
    /// if the owner has completed (caller drops it, or reroutes it, outside
    /// the lock).
    pub(crate) fn enqueue_main(&mut self, job: Job) -> Option<Job> {
        match self.tasks.get_mut(&job.owner.id) {
            Some(record) => record.main_queue.push(job).err(),
            None => Some(job),
        }
    }

    /// Routes a pool-lane poll of `core`: into the task's own pool queue
    /// when a worker thread is synchronously blocked on it (that worker
    /// drains it inline), otherwise out to the caller for the global pool.
    pub(crate) fn route_pool_poll(&mut self, core: &Arc<TaskCore>) -> Option<Job> {
        match self.tasks.get_mut(&core.id) {
            Some(record) if record.flags.contains(TaskFlags::BLOCKED_ON_WORKER) => {
                let job = Job::poll(record.core.clone());
                record.pool_queue.push(job).err()
            }
            Some(record) => Some(Job::poll(record.core.clone())),
            None => None,
        }
    }

    pub(crate) fn pop_pool_job(&mut self, id: Id) -> Option<Job> {
        self.tasks.get_mut(&id).and_then(|record| record.pool_queue.pop())
    }

    // --- blockers ---

    pub(crate) fn push_main_blocker(&mut self, root: Id) {
        self.blockers.push(BlockerFrame {
            root,
            cache: HashSet::new(),
            cache_version: None,
        });
        if let Some(record) = self.tasks.get_mut(&root) {
            record.flags.insert(TaskFlags::BLOCKED_ON_MAIN);
        }
    }

    pub(crate) fn pop_main_blocker(&mut self, root: Id) {
        match self.blockers.pop() {
            Some(frame) => debug_assert_eq!(frame.root, root, "unbalanced blocker stack"),
            None => debug_assert!(false, "unbalanced blocker stack"),
        }
        if !self.blockers.iter().any(|frame| frame.root == root)
            && let Some(record) = self.tasks.get_mut(&root)
        {
            record.flags.remove(TaskFlags::BLOCKED_ON_MAIN);
        }
    }

    pub(crate) fn innermost_main_blocker(&self) -> Option<Id> {
        self.blockers.last().map(|frame| frame.root)
    }

    pub(crate) fn set_worker_blocked(&mut self, root: Id, blocked: bool) {
        if let Some(record) = self.tasks.get_mut(&root) {
            if blocked {
                record.flags.insert(TaskFlags::BLOCKED_ON_WORKER);
            } else {
                record.flags.remove(TaskFlags::BLOCKED_ON_WORKER);
            }
        }
    }

    // --- the admission pick ---

    /// Picks the next main-thread job admissible under the current blocker
    /// stack: the innermost blocker's own task first (it must not starve),
    /// then the union of every frame's dependency closure, scanned
    /// round-robin from a rotating cursor.
    pub(crate) fn next_admissible_main_job(&mut self) -> Option<Job> {
        if self.blockers.is_empty() {
            return None;
        }
        self.refresh_blocker_caches();

        let innermost = self
            .blockers
            .last()
            .expect("blocker stack checked non-empty")
            .root;
        if let Some(job) = self
            .tasks
            .get_mut(&innermost)
            .and_then(|record| record.main_queue.pop())
        {
            return Some(job);
        }

        let mut admitted: Vec<Id> = self
            .blockers
            .iter()
            .flat_map(|frame| frame.cache.iter().copied())
            .collect();
        admitted.sort_unstable();
        admitted.dedup();
        if admitted.is_empty() {
            return None;
        }

        let n = admitted.len();
        let start = self.rotation % n;
        for k in 0..n {
            let id = admitted[(start + k) % n];
            if let Some(job) = self
                .tasks
                .get_mut(&id)
                .and_then(|record| record.main_queue.pop())
            {
                self.rotation = (start + k + 1) % n;
                return Some(job);
            }
        }
        None
    }

    /// Picks a main-thread job for the host loop: with no blocker active,
    /// every task's queue is eligible (filtering only applies while the main
    /// thread is blocked).
    pub(crate) fn host_drain_job(&mut self) -> Option<Job> {
        if !self.blockers.is_empty() {
            return None;
        }
        let mut eligible: Vec<Id> = self
            .tasks
            .iter()
            .filter(|(_, record)| !record.main_queue.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_unstable();

        let n = eligible.len();
        let start = self.rotation % n;
        let id = eligible[start];
        self.rotation = (start + 1) % n;
        self.tasks
            .get_mut(&id)
            .and_then(|record| record.main_queue.pop())
    }

    fn refresh_blocker_caches(&mut self) {
        for i in 0..self.blockers.len() {
            if self.blockers[i].cache_version != Some(self.version) {
                let root = self.blockers[i].root;
                let cache = self.closure_of(root);
                let version = self.version;
                let frame = &mut self.blockers[i];
                frame.cache = cache;
                frame.cache_version = Some(version);
            }
        }
    }

    /// The transitive dependency closure of `root`: everything reachable
    /// through child links, direct joins, and joined collections'
    /// memberships. Deduplicated by id, so join cycles terminate.
    pub(crate) fn closure_of(&self, root: Id) -> HashSet<Id> {
        let mut seen = HashSet::new();
        let mut frontier: SmallVec<[Id; 16]> = SmallVec::new();
        frontier.push(root);

        while let Some(id) = frontier.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(record) = self.tasks.get(&id) else {
                continue;
            };
            frontier.extend(record.children.iter().copied());
            frontier.extend(record.joins.keys().copied());
            for collection in record.joined_collections.keys() {
                if let Some(collection_record) = self.collections.get(collection) {
                    frontier.extend(collection_record.members.keys().copied());
                }
            }
        }
        seen
    }

    // --- join edges ---

    pub(crate) fn add_join_edge(&mut self, from: Id, to: Id) {
        if let Some(record) = self.tasks.get_mut(&from) {
            *record.joins.entry(to).or_insert(0) += 1;
            self.bump();
        }
    }

    pub(crate) fn release_join_edge(&mut self, from: Id, to: Id) {
        if let Some(record) = self.tasks.get_mut(&from)
            && let Some(count) = record.joins.get_mut(&to)
        {
            *count -= 1;
            if *count == 0 {
                record.joins.remove(&to);
            }
            self.bump();
        }
    }

    // --- collections ---

    pub(crate) fn create_collection(&mut self, display_name: Option<String>) -> CollectionId {
        let id = CollectionId::next();
        self.collections.insert(
            id,
            CollectionRecord {
                display_name,
                ..Default::default()
            },
        );
        id
    }

    pub(crate) fn drop_collection(&mut self, id: CollectionId) {
        if let Some(record) = self.collections.remove(&id) {
            for member in record.members.keys() {
                if let Some(task) = self.tasks.get_mut(member) {
                    task.memberships.remove(&id);
                }
            }
            self.bump();
        }
    }

    pub(crate) fn collection(&self, id: CollectionId) -> Option<&CollectionRecord> {
        self.collections.get(&id)
    }

    pub(crate) fn add_member(&mut self, collection: CollectionId, task: Id) {
        if !self.tasks.contains_key(&task) {
            return;
        }
        if let Some(record) = self.collections.get_mut(&collection) {
            *record.members.entry(task).or_insert(0) += 1;
            self.tasks
                .get_mut(&task)
                .expect("membership checked above")
                .memberships
                .insert(collection);
            self.bump();
        }
    }

    pub(crate) fn remove_member(&mut self, collection: CollectionId, task: Id) {
        if let Some(record) = self.collections.get_mut(&collection)
            && let Some(count) = record.members.get_mut(&task)
        {
            *count -= 1;
            if *count == 0 {
                record.members.remove(&task);
                if let Some(task_record) = self.tasks.get_mut(&task) {
                    task_record.memberships.remove(&collection);
                }
            }
            self.bump();
        }
    }

    pub(crate) fn join_collection(&mut self, joiner: Id, collection: CollectionId) {
        if let Some(record) = self.tasks.get_mut(&joiner) {
            *record.joined_collections.entry(collection).or_insert(0) += 1;
        }
        if let Some(record) = self.collections.get_mut(&collection) {
            *record.joiners.entry(joiner).or_insert(0) += 1;
        }
        self.bump();
    }

    pub(crate) fn release_collection_join(&mut self, joiner: Id, collection: CollectionId) {
        if let Some(record) = self.tasks.get_mut(&joiner)
            && let Some(count) = record.joined_collections.get_mut(&collection)
        {
            *count -= 1;
            if *count == 0 {
                record.joined_collections.remove(&collection);
            }
        }
        if let Some(record) = self.collections.get_mut(&collection)
            && let Some(count) = record.joiners.get_mut(&joiner)
        {
            *count -= 1;
            if *count == 0 {
                record.joiners.remove(&joiner);
            }
        }
        self.bump();
    }
}
