//! Named sets of joinable tasks, used as the unit of dependency admission.
//!
//! A synchronously blocked caller that has a collection joined admits the
//! main-thread work of every member (and of everything those members reach
//! in turn). Membership is refcounted; join scopes are edge-counted, so
//! nested and concurrent joins compose and closing them all restores the
//! baseline.

use crate::context::ContextInner;
use crate::context::ambient;
use crate::context::state::CollectionId;
use crate::task::JoinHandle;
use crate::task::Id;
use std::fmt;
use std::sync::Arc;

/// Owns the collection record; the last clone dropping it removes the
/// record from the context.
pub(crate) struct CollectionGuard {
    ctx: Arc<ContextInner>,
    id: CollectionId,
}

impl CollectionGuard {
    pub(crate) fn id(&self) -> CollectionId {
        self.id
    }
}

impl Drop for CollectionGuard {
    fn drop(&mut self) {
        self.ctx.state.lock().drop_collection(self.id);
    }
}

/// A named set of joinable tasks. Cheap to clone; clones share one record,
/// which lives until the last clone (and the last factory over it) drops.
#[derive(Clone)]
pub struct TaskCollection {
    guard: Arc<CollectionGuard>,
}

impl TaskCollection {
    pub(crate) fn new(ctx: Arc<ContextInner>, display_name: Option<String>) -> Self {
        let id = ctx.state.lock().create_collection(display_name);
        Self {
            guard: Arc::new(CollectionGuard { ctx, id }),
        }
    }

    pub(crate) fn guard(&self) -> &Arc<CollectionGuard> {
        &self.guard
    }

    pub(crate) fn id(&self) -> CollectionId {
        self.guard.id
    }

    fn ctx(&self) -> &Arc<ContextInner> {
        &self.guard.ctx
    }

    pub fn display_name(&self) -> Option<String> {
        self.ctx()
            .state
            .lock()
            .collection(self.id())
            .and_then(|record| record.display_name.clone())
    }

    /// Adds a running task to the collection. Refcounted: adding twice
    /// requires removing twice. Completed tasks are not added.
    pub fn add<T>(&self, handle: &JoinHandle<T>) {
        self.ctx().state.lock().add_member(self.id(), handle.id());
        // Admission may have widened for an already-blocked pump.
        self.ctx().wake.notify_all();
    }

    /// Removes one membership count for the task.
    pub fn remove<T>(&self, handle: &JoinHandle<T>) {
        self.ctx().state.lock().remove_member(self.id(), handle.id());
    }

    pub fn contains<T>(&self, handle: &JoinHandle<T>) -> bool {
        self.ctx()
            .state
            .lock()
            .collection(self.id())
            .is_some_and(|record| record.members.contains_key(&handle.id()))
    }

    /// Opens a join scope: until the guard drops, the joining task admits
    /// every member's main-thread work (members added later included).
    ///
    /// The joiner is the ambient task, or, when called on the main thread
    /// outside any task, the innermost synchronous blocker. With neither,
    /// the guard is inert.
    pub fn join(&self) -> JoinGuard {
        let ctx = self.ctx();
        let joiner = ambient::current_task()
            .filter(|core| Arc::ptr_eq(&core.ctx, ctx))
            .map(|core| core.id)
            .or_else(|| {
                if ctx.is_main_thread() {
                    ctx.state.lock().innermost_main_blocker()
                } else {
                    None
                }
            });

        if let Some(joiner) = joiner {
            ctx.state.lock().join_collection(joiner, self.id());
            // The blocked pump re-derives its admission set on wake.
            ctx.wake.notify_all();
        }
        JoinGuard {
            ctx: ctx.clone(),
            collection: self.id(),
            joiner,
        }
    }

    #[cfg(test)]
    pub(crate) fn join_edge_count(&self) -> usize {
        self.ctx()
            .state
            .lock()
            .collection(self.id())
            .map_or(0, |record| record.joiners.values().sum())
    }

    #[cfg(test)]
    pub(crate) fn member_ids(&self) -> Vec<Id> {
        self.ctx()
            .state
            .lock()
            .collection(self.id())
            .map_or_else(Vec::new, |record| record.members.keys().copied().collect())
    }
}

impl fmt::Debug for TaskCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCollection")
            .field("display_name", &self.display_name())
            .finish()
    }
}


/// Open join scope over a collection; closing it removes the edges it
/// added.
#[must_use = "the join lasts only until the guard drops"]
pub struct JoinGuard {
    ctx: Arc<ContextInner>,
    collection: CollectionId,
    joiner: Option<Id>,
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        if let Some(joiner) = self.joiner {
            self.ctx
                .state
                .lock()
                .release_collection_join(joiner, self.collection);
            self.ctx.wake.notify_all();
        }
    }
}

impl fmt::Debug for JoinGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinGuard")
            .field("joiner", &self.joiner)
            .finish()
    }
}
