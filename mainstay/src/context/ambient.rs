//! The flow-local ambient slot.
//!
//! Task identity follows the task, not the thread: the slot is installed
//! around every poll of a task's future (and around posted callbacks running
//! under a task's identity), wherever that poll happens. Reading it from a
//! thread that is not currently executing a task yields `None`.

use crate::sync_context::SyncContext;
use crate::task::core::TaskCore;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static AMBIENT: RefCell<AmbientSlot> = RefCell::new(AmbientSlot::default());
}

#[derive(Default)]
struct AmbientSlot {
    task: Option<Arc<TaskCore>>,
    sync_context: Option<SyncContext>,
}

/// The task whose identity flows through the current execution segment, if
/// any. Hidden inside a relevance-suppression scope.
pub(crate) fn current_task() -> Option<Arc<TaskCore>> {
    AMBIENT.with(|slot| slot.borrow().task.clone())
}

/// The per-task post/send sink installed for the current execution segment.
pub(crate) fn current_sync_context() -> Option<SyncContext> {
    AMBIENT.with(|slot| slot.borrow().sync_context.clone())
}

/// Installs `core` as the ambient task (and its sync context as the current
/// one) until the guard drops.
pub(crate) fn enter_task(core: &Arc<TaskCore>) -> AmbientGuard {
    let sync_context = SyncContext::for_task(core.clone());
    AMBIENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        AmbientGuard {
            prev_task: slot.task.replace(core.clone()),
            prev_sync: slot.sync_context.replace(sync_context),
            restore_sync: true,
            _not_send: PhantomData,
        }
    })
}

/// Restores the previous ambient task (and sync context) on drop.
pub(crate) struct AmbientGuard {
    prev_task: Option<Arc<TaskCore>>,
    prev_sync: Option<SyncContext>,
    restore_sync: bool,
    _not_send: PhantomData<*const ()>,
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let prev_task = self.prev_task.take();
        let prev_sync = self.prev_sync.take();
        let restore_sync = self.restore_sync;
        AMBIENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            slot.task = prev_task;
            if restore_sync {
                slot.sync_context = prev_sync;
            }
        });
    }
}

/// Hides the ambient task until the guard drops. New tasks created inside
/// the scope do not attach to the hidden task, and switch requests made
/// inside it are treated as free-floating.
pub(crate) fn suppress() -> AmbientGuard {
    AMBIENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        AmbientGuard {
            prev_task: slot.task.take(),
            prev_sync: None,
            restore_sync: false,
            _not_send: PhantomData,
        }
    })
}
