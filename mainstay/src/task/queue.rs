use crate::events::TransitionPending;
use crate::factory::switch::SwitchCore;
use crate::task::core::TaskCore;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// A unit of main-thread (or pool) work owned by a joinable task.
///
/// Jobs are stored in per-task queues and executed by whichever thread is
/// entitled to them: the re-entrant pump of a synchronous blocker, the host
/// dispatcher when nothing is blocked, or a worker draining its own task's
/// pool queue.
pub(crate) struct Job {
    /// The task whose identity is ambient while the job executes.
    pub(crate) owner: Arc<TaskCore>,

    pub(crate) work: Work,

    /// Present on switch-to-main grants. Claimed before execution; a claim
    /// that fails means the request was cancelled and the job is a tombstone
    /// that must not run.
    pub(crate) switch: Option<Arc<SwitchCore>>,

    /// Present when dispatching this job moves the owner's execution onto
    /// the main thread from another thread. Balanced by the pump after the
    /// job runs, or by drop if the job is never delivered.
    pub(crate) transition: Option<TransitionPending>,
}

pub(crate) enum Work {
    /// Poll the owner task's future on the executing thread.
    Poll,

    /// Run an arbitrary posted callback under the owner's identity.
    Run(Box<dyn FnOnce() + Send>),
}

impl Job {
    pub(crate) fn poll(owner: Arc<TaskCore>) -> Self {
        Job {
            owner,
            work: Work::Poll,
            switch: None,
            transition: None,
        }
    }

    pub(crate) fn run(owner: Arc<TaskCore>, f: Box<dyn FnOnce() + Send>) -> Self {
        Job {
            owner,
            work: Work::Run(f),
            switch: None,
            transition: None,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("owner", &self.owner.id)
            .field("is_poll", &matches!(self.work, Work::Poll))
            .finish()
    }
}

/// The single-execution queue: a FIFO of pending jobs behind a closed gate.
///
/// Once closed, further pushes are refused (the job is handed back to the
/// caller, which decides whether to drop it or fall back to the host sink)
/// and the undelivered backlog is returned so it can be dropped outside the
/// context lock.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    items: VecDeque<Job>,
    closed: bool,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a job, or returns it unchanged if the gate is closed.
    pub(crate) fn push(&mut self, job: Job) -> Result<(), Job> {
        if self.closed {
            return Err(job);
        }
        self.items.push_back(job);
        Ok(())
    }

    /// Pops the next job in FIFO order.
    pub(crate) fn pop(&mut self) -> Option<Job> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Closes the gate and returns every undelivered job.
    pub(crate) fn close(&mut self) -> Vec<Job> {
        self.closed = true;
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::context_on_current_thread;

    #[test]
    fn test_queue_is_fifo() {
        let (ctx, _dispatcher) = context_on_current_thread();
        let core = ctx.inner().new_detached_core(None);

        let mut q = WorkQueue::new();
        for _ in 0..3 {
            q.push(Job::poll(core.clone())).unwrap();
        }
        q.push(Job::run(core.clone(), Box::new(|| {}))).unwrap();

        for _ in 0..3 {
            assert!(matches!(q.pop().unwrap().work, Work::Poll));
        }
        assert!(matches!(q.pop().unwrap().work, Work::Run(_)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_closed_gate_refuses_pushes() {
        let (ctx, _dispatcher) = context_on_current_thread();
        let core = ctx.inner().new_detached_core(None);

        let mut q = WorkQueue::new();
        q.push(Job::poll(core.clone())).unwrap();
        q.push(Job::poll(core.clone())).unwrap();

        let undelivered = q.close();
        assert_eq!(undelivered.len(), 2);
        assert!(q.push(Job::poll(core)).is_err());
        assert!(q.is_empty());
    }
}
