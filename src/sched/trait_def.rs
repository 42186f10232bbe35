//! Scheduler trait definition.

use crate::errors::ThreadResult;
use crate::thread::ThreadId;

/// Counters kept by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Threads put on the ready queue (spawn, yield, unblock)
    pub enqueued: u64,
    /// Threads handed out by `pick_next`
    pub picked: u64,
    /// Threads currently waiting on the ready queue
    pub runnable: usize,
}

/// Ready-queue policy.
///
/// Holds handles of `Ready` threads that are not running. The runtime calls
/// every method with preemption disabled.
pub trait Scheduler {
    /// Make a ready thread eligible to run.
    ///
    /// Called for newly spawned threads, threads yielding (voluntarily or
    /// because the preemption timer fired) and threads being unblocked.
    fn enqueue(&mut self, thread: ThreadId) -> ThreadResult<()>;

    /// Take the next thread to run, or `None` if nothing is ready.
    fn pick_next(&mut self) -> Option<ThreadId>;

    /// Number of threads waiting to run.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scheduler statistics.
    fn stats(&self) -> SchedStats {
        SchedStats {
            runnable: self.len(),
            ..SchedStats::default()
        }
    }
}
