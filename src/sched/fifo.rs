//! Strict FIFO scheduler: among ready threads, the longest-waiting runs next.

use super::trait_def::{SchedStats, Scheduler};
use crate::errors::ThreadResult;
use crate::queue::Queue;
use crate::thread::ThreadId;

/// First-in first-out ready queue.
#[derive(Default)]
pub struct FifoScheduler {
    ready: Queue<ThreadId>,
    enqueued: u64,
    picked: u64,
}

impl FifoScheduler {
    pub const fn new() -> Self {
        Self {
            ready: Queue::new(),
            enqueued: 0,
            picked: 0,
        }
    }

    /// Ready threads in the order they will run.
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready.iter().copied()
    }
}

impl Scheduler for FifoScheduler {
    fn enqueue(&mut self, thread: ThreadId) -> ThreadResult<()> {
        self.ready.enqueue(thread)?;
        self.enqueued += 1;
        Ok(())
    }

    fn pick_next(&mut self) -> Option<ThreadId> {
        let next = self.ready.dequeue()?;
        self.picked += 1;
        Some(next)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }

    fn stats(&self) -> SchedStats {
        SchedStats {
            enqueued: self.enqueued,
            picked: self.picked,
            runnable: self.ready.len(),
        }
    }
}
