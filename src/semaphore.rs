//! Counting semaphore built on the runtime's block/unblock.
//!
//! Every read or write of the count and the wait list happens with
//! preemption disabled. A thread that waits stays inside its critical
//! section across `block`: the switch hands the next thread its own depth
//! and mask, and this thread gets its own back when it is resumed.

use crate::errors::{fatal, DestroyError, ThreadError, ThreadResult};
use crate::preempt;
use crate::queue::Queue;
use crate::runtime::Runtime;
use crate::thread::ThreadId;
use core::marker::PhantomData;

struct SemInner {
    count: usize,
    /// Blocked threads in arrival order, except that a woken thread that
    /// lost its unit goes back to the front
    waiting: Queue<ThreadId>,
}

/// Counting semaphore for green threads.
///
/// Bound to the OS thread running the runtime; share it between threads
/// with `Rc`.
pub struct Semaphore {
    inner: spin::Mutex<SemInner>,
    _not_send: PhantomData<*const ()>,
}

impl Semaphore {
    /// Create a semaphore holding `count` units.
    pub const fn new(count: usize) -> Self {
        Self {
            inner: spin::Mutex::new(SemInner {
                count,
                waiting: Queue::new(),
            }),
            _not_send: PhantomData,
        }
    }

    /// Destroy the semaphore.
    ///
    /// Fails and hands the semaphore back while any thread is waiting on it;
    /// waiters are never woken by a destroy.
    pub fn destroy(self) -> Result<(), DestroyError<Self>> {
        if self.waiters() > 0 {
            return Err(DestroyError::new(self));
        }
        Ok(())
    }

    /// Units currently available.
    pub fn count(&self) -> usize {
        let _cs = preempt::critical();
        self.lock().count
    }

    /// Threads blocked in [`down`](Self::down).
    pub fn waiters(&self) -> usize {
        let _cs = preempt::critical();
        self.lock().waiting.len()
    }

    /// Take a unit if one is available, without blocking.
    pub fn try_down(&self) -> bool {
        let _cs = preempt::critical();
        self.take_unit()
    }

    /// Acquire one unit, blocking the calling thread until one is available.
    ///
    /// Outside a runtime only an available unit can be taken; anything else
    /// fails since there is no thread to block.
    pub fn down(&self) -> ThreadResult<()> {
        Runtime::with_current(|rt| self.down_on(rt)).unwrap_or_else(|| {
            if self.try_down() {
                Ok(())
            } else {
                Err(ThreadError::no_runtime())
            }
        })
    }

    fn down_on(&self, rt: &Runtime) -> ThreadResult<()> {
        let _cs = rt.preemption().critical();
        if self.take_unit() {
            return Ok(());
        }

        let me = rt.current();
        if me == rt.idle() {
            return Err(ThreadError::InvalidArgument("idle thread cannot wait"));
        }
        self.lock().waiting.enqueue(me)?;
        log::trace!("thread {} waiting on semaphore", me);
        rt.block();

        // Woken by `up`, but a thread scheduled ahead of us may have taken
        // the unit. Wait again at the head of the line.
        while !self.take_unit() {
            self.lock().waiting.enqueue_front(me)?;
            rt.block();
        }
        Ok(())
    }

    /// Release one unit and wake the longest-waiting thread, if any.
    pub fn up(&self) {
        let _cs = preempt::critical();
        let next = {
            let mut inner = self.lock();
            inner.count += 1;
            inner.waiting.dequeue()
        };
        if let Some(id) = next {
            Runtime::with_current(|rt| rt.unblock(id));
        }
    }

    fn take_unit(&self) -> bool {
        let mut inner = self.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> spin::MutexGuard<'_, SemInner> {
        self.inner
            .try_lock()
            .unwrap_or_else(|| fatal("semaphore state re-entered"))
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.inner.get_mut().waiting.iterate(|_, id| {
            log::warn!("semaphore dropped while thread {} waits on it", id);
        });
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("waiters", &self.waiters())
            .finish()
    }
}
