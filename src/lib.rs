#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! User-level preemptive green threads for Linux.
//!
//! Many logical threads are multiplexed onto the single OS thread that calls
//! [`run`]. Threads switch cooperatively through [`yield_now`], [`block`]
//! and [`exit`], and optionally involuntarily: with preemption enabled a
//! virtual-time interval timer fires `SIGVTALRM` and the handler forces the
//! running thread to yield.
//!
//! # Target Platform
//!
//! - **OS**: Linux with glibc (`getcontext`/`makecontext`/`swapcontext`)
//! - **Preemption**: `setitimer(ITIMER_VIRTUAL)`, one preemptive runtime per
//!   process at a time
//!
//! # Quick Start
//!
//! ```no_run
//! use preemptive_uthreads::{run, spawn, Semaphore};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let counter = Rc::new(Cell::new(0));
//! let total = counter.clone();
//! run(true, move || {
//!     let lock = Rc::new(Semaphore::new(1));
//!     for _ in 0..4 {
//!         let (lock, counter) = (lock.clone(), counter.clone());
//!         spawn(move || {
//!             lock.down().unwrap();
//!             counter.set(counter.get() + 1);
//!             lock.up();
//!         })
//!         .unwrap();
//!     }
//! })
//! .unwrap();
//! assert_eq!(total.get(), 4);
//! ```
//!
//! # Architecture
//!
//! - A strict FIFO ready queue behind the [`Scheduler`] trait
//! - Thread control blocks owned by the [`Runtime`], addressed by [`ThreadId`]
//! - Size-classed stacks recycled through a [`StackPool`]
//! - Masking the timer signal as the only mutual exclusion

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod mem;
pub mod preempt;
pub mod queue;
pub mod runtime;
pub mod sched;
pub mod semaphore;
pub mod thread;

#[cfg(test)]
mod tests;

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, DefaultArch};

// Runtime
pub use config::RuntimeConfig;
pub use runtime::{RunStats, Runtime};

// Scheduler
pub use sched::{FifoScheduler, Scheduler};

// Threads
pub use thread::{ThreadBuilder, ThreadId, ThreadState};

// Synchronization
pub use queue::Queue;
pub use semaphore::Semaphore;

// Memory management
pub use mem::{Stack, StackPool, StackSizeClass};

// Errors
pub use errors::{DestroyError, ThreadError, ThreadResult};

// ============================================================================
// Convenience Functions
// ============================================================================

/// Run `entry` as the first green thread on the calling OS thread.
///
/// Returns once no thread is ready to run. See [`Runtime::run`].
pub fn run<F>(preempt: bool, entry: F) -> ThreadResult<RunStats>
where
    F: FnOnce() + 'static,
{
    Runtime::run(preempt, entry)
}

/// Spawn a thread on the current runtime.
///
/// The new thread is appended to the ready queue; the caller keeps running.
pub fn spawn<F>(f: F) -> ThreadResult<ThreadId>
where
    F: FnOnce() + 'static,
{
    ThreadBuilder::new().spawn(f)
}

/// Yield the current thread's time slice to the scheduler.
///
/// This is a cooperative yield: the thread stays runnable and goes to the
/// back of the ready queue. Does nothing outside a runtime.
#[inline]
pub fn yield_now() {
    Runtime::with_current(Runtime::yield_now);
}

/// Terminate the current thread.
///
/// Unwinds the thread's stack first, dropping its locals and captures.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub fn exit() -> ! {
    runtime::exit_current()
}

/// Block the current thread until [`unblock`] is called with its ID.
///
/// Does nothing outside a runtime.
pub fn block() {
    Runtime::with_current(Runtime::block);
}

/// Make a blocked thread ready. Returns `false` if it was not blocked.
pub fn unblock(id: ThreadId) -> bool {
    Runtime::with_current(|rt| rt.unblock(id)).unwrap_or(false)
}

/// ID of the running thread, or `None` outside a runtime.
pub fn current_thread() -> Option<ThreadId> {
    Runtime::with_current(Runtime::current)
}
