//! Thread control blocks and their identifiers.
//!
//! A [`Tcb`] is the authoritative record of one logical thread. The runtime
//! owns every TCB in its arena; queues only ever hold [`ThreadId`] handles.

use crate::arch::{Arch, DefaultArch};
use crate::errors::MemoryError;
use crate::mem::{Stack, STACK_CANARY};
use core::cell::{Cell, UnsafeCell};

pub mod builder;

pub use builder::ThreadBuilder;

/// Unique identifier for threads.
///
/// Thread IDs are never reused within a runtime and are guaranteed to be
/// non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(core::num::NonZeroUsize);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "T{:03}", self.0)
    }
}

impl ThreadId {
    /// ID of the first thread of every runtime, its idle thread.
    pub(crate) const FIRST: ThreadId = ThreadId(core::num::NonZeroUsize::MIN);

    /// Create a thread ID from a raw value, or `None` for zero.
    pub fn new(id: usize) -> Option<Self> {
        core::num::NonZeroUsize::new(id).map(Self)
    }

    /// Get the raw ID value.
    pub fn get(self) -> usize {
        self.0.get()
    }

    pub(crate) fn next(self) -> Self {
        ThreadId(self.0.saturating_add(1))
    }
}

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On the ready queue, waiting to be picked
    Ready,
    /// Currently running; exactly one thread is in this state
    Running,
    /// Waiting for an explicit unblock
    Blocked,
    /// Finished; never scheduled again
    Exited,
}

/// Body of a spawned thread.
///
/// Runs at most once. `FnMut` so the runtime can free the box at a point of
/// its choosing after the body returns.
pub(crate) type Entry = Box<dyn FnMut() + 'static>;

/// Thread control block.
///
/// Only ever reached through a shared reference while preemption is
/// disabled, hence the cells.
pub struct Tcb {
    id: ThreadId,
    name: Option<String>,
    state: Cell<ThreadState>,
    context: UnsafeCell<<DefaultArch as Arch>::SavedContext>,
    stack: Cell<Option<Stack>>,
    entry: Cell<Option<Entry>>,
}

impl Tcb {
    /// Control block for a spawned thread, `Ready` and not yet started.
    pub(crate) fn new(id: ThreadId, name: Option<String>, stack: Stack, entry: Entry) -> Self {
        Self {
            id,
            name,
            state: Cell::new(ThreadState::Ready),
            context: UnsafeCell::new(Default::default()),
            stack: Cell::new(Some(stack)),
            entry: Cell::new(Some(entry)),
        }
    }

    /// Control block standing in for the OS thread that called `run`.
    ///
    /// It owns no stack; its context is filled in by the first switch away.
    pub(crate) fn idle(id: ThreadId) -> Self {
        Self {
            id,
            name: Some(String::from("idle")),
            state: Cell::new(ThreadState::Running),
            context: UnsafeCell::new(Default::default()),
            stack: Cell::new(None),
            entry: Cell::new(None),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.set(state);
    }

    /// Raw pointer to the saved context.
    ///
    /// Stays valid for as long as the TCB is alive; TCBs never move.
    pub(crate) fn context_ptr(&self) -> *mut <DefaultArch as Arch>::SavedContext {
        self.context.get()
    }

    pub(crate) fn take_stack(&self) -> Option<Stack> {
        self.stack.take()
    }

    /// Run `f` against the stack, if the thread still owns one.
    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&Stack) -> R) -> Option<R> {
        let stack = self.stack.take();
        let result = stack.as_ref().map(f);
        self.stack.set(stack);
        result
    }

    /// Check the canary at the bottom of the thread's stack.
    ///
    /// Threads without a stack of their own always pass.
    pub(crate) fn check_stack(&self) -> Result<(), MemoryError> {
        match self.with_stack(|stack| stack.check_canary(STACK_CANARY)) {
            Some(false) => Err(MemoryError::StackOverflow),
            _ => Ok(()),
        }
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.take()
    }
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}
