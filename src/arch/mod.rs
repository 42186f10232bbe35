//! Architecture abstraction layer for context switching.
//!
//! The runtime treats saving and restoring execution state as an opaque
//! capability behind the [`Arch`] trait. On Linux/glibc hosts the capability
//! is provided by the `ucontext` family of calls.

use crate::errors::ArchError;
use crate::mem::Stack;

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations switch stacks and registers underneath the compiler.
/// Every method marked `unsafe` has preconditions the caller must uphold.
pub trait Arch {
    /// Saved execution state of one thread.
    ///
    /// Contexts may be self-referential once initialised and must not move
    /// afterwards; the runtime keeps them inside heap-allocated thread
    /// control blocks.
    type SavedContext: Default;

    /// Prepare `ctx` so that switching to it runs `entry` on `stack`.
    ///
    /// `entry` must never return. The new context inherits the caller's
    /// signal mask.
    ///
    /// # Safety
    ///
    /// - `ctx` must point to a valid SavedContext that will not move
    /// - `stack` must outlive every execution of the context
    unsafe fn init_context(
        ctx: *mut Self::SavedContext,
        stack: &Stack,
        entry: extern "C" fn(),
    ) -> Result<(), ArchError>;

    /// Save the running state into `prev` and resume `next`.
    ///
    /// Returns only when some later switch resumes `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` and `next` must point to valid, distinct SavedContexts
    /// - `next` must have been initialised by `init_context` or saved by a
    ///   previous switch
    /// - Must be called with preemption disabled
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext);
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub mod ucontext;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub use ucontext::UcontextArch as DefaultArch;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("preemptive-uthreads needs the glibc ucontext API; build for a *-linux-gnu target.");
