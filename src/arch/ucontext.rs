//! Context switching on top of glibc's `getcontext`/`makecontext`/`swapcontext`.
//!
//! `swapcontext` also saves and restores the signal mask, so every thread
//! carries its own view of whether the preemption signal is blocked.

use super::Arch;
use crate::errors::{fatal, ArchError};
use crate::mem::Stack;
use core::ptr;

/// Saved thread context.
#[repr(transparent)]
pub struct UContext(libc::ucontext_t);

impl Default for UContext {
    fn default() -> Self {
        // SAFETY: ucontext_t is plain data; all-zero is a valid (empty) value
        // that is only ever written by getcontext/swapcontext before use.
        Self(unsafe { core::mem::zeroed() })
    }
}

/// Host implementation of [`Arch`].
pub struct UcontextArch;

impl Arch for UcontextArch {
    type SavedContext = UContext;

    unsafe fn init_context(
        ctx: *mut UContext,
        stack: &Stack,
        entry: extern "C" fn(),
    ) -> Result<(), ArchError> {
        // SAFETY: the caller guarantees `ctx` is valid and pinned.
        let uc = unsafe { &mut (*ctx).0 };
        // SAFETY: `uc` is a valid ucontext_t.
        if unsafe { libc::getcontext(uc) } != 0 {
            return Err(ArchError::ContextInitFailed(last_errno()));
        }
        uc.uc_stack.ss_sp = stack.base().cast();
        uc.uc_stack.ss_size = stack.size();
        uc.uc_stack.ss_flags = 0;
        uc.uc_link = ptr::null_mut();
        // SAFETY: the stack outlives the context; entry takes no arguments.
        unsafe { libc::makecontext(uc, entry, 0) };
        Ok(())
    }

    unsafe fn context_switch(prev: *mut UContext, next: *const UContext) {
        // SAFETY: the caller guarantees both contexts are valid.
        let rc = unsafe { libc::swapcontext(ptr::addr_of_mut!((*prev).0), ptr::addr_of!((*next).0)) };
        if rc != 0 {
            fatal("swapcontext failed");
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
