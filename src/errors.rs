//! Error handling for the green-thread runtime.
//!
//! Every fallible operation reports synchronously through [`ThreadResult`].
//! Conditions that mean the scheduler's own invariants are broken are not
//! errors: they go through [`fatal`] and abort the process.

#![allow(clippy::uninlined_format_args)]

use core::fmt;

/// Result type for runtime operations.
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Error type for all runtime operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Stack, control block or queue node allocation failed
    Memory(MemoryError),
    /// An argument or calling context the operation cannot accept
    InvalidArgument(&'static str),
    /// Destroying a queue or semaphore that still has elements or waiters
    NonEmptyDestroy,
    /// Delete-by-identity did not find the element
    NotFound,
    /// Preemption timer setup errors
    Timer(TimerError),
    /// Context-switch primitive errors
    Arch(ArchError),
}

/// Memory-related errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Out of memory
    OutOfMemory,
    /// Stack overflow detected
    StackOverflow,
    /// Invalid memory layout
    InvalidLayout,
}

/// Interval timer and signal disposition errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Another runtime in this process already owns the interval timer
    AlreadyRunning,
    /// Frequency outside `1..=1_000_000` Hz
    InvalidFrequency(u32),
    /// An OS call failed
    Os {
        /// Name of the failing call
        call: &'static str,
        /// `errno` reported by the call
        errno: i32,
    },
}

/// Context-switch primitive errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchError {
    /// Capturing or initialising an execution context failed
    ContextInitFailed(i32),
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::Memory(e) => write!(f, "Memory error: {}", e),
            ThreadError::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            ThreadError::NonEmptyDestroy => write!(f, "Cannot destroy a container that is not empty"),
            ThreadError::NotFound => write!(f, "Element not found"),
            ThreadError::Timer(e) => write!(f, "Timer error: {}", e),
            ThreadError::Arch(e) => write!(f, "Architecture error: {}", e),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "Out of memory"),
            MemoryError::StackOverflow => write!(f, "Stack overflow detected"),
            MemoryError::InvalidLayout => write!(f, "Invalid memory layout"),
        }
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::AlreadyRunning => write!(f, "Interval timer already owned by another runtime"),
            TimerError::InvalidFrequency(hz) => write!(f, "Invalid timer frequency: {} Hz", hz),
            TimerError::Os { call, errno } => write!(f, "{} failed with errno {}", call, errno),
        }
    }
}

impl fmt::Display for ArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchError::ContextInitFailed(errno) => {
                write!(f, "Context initialisation failed with errno {}", errno)
            }
        }
    }
}

impl std::error::Error for ThreadError {}

impl From<MemoryError> for ThreadError {
    fn from(error: MemoryError) -> Self {
        ThreadError::Memory(error)
    }
}

impl From<TimerError> for ThreadError {
    fn from(error: TimerError) -> Self {
        ThreadError::Timer(error)
    }
}

impl From<ArchError> for ThreadError {
    fn from(error: ArchError) -> Self {
        ThreadError::Arch(error)
    }
}

impl ThreadError {
    /// Create an allocation failure error.
    pub fn allocation_failure() -> Self {
        ThreadError::Memory(MemoryError::OutOfMemory)
    }

    /// Error for operations that need a runtime on the calling OS thread.
    pub fn no_runtime() -> Self {
        ThreadError::InvalidArgument("no runtime is running on this OS thread")
    }
}

/// Failed `destroy` of a non-empty container.
///
/// Hands the container back so the caller can drain it and retry.
pub struct DestroyError<T> {
    inner: T,
}

impl<T> DestroyError<T> {
    pub(crate) fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Recover the container that could not be destroyed.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> fmt::Debug for DestroyError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for DestroyError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&ThreadError::NonEmptyDestroy, f)
    }
}

impl<T> From<DestroyError<T>> for ThreadError {
    fn from(_: DestroyError<T>) -> Self {
        ThreadError::NonEmptyDestroy
    }
}

/// Abort on a broken scheduler invariant.
///
/// Used where continuing would run on a corrupted context or stack.
#[cold]
pub(crate) fn fatal(what: impl fmt::Display) -> ! {
    log::error!("fatal runtime error: {}", what);
    std::process::abort()
}
