//! Ready-queue policy.
//!
//! The runtime asks a [`Scheduler`] which thread runs next; the only policy
//! shipped is strict FIFO.

pub mod fifo;
pub mod trait_def;

pub use fifo::FifoScheduler;
pub use trait_def::{SchedStats, Scheduler};

/// Default scheduler type.
pub type DefaultScheduler = FifoScheduler;
