//! Cross-module tests.
//!
//! Tests that arm the real interval timer hold [`timer_lock`] for their
//! whole run: the timer and the signal disposition are process-wide.

mod integration;

use std::sync::{Mutex, MutexGuard};

/// Shared sizing for the heavier tests.
pub(crate) struct TestConfig {
    pub(crate) stress_thread_count: usize,
    pub(crate) iterations: usize,
    /// Timer frequency used by preemptive tests
    pub(crate) hz: u32,
}

pub(crate) static TEST_CONFIG: spin::Mutex<TestConfig> = spin::Mutex::new(TestConfig {
    stress_thread_count: 64,
    iterations: 200,
    hz: 1000,
});

static TIMER: Mutex<()> = Mutex::new(());

/// Serialise use of the process-wide interval timer.
pub(crate) fn timer_lock() -> MutexGuard<'static, ()> {
    // A failed test must not wedge the others.
    TIMER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
