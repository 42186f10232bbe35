//! Runtime configuration.

use crate::errors::{ThreadResult, TimerError};
use crate::mem::StackSizeClass;

/// Preemption timer frequency in Hz (10 ms time slices).
pub const TIMER_FREQUENCY_HZ: u32 = 100;

/// Highest accepted timer frequency: one tick per microsecond.
pub const MAX_TIMER_FREQUENCY_HZ: u32 = 1_000_000;

/// Settings for one [`Runtime::run_with`](crate::Runtime::run_with) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Arm the interval timer and force yields at `hz`
    pub preempt: bool,
    /// Forced-yield frequency
    pub hz: u32,
    /// Stack size for threads spawned without an explicit size
    pub stack_size: StackSizeClass,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preempt: false,
            hz: TIMER_FREQUENCY_HZ,
            stack_size: StackSizeClass::Large,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preempt(mut self, preempt: bool) -> Self {
        self.preempt = preempt;
        self
    }

    pub fn hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    pub fn stack_size(mut self, stack_size: StackSizeClass) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Check the values before anything is allocated or armed.
    pub fn validate(&self) -> ThreadResult<()> {
        if self.hz == 0 || self.hz > MAX_TIMER_FREQUENCY_HZ {
            return Err(TimerError::InvalidFrequency(self.hz).into());
        }
        Ok(())
    }

    /// Timer period in microseconds.
    pub fn interval_us(&self) -> u64 {
        1_000_000 / u64::from(self.hz.max(1))
    }
}
