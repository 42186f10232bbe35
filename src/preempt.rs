//! Preemption controller.
//!
//! A virtual-time interval timer raises `SIGVTALRM` at a fixed frequency and
//! the handler forces the running thread through the ordinary yield path.
//! Masking that one signal is the runtime's only mutual-exclusion mechanism:
//! code that touches the ready queue, the current-thread pointer or a
//! semaphore does so inside a [`CriticalSection`].
//!
//! Critical sections nest. The signal mask only changes when the outermost
//! section opens or closes, and every context switch carries the outgoing
//! thread's nesting depth with it (see `Runtime::reschedule`), matching
//! `swapcontext` carrying the signal mask.

use crate::config::RuntimeConfig;
use crate::errors::{ThreadResult, TimerError};
use crate::runtime::Runtime;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Set while some runtime in the process owns the interval timer.
///
/// The timer and the signal disposition are process-wide, so at most one
/// preemptive runtime can be active at a time.
static TIMER_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Timer signal.
const PREEMPT_SIGNAL: libc::c_int = libc::SIGVTALRM;

/// Counters kept by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreemptStats {
    /// Ticks delivered, real or simulated
    pub ticks: u64,
    /// Ticks that forced a yield
    pub forced_yields: u64,
    /// Ticks that landed inside a critical section
    pub deferred: u64,
}

/// Disposition and timer in place before `start`, restored by `stop`.
struct SavedDisposition {
    action: libc::sigaction,
    timer: libc::itimerval,
}

/// Per-runtime preemption state.
pub struct Preemption {
    active: AtomicBool,
    /// Critical section nesting depth of the running thread
    depth: AtomicUsize,
    /// A tick arrived while `depth > 0`
    pending: AtomicBool,
    mask: libc::sigset_t,
    saved: spin::Mutex<Option<SavedDisposition>>,
    ticks: AtomicU64,
    forced_yields: AtomicU64,
    deferred: AtomicU64,
}

impl Default for Preemption {
    fn default() -> Self {
        Self::new()
    }
}

impl Preemption {
    pub fn new() -> Self {
        // SAFETY: sigset_t is plain data and initialised by sigemptyset.
        let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, PREEMPT_SIGNAL);
        }
        Self {
            active: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            mask,
            saved: spin::Mutex::new(None),
            ticks: AtomicU64::new(0),
            forced_yields: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    /// Whether the interval timer is armed for this runtime.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Install the handler and arm the timer, if `config.preempt` is set.
    pub fn start(&self, config: &RuntimeConfig) -> ThreadResult<()> {
        if !config.preempt || self.is_active() {
            return Ok(());
        }
        config.validate()?;
        if TIMER_CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TimerError::AlreadyRunning.into());
        }

        // SAFETY: zeroed sigaction/itimerval are valid out-parameters.
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_timer_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        let mut old_action: libc::sigaction = unsafe { mem::zeroed() };
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        if unsafe { libc::sigaction(PREEMPT_SIGNAL, &action, &mut old_action) } != 0 {
            TIMER_CLAIMED.store(false, Ordering::Release);
            return Err(os_error("sigaction"));
        }

        let interval_us = config.interval_us();
        let period = libc::timeval {
            tv_sec: (interval_us / 1_000_000) as libc::time_t,
            tv_usec: (interval_us % 1_000_000) as libc::suseconds_t,
        };
        let timer = libc::itimerval {
            it_interval: period,
            it_value: period,
        };
        let mut old_timer: libc::itimerval = unsafe { mem::zeroed() };

        // Active before the first tick can fire.
        self.active.store(true, Ordering::Release);
        if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, &mut old_timer) } != 0 {
            let err = os_error("setitimer");
            self.active.store(false, Ordering::Release);
            unsafe { libc::sigaction(PREEMPT_SIGNAL, &old_action, ptr::null_mut()) };
            TIMER_CLAIMED.store(false, Ordering::Release);
            return Err(err);
        }

        *self.saved.lock() = Some(SavedDisposition {
            action: old_action,
            timer: old_timer,
        });
        log::debug!("preemption started at {} Hz", config.hz);
        Ok(())
    }

    /// Disarm the timer and restore the previous disposition.
    ///
    /// A no-op unless `start` armed the timer.
    pub fn stop(&self) {
        if !self.is_active() {
            return;
        }
        self.disable();

        if let Some(saved) = self.saved.lock().take() {
            // Ignoring the signal discards a tick that is already pending, so
            // restoring a default disposition cannot kill the process.
            // SAFETY: all structures are fully initialised.
            unsafe {
                if libc::setitimer(libc::ITIMER_VIRTUAL, &saved.timer, ptr::null_mut()) != 0 {
                    log::warn!("restoring interval timer failed: {}", os_error("setitimer"));
                }
                let mut ignore: libc::sigaction = mem::zeroed();
                ignore.sa_sigaction = libc::SIG_IGN;
                libc::sigemptyset(&mut ignore.sa_mask);
                libc::sigaction(PREEMPT_SIGNAL, &ignore, ptr::null_mut());
                if libc::sigaction(PREEMPT_SIGNAL, &saved.action, ptr::null_mut()) != 0 {
                    log::warn!("restoring signal disposition failed: {}", os_error("sigaction"));
                }
            }
        }

        self.active.store(false, Ordering::Release);
        self.pending.store(false, Ordering::Release);
        if self.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.set_blocked(false);
        }
        TIMER_CLAIMED.store(false, Ordering::Release);
        log::debug!("preemption stopped after {} ticks", self.ticks.load(Ordering::Relaxed));
    }

    /// Open a critical section: block the preemption signal.
    pub fn disable(&self) {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 && self.is_active() {
            self.set_blocked(true);
        }
    }

    /// Close a critical section.
    ///
    /// Closing the outermost section unblocks the signal and delivers a tick
    /// that was deferred while it was open.
    pub fn enable(&self) {
        match self.depth.load(Ordering::SeqCst) {
            0 => log::error!("preemption enabled without a matching disable"),
            1 => {
                self.depth.store(0, Ordering::SeqCst);
                if self.is_active() {
                    self.set_blocked(false);
                }
                if self.pending.swap(false, Ordering::AcqRel) {
                    self.forced_yields.fetch_add(1, Ordering::Relaxed);
                    Runtime::with_current(|rt| rt.forced_yield());
                }
            }
            _ => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Disable preemption until the returned guard is dropped.
    pub fn critical(&self) -> CriticalSection<'_> {
        self.disable();
        CriticalSection { preemption: self }
    }

    /// Current critical section nesting depth.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Reinstate the depth a thread had when it switched out.
    pub(crate) fn restore_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    /// Account for a tick and decide whether it forces a yield now.
    ///
    /// Only touches atomics, so it is safe to call from the signal handler.
    pub(crate) fn on_tick(&self) -> bool {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if self.depth.load(Ordering::SeqCst) > 0 {
            self.deferred.fetch_add(1, Ordering::Relaxed);
            self.pending.store(true, Ordering::Release);
            false
        } else {
            self.forced_yields.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    pub fn stats(&self) -> PreemptStats {
        PreemptStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            forced_yields: self.forced_yields.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }

    fn set_blocked(&self, blocked: bool) {
        let how = if blocked { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };
        // SAFETY: `mask` was initialised in `new`.
        unsafe { libc::pthread_sigmask(how, &self.mask, ptr::null_mut()) };
    }
}

impl Drop for Preemption {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Guard returned by [`Preemption::critical`].
#[must_use = "preemption is re-enabled as soon as the guard is dropped"]
pub struct CriticalSection<'a> {
    preemption: &'a Preemption,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.preemption.enable();
    }
}

/// Critical section on the runtime driving the calling OS thread.
///
/// Does nothing when no runtime is running.
pub fn critical() -> RuntimeCritical {
    RuntimeCritical {
        engaged: Runtime::with_current(|rt| rt.preemption().disable()).is_some(),
        _not_send: PhantomData,
    }
}

/// Guard returned by [`critical`].
#[must_use = "preemption is re-enabled as soon as the guard is dropped"]
pub struct RuntimeCritical {
    engaged: bool,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RuntimeCritical {
    fn drop(&mut self) {
        if self.engaged {
            Runtime::with_current(|rt| rt.preemption().enable());
        }
    }
}

/// Deliver one tick to the current runtime as if the timer had fired.
///
/// Gives tests a deterministic forced-yield hook that works with or without
/// the interval timer. Returns `true` if the calling thread was forced to
/// yield, `false` if the tick was deferred or no runtime is running.
pub fn simulate_tick() -> bool {
    Runtime::with_current(|rt| {
        if rt.preemption().on_tick() {
            rt.forced_yield();
            true
        } else {
            false
        }
    })
    .unwrap_or(false)
}

/// Whether the preemption signal is blocked on the calling OS thread.
pub fn signal_blocked() -> bool {
    // SAFETY: querying the mask only writes the out-parameter.
    unsafe {
        let mut current: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut current);
        libc::sigismember(&current, PREEMPT_SIGNAL) == 1
    }
}

extern "C" fn on_timer_signal(_signo: libc::c_int) {
    // SAFETY: errno is thread-local; it is restored before returning.
    let errno = unsafe { *libc::__errno_location() };
    Runtime::with_current(|rt| {
        if rt.preemption().is_active() && rt.preemption().on_tick() {
            rt.forced_yield();
        }
    });
    unsafe { *libc::__errno_location() = errno };
}

fn os_error(call: &'static str) -> crate::errors::ThreadError {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    TimerError::Os { call, errno }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ThreadError;

    #[test]
    fn test_critical_sections_nest() {
        let preemption = Preemption::new();
        assert_eq!(preemption.depth(), 0);
        {
            let _outer = preemption.critical();
            {
                let _inner = preemption.critical();
                assert_eq!(preemption.depth(), 2);
            }
            assert_eq!(preemption.depth(), 1);
        }
        assert_eq!(preemption.depth(), 0);
    }

    #[test]
    fn test_inactive_controller_leaves_mask_alone() {
        let preemption = Preemption::new();
        assert!(!preemption.is_active());
        let before = signal_blocked();
        preemption.disable();
        assert_eq!(signal_blocked(), before);
        preemption.enable();
        assert_eq!(signal_blocked(), before);

        // Start without the flag and stop without a start are both no-ops.
        preemption.start(&RuntimeConfig::default()).unwrap();
        assert!(!preemption.is_active());
        preemption.stop();
    }

    #[test]
    fn test_tick_inside_critical_section_is_deferred() {
        let preemption = Preemption::new();
        assert!(preemption.on_tick());
        {
            let _cs = preemption.critical();
            assert!(!preemption.on_tick());
            assert!(!preemption.on_tick());
        }
        let stats = preemption.stats();
        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.deferred, 2);
        // The deferred ticks collapse into one forced yield on close.
        assert_eq!(stats.forced_yields, 2);
    }

    #[test]
    fn test_without_runtime_helpers_do_nothing() {
        assert!(!simulate_tick());
        let guard = critical();
        assert!(!guard.engaged);
    }

    #[test]
    fn test_start_masks_and_stop_restores() {
        let _timer = crate::tests::timer_lock();
        let preemption = Preemption::new();
        let config = RuntimeConfig::new().preempt(true);
        preemption.start(&config).unwrap();
        assert!(preemption.is_active());

        let other = Preemption::new();
        assert_eq!(
            other.start(&config),
            Err(ThreadError::Timer(TimerError::AlreadyRunning))
        );

        preemption.disable();
        assert!(signal_blocked());
        preemption.enable();
        assert!(!signal_blocked());

        preemption.stop();
        assert!(!preemption.is_active());
        assert!(!signal_blocked());

        // The timer is free again.
        other.start(&config).unwrap();
        other.stop();
    }

    #[test]
    fn test_start_rejects_bad_frequency() {
        let preemption = Preemption::new();
        let config = RuntimeConfig::new().preempt(true).hz(0);
        assert_eq!(
            preemption.start(&config),
            Err(ThreadError::Timer(TimerError::InvalidFrequency(0)))
        );
        assert!(!preemption.is_active());
    }
}
