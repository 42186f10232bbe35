//! The runtime: thread table, context switching and the idle loop.
//!
//! A [`Runtime`] lives on the stack of the OS thread that called
//! [`Runtime::run`] and is reachable from that OS thread through a
//! thread-local pointer for as long as `run` is executing. The OS thread's
//! own context becomes the idle thread; every other thread runs on a stack
//! taken from the runtime's [`StackPool`].
//!
//! All scheduler state is touched with preemption disabled. The state lock
//! is only ever taken with `try_lock`: contention would mean the preemption
//! signal re-entered the scheduler, which is a bug.

use crate::arch::{Arch, DefaultArch};
use crate::config::RuntimeConfig;
use crate::errors::{fatal, ThreadError, ThreadResult};
use crate::mem::{StackPool, StackSizeClass, STACK_CANARY};
use crate::preempt::Preemption;
use crate::sched::{DefaultScheduler, Scheduler};
use crate::thread::{Entry, Tcb, ThreadId, ThreadState};
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use portable_atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

thread_local! {
    static CURRENT: Cell<*const Runtime> = const { Cell::new(ptr::null()) };
}

/// Summary returned by a completed [`Runtime::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Threads spawned, including the entry thread
    pub spawned: u64,
    /// Context switches performed
    pub context_switches: u64,
    /// Yields forced by timer ticks, real or simulated
    pub forced_yields: u64,
    /// Ticks delivered
    pub ticks: u64,
    /// Threads still blocked when the ready queue drained
    pub left_blocked: usize,
}

struct SchedState {
    threads: BTreeMap<ThreadId, NonNull<Tcb>>,
    scheduler: DefaultScheduler,
    current: ThreadId,
    idle: ThreadId,
    /// Exited threads whose stacks are still in use until the next switch
    exited: Vec<ThreadId>,
    next_id: ThreadId,
}

impl SchedState {
    fn get(&self, id: ThreadId) -> Option<&Tcb> {
        // SAFETY: TCBs in the table stay allocated until they are removed.
        self.threads.get(&id).map(|tcb| unsafe { tcb.as_ref() })
    }

    fn tcb(&self, id: ThreadId) -> &Tcb {
        self.get(id)
            .unwrap_or_else(|| fatal("scheduled thread has no control block"))
    }

    fn make_ready(&mut self, id: ThreadId) {
        if self.scheduler.enqueue(id).is_err() {
            fatal("ready queue allocation failed");
        }
    }

    /// Queue a freshly spawned thread for its first run.
    fn admit(&mut self, id: ThreadId) -> ThreadResult<()> {
        #[cfg(test)]
        if tests::FAIL_NEXT_ADMIT.with(Cell::take) {
            return Err(ThreadError::allocation_failure());
        }
        self.scheduler.enqueue(id)
    }
}

/// A green-thread runtime bound to one OS thread.
pub struct Runtime {
    config: RuntimeConfig,
    preemption: Preemption,
    stacks: StackPool,
    state: spin::Mutex<SchedState>,
    spawned: AtomicU64,
    context_switches: AtomicU64,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    fn new(config: RuntimeConfig) -> Self {
        let idle = ThreadId::FIRST;
        let mut threads = BTreeMap::new();
        threads.insert(idle, NonNull::from(Box::leak(Box::new(Tcb::idle(idle)))));
        Self {
            config,
            preemption: Preemption::new(),
            stacks: StackPool::new(),
            state: spin::Mutex::new(SchedState {
                threads,
                scheduler: DefaultScheduler::new(),
                current: idle,
                idle,
                exited: Vec::new(),
                next_id: idle.next(),
            }),
            spawned: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            _not_send: PhantomData,
        }
    }

    /// Run `entry` as the first green thread, with or without preemption,
    /// until no thread is ready.
    pub fn run<F>(preempt: bool, entry: F) -> ThreadResult<RunStats>
    where
        F: FnOnce() + 'static,
    {
        Self::run_with(RuntimeConfig::new().preempt(preempt), entry)
    }

    /// Like [`run`](Self::run) with explicit settings.
    ///
    /// Returns once the ready queue is empty. Threads still blocked at that
    /// point are never resumed; their stacks are released without unwinding.
    pub fn run_with<F>(config: RuntimeConfig, entry: F) -> ThreadResult<RunStats>
    where
        F: FnOnce() + 'static,
    {
        if !registered().is_null() {
            return Err(ThreadError::InvalidArgument(
                "a runtime is already running on this OS thread",
            ));
        }
        config.validate()?;

        let runtime = Runtime::new(config);
        let _registration = Registration::new(&runtime);
        runtime.preemption.start(&config)?;
        log::debug!(
            "runtime started (preempt: {}, hz: {})",
            config.preempt,
            config.hz
        );

        runtime.spawn_with(Some(String::from("main")), None, entry)?;
        while runtime.ready_len() > 0 {
            runtime.yield_inner();
        }

        runtime.preemption.stop();
        let stats = runtime.stats();
        log::debug!("runtime finished: {:?}", stats);
        Ok(stats)
    }

    /// Call `f` with the runtime driving the calling OS thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&Runtime) -> R) -> Option<R> {
        // SAFETY: the pointer is only set while `run_with` keeps the runtime
        // alive on this OS thread.
        unsafe { registered().as_ref() }.map(f)
    }

    pub fn preemption(&self) -> &Preemption {
        &self.preemption
    }

    /// Spawn a thread with the default stack size and no name.
    pub fn spawn<F>(&self, f: F) -> ThreadResult<ThreadId>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_with(None, None, f)
    }

    pub(crate) fn spawn_with<F>(
        &self,
        name: Option<String>,
        stack_size: Option<StackSizeClass>,
        f: F,
    ) -> ThreadResult<ThreadId>
    where
        F: FnOnce() + 'static,
    {
        let class = stack_size.unwrap_or(self.config.stack_size);
        let _cs = self.preemption.critical();

        let mut body = Some(f);
        let entry: Entry = Box::new(move || {
            if let Some(f) = body.take() {
                f()
            }
        });

        let stack = self.stacks.allocate(class)?;
        stack.install_canary(STACK_CANARY);

        let mut state = self.lock_state();
        let id = state.next_id;
        let tcb = Box::new(Tcb::new(id, name, stack, entry));

        // The new context captures the current signal mask, which has the
        // preemption signal blocked; `thread_entry` unblocks it.
        let init = tcb.with_stack(|stack| {
            // SAFETY: the TCB is boxed and owns the stack for its lifetime.
            unsafe { DefaultArch::init_context(tcb.context_ptr(), stack, thread_entry) }
        });
        let admitted = match init {
            Some(Err(e)) => Err(e.into()),
            _ => state.admit(id),
        };
        if let Err(e) = admitted {
            drop(state);
            self.discard(tcb);
            return Err(e);
        }

        state.threads.insert(id, NonNull::from(Box::leak(tcb)));
        state.next_id = id.next();
        self.spawned.fetch_add(1, Ordering::Relaxed);
        log::debug!("spawned thread {} ({} byte stack)", id, class.size());
        Ok(id)
    }

    /// Undo a spawn that never reached the table.
    ///
    /// The entry's captures are dropped here, outside the state lock.
    fn discard(&self, tcb: Box<Tcb>) {
        if let Some(stack) = tcb.take_stack() {
            self.stacks.release(stack);
        }
        drop(tcb);
    }

    /// Give up the processor to the next ready thread.
    ///
    /// Returns immediately if no other thread is ready.
    pub fn yield_now(&self) {
        log::trace!("thread {} yielding", self.current());
        self.yield_inner();
    }

    /// Yield on behalf of a timer tick.
    ///
    /// Reached from the signal handler, so nothing on this path logs.
    pub(crate) fn forced_yield(&self) {
        self.yield_inner();
    }

    fn yield_inner(&self) {
        let _cs = self.preemption.critical();
        {
            let mut state = self.lock_state();
            let current = state.current;
            let requeue = {
                let tcb = state.tcb(current);
                if tcb.state() == ThreadState::Running {
                    tcb.set_state(ThreadState::Ready);
                    current != state.idle
                } else {
                    false
                }
            };
            if requeue {
                state.make_ready(current);
            }
        }
        self.reschedule();
    }

    /// Park the calling thread until some other thread calls
    /// [`unblock`](Self::unblock) with its ID.
    ///
    /// The idle thread has nothing to wake it, so it refuses to block.
    pub fn block(&self) {
        let _cs = self.preemption.critical();
        {
            let state = self.lock_state();
            if state.current == state.idle {
                drop(state);
                log::warn!("idle thread cannot block");
                return;
            }
            state.tcb(state.current).set_state(ThreadState::Blocked);
        }
        self.reschedule();
    }

    /// Make a blocked thread ready again.
    ///
    /// Returns `false` without doing anything if `id` is not blocked,
    /// including IDs of threads that already exited or never existed.
    pub fn unblock(&self, id: ThreadId) -> bool {
        let _cs = self.preemption.critical();
        let mut state = self.lock_state();
        let woke = match state.get(id) {
            Some(tcb) if tcb.state() == ThreadState::Blocked => {
                tcb.set_state(ThreadState::Ready);
                true
            }
            _ => false,
        };
        if woke {
            state.make_ready(id);
        }
        woke
    }

    /// Terminate the calling thread.
    ///
    /// The thread's stack is unwound first, so its locals and everything its
    /// closure captured are dropped. A `catch_unwind` inside the thread body
    /// intercepts the exit; resume the payload to let it finish. The stack
    /// itself goes back to the pool once another thread is running.
    pub fn exit(&self) -> ! {
        // Stays disabled through the unwind; `thread_entry` never re-enables.
        self.preemption.disable();
        {
            let state = self.lock_state();
            if state.current == state.idle {
                fatal("idle thread cannot exit");
            }
        }
        panic::resume_unwind(Box::new(ThreadExit))
    }

    /// Retire the calling thread once its body is gone and switch away for
    /// good.
    fn terminate(&self) -> ! {
        self.preemption.disable();
        {
            let mut state = self.lock_state();
            let current = state.current;
            if current == state.idle {
                fatal("idle thread cannot exit");
            }
            state.tcb(current).set_state(ThreadState::Exited);
            state.exited.push(current);
            log::debug!("thread {} exited", current);
        }
        self.reschedule();
        fatal("exited thread was resumed")
    }

    /// ID of the running thread.
    pub fn current(&self) -> ThreadId {
        let _cs = self.preemption.critical();
        self.lock_state().current
    }

    /// ID of the idle thread standing in for the OS thread.
    pub fn idle(&self) -> ThreadId {
        let _cs = self.preemption.critical();
        self.lock_state().idle
    }

    /// State of a live thread, `None` once it has been reaped.
    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        let _cs = self.preemption.critical();
        self.lock_state().get(id).map(Tcb::state)
    }

    pub fn thread_name(&self, id: ThreadId) -> Option<String> {
        let _cs = self.preemption.critical();
        self.lock_state()
            .get(id)
            .and_then(|tcb| tcb.name().map(String::from))
    }

    /// Number of threads waiting on the ready queue.
    pub fn ready_len(&self) -> usize {
        let _cs = self.preemption.critical();
        self.lock_state().scheduler.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> RunStats {
        let preempt = self.preemption.stats();
        let _cs = self.preemption.critical();
        let state = self.lock_state();
        let left_blocked = state
            .threads
            .keys()
            .filter(|&&id| state.tcb(id).state() == ThreadState::Blocked)
            .count();
        RunStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            forced_yields: preempt.forced_yields,
            ticks: preempt.ticks,
            left_blocked,
        }
    }

    fn lock_state(&self) -> spin::MutexGuard<'_, SchedState> {
        self.state
            .try_lock()
            .unwrap_or_else(|| fatal("scheduler state re-entered"))
    }

    /// Switch to the next ready thread, or to the idle thread if none is.
    ///
    /// The caller has preemption disabled and has already moved the current
    /// thread out of `Running`.
    fn reschedule(&self) {
        let (prev_ctx, next_ctx) = {
            let mut state = self.lock_state();
            let prev = state.current;
            let next = state.scheduler.pick_next().unwrap_or(state.idle);

            let prev_tcb = state.tcb(prev);
            if let Err(e) = prev_tcb.check_stack() {
                fatal(format_args!("thread {}: {}", prev, e));
            }

            let next_tcb = state.tcb(next);
            if next != state.idle && next_tcb.state() != ThreadState::Ready {
                fatal("non-ready thread on the ready queue");
            }
            next_tcb.set_state(ThreadState::Running);
            if next == prev {
                return;
            }
            let ctxs = (prev_tcb.context_ptr(), next_tcb.context_ptr());
            state.current = next;
            ctxs
        };

        let depth = self.preemption.depth();
        self.context_switches.fetch_add(1, Ordering::Relaxed);
        // SAFETY: both TCBs are alive; `prev` is reaped only after this
        // switch has saved its context.
        unsafe { DefaultArch::context_switch(prev_ctx, next_ctx) };
        self.preemption.restore_depth(depth);
        self.reap_exited();
    }

    /// Free the control blocks and stacks of threads that have exited.
    fn reap_exited(&self) {
        let mut state = self.lock_state();
        let exited = core::mem::take(&mut state.exited);
        for id in exited {
            if id == state.current {
                state.exited.push(id);
                continue;
            }
            if let Some(tcb) = state.threads.remove(&id) {
                // SAFETY: the pointer came from `Box::leak` and is no longer
                // in the table.
                let tcb = unsafe { Box::from_raw(tcb.as_ptr()) };
                if let Some(stack) = tcb.take_stack() {
                    self.stacks.release(stack);
                }
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.preemption.stop();
        let state = self.state.get_mut();
        for (id, tcb) in core::mem::take(&mut state.threads) {
            // SAFETY: every table entry came from `Box::leak`.
            let tcb = unsafe { Box::from_raw(tcb.as_ptr()) };
            if id != state.idle && tcb.state() != ThreadState::Exited {
                log::warn!("thread {} abandoned while {:?}", id, tcb.state());
            }
            if let Some(stack) = tcb.take_stack() {
                self.stacks.release(stack);
            }
        }
    }
}

/// Publishes a runtime in `CURRENT` for the duration of `run_with`.
struct Registration;

impl Registration {
    fn new(runtime: &Runtime) -> Self {
        CURRENT.with(|current| current.set(runtime));
        Registration
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(ptr::null()));
    }
}

fn registered() -> *const Runtime {
    // `try_with` so a tick during OS thread teardown finds no runtime.
    CURRENT.try_with(Cell::get).unwrap_or(ptr::null())
}

/// Unwind payload carrying [`Runtime::exit`] out of a thread body.
struct ThreadExit;

/// Terminate the calling green thread.
///
/// # Panics
///
/// Panics if no runtime is running on the calling OS thread.
pub(crate) fn exit_current() -> ! {
    // SAFETY: see `Runtime::with_current`.
    match unsafe { registered().as_ref() } {
        Some(runtime) => runtime.exit(),
        None => panic!("exit called outside a running runtime"),
    }
}

/// First code run on every new thread's stack.
extern "C" fn thread_entry() {
    // Arrived here from `reschedule` inside a critical section, with the
    // preemption signal blocked by the mask captured at spawn.
    let entry = Runtime::with_current(|rt| {
        rt.preemption.restore_depth(1);
        rt.reap_exited();
        let entry = {
            let state = rt.lock_state();
            state.tcb(state.current).take_entry()
        };
        rt.preemption.enable();
        entry
    })
    .flatten();

    match entry {
        Some(mut entry) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(&mut *entry));
            // Freed with preemption off: a tick must not land inside the
            // allocator.
            Runtime::with_current(|rt| {
                rt.preemption.disable();
                if let Err(payload) = &outcome {
                    if !payload.is::<ThreadExit>() {
                        log::error!("thread {} panicked", rt.current());
                    }
                }
            });
            drop(outcome);
            drop(entry);
        }
        None => fatal("thread started without an entry"),
    }
    Runtime::with_current(|rt| rt.terminate());
    fatal("thread finished outside its runtime")
}
