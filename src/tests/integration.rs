//! Integration tests for the public API: thread lifecycle, scheduling order
//! and semaphores driven through the crate-level free functions.

#[cfg(test)]
mod lifecycle_tests {
    use crate::errors::ThreadError;
    use crate::mem::StackSizeClass;
    use crate::thread::{ThreadBuilder, ThreadState};
    use crate::{block, current_thread, exit, run, spawn, unblock, yield_now, Runtime};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_complete_thread_lifecycle() {
        let executed = Rc::new(Cell::new(false));
        let executed_clone = executed.clone();

        let stats = run(false, move || {
            let flag = executed_clone.clone();
            let id = ThreadBuilder::new()
                .name("lifecycle_test")
                .stack_size(StackSizeClass::Medium)
                .spawn(move || flag.set(true))
                .expect("Failed to spawn thread");

            let state = Runtime::with_current(|rt| rt.thread_state(id)).flatten();
            assert_eq!(state, Some(ThreadState::Ready));
            let name = Runtime::with_current(|rt| rt.thread_name(id)).flatten();
            assert_eq!(name.as_deref(), Some("lifecycle_test"));

            yield_now();
            assert!(executed_clone.get());
            let state = Runtime::with_current(|rt| rt.thread_state(id)).flatten();
            assert_eq!(state, None);
        })
        .expect("run failed");

        assert!(executed.get());
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.left_blocked, 0);
    }

    #[test]
    fn test_api_outside_runtime() {
        assert_eq!(current_thread(), None);
        assert_eq!(spawn(|| {}), Err(ThreadError::no_runtime()));
        assert!(!unblock(crate::ThreadId::new(2).unwrap()));
        yield_now();
        block();
    }

    #[test]
    #[should_panic(expected = "outside a running runtime")]
    fn test_exit_outside_runtime_panics() {
        exit();
    }

    #[test]
    fn test_spawn_order_is_run_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        run(false, move || {
            for i in 0..10 {
                let o = o.clone();
                spawn(move || o.borrow_mut().push(i)).unwrap();
            }
        })
        .unwrap();
        assert_eq!(*order.borrow(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_thread_ids_are_unique_and_increasing() {
        let ids = Rc::new(RefCell::new(Vec::new()));
        let i = ids.clone();
        run(false, move || {
            i.borrow_mut().push(current_thread().unwrap());
            for _ in 0..5 {
                let i = i.clone();
                spawn(move || i.borrow_mut().push(current_thread().unwrap())).unwrap();
            }
        })
        .unwrap();
        let ids = ids.borrow();
        assert_eq!(ids.len(), 6);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_block_and_unblock_through_free_functions() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        run(false, move || {
            let o2 = o.clone();
            let sleeper = spawn(move || {
                o2.borrow_mut().push("sleeping");
                block();
                o2.borrow_mut().push("awake");
            })
            .unwrap();

            // Not blocked yet: nothing happens.
            assert!(!unblock(sleeper));
            yield_now();
            assert!(unblock(sleeper));
            // Already ready: second unblock is a no-op.
            assert!(!unblock(sleeper));
            o.borrow_mut().push("woke it");
        })
        .unwrap();
        assert_eq!(*order.borrow(), ["sleeping", "woke it", "awake"]);
    }

    #[test]
    fn test_exit_from_nested_call() {
        fn finish_early(log: &RefCell<Vec<&'static str>>) {
            log.borrow_mut().push("exiting");
            exit();
        }

        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        run(false, move || {
            let o2 = o.clone();
            spawn(move || {
                finish_early(&o2);
            })
            .unwrap();
            yield_now();
            o.borrow_mut().push("main");
        })
        .unwrap();
        assert_eq!(*order.borrow(), ["exiting", "main"]);
    }

    #[test]
    fn test_exit_releases_captured_values() {
        let token = Rc::new(());
        let t = token.clone();
        run(false, move || {
            spawn(move || {
                let _held = &t;
                exit();
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn test_deadlocked_threads_are_left_blocked() {
        let stats = run(false, || {
            for _ in 0..3 {
                spawn(block).unwrap();
            }
        })
        .unwrap();
        assert_eq!(stats.spawned, 4);
        assert_eq!(stats.left_blocked, 3);
    }

    #[test]
    fn test_runs_back_to_back_on_one_os_thread() {
        for round in 0..3 {
            let seen = Rc::new(Cell::new(0));
            let s = seen.clone();
            run(false, move || {
                for _ in 0..round + 1 {
                    let s = s.clone();
                    spawn(move || s.set(s.get() + 1)).unwrap();
                }
            })
            .unwrap();
            assert_eq!(seen.get(), round + 1);
        }
    }
}

#[cfg(test)]
mod semaphore_tests {
    use crate::semaphore::Semaphore;
    use crate::{run, spawn, yield_now};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[test]
    fn test_counter_under_binary_semaphore() {
        const THREADS: usize = 16;
        let counter = Rc::new(Cell::new(0usize));
        let c = counter.clone();
        run(false, move || {
            let sem = Rc::new(Semaphore::new(1));
            for _ in 0..THREADS {
                let (sem, c) = (sem.clone(), c.clone());
                spawn(move || {
                    sem.down().unwrap();
                    let value = c.get();
                    yield_now();
                    c.set(value + 1);
                    sem.up();
                })
                .unwrap();
            }
        })
        .unwrap();
        assert_eq!(counter.get(), THREADS);
    }

    #[test]
    fn test_counting_semaphore_admits_n() {
        let peak = Rc::new(Cell::new(0));
        let p = peak.clone();
        run(false, move || {
            let sem = Rc::new(Semaphore::new(3));
            let inside = Rc::new(Cell::new(0));
            for _ in 0..10 {
                let (sem, inside, p) = (sem.clone(), inside.clone(), p.clone());
                spawn(move || {
                    sem.down().unwrap();
                    inside.set(inside.get() + 1);
                    p.set(p.get().max(inside.get()));
                    yield_now();
                    yield_now();
                    inside.set(inside.get() - 1);
                    sem.up();
                })
                .unwrap();
            }
        })
        .unwrap();
        assert_eq!(peak.get(), 3);
    }

    #[test]
    fn test_bounded_buffer() {
        const ITEMS: usize = 50;
        const CAPACITY: usize = 4;
        let received = Rc::new(RefCell::new(Vec::new()));
        let r = received.clone();
        run(false, move || {
            let buffer = Rc::new(RefCell::new(VecDeque::with_capacity(CAPACITY)));
            let empty = Rc::new(Semaphore::new(CAPACITY));
            let full = Rc::new(Semaphore::new(0));

            let (b, e, f) = (buffer.clone(), empty.clone(), full.clone());
            spawn(move || {
                for item in 0..ITEMS {
                    e.down().unwrap();
                    b.borrow_mut().push_back(item);
                    assert!(b.borrow().len() <= CAPACITY);
                    f.up();
                }
            })
            .unwrap();

            spawn(move || {
                for _ in 0..ITEMS {
                    full.down().unwrap();
                    let item = buffer.borrow_mut().pop_front().unwrap();
                    r.borrow_mut().push(item);
                    empty.up();
                }
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(*received.borrow(), (0..ITEMS).collect::<Vec<_>>());
    }

    #[test]
    fn test_destroy_after_waiters_drain() {
        let destroyed = Rc::new(Cell::new(false));
        let d = destroyed.clone();
        run(false, move || {
            let sem = Rc::new(Semaphore::new(0));
            let waiter = sem.clone();
            spawn(move || waiter.down().unwrap()).unwrap();
            yield_now();
            assert_eq!(sem.waiters(), 1);

            sem.up();
            yield_now();
            let sem = Rc::try_unwrap(sem).expect("waiter still holds the semaphore");
            assert_eq!(sem.waiters(), 0);
            d.set(sem.destroy().is_ok());
        })
        .unwrap();
        assert!(destroyed.get());
    }
}
