// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// Wakers are loom types under `cfg(loom)`, which only work inside `loom::model`.
#![cfg(not(loom))]

use dozer::oneshot::{self, RecvError};
use dozer::{Dozer, Waker};
use fiber_sched::{FiberStatus, Scheduler};
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

lazy_static::lazy_static! {
    /// Wakers handed from fibers to a helper thread.
    static ref REMOTE_WAKERS: Mutex<Vec<Waker>> = Mutex::new(Vec::new());
}

fn trace_init() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

fn small_scheduler(physical_stack_count: usize) -> Scheduler {
    Scheduler::builder()
        .stack_size(64 * 1024)
        .physical_stack_count(physical_stack_count)
        .build()
        .unwrap()
}

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

/// Receives on a channel from its destructor.
struct RecvOnDrop<'a> {
    rx: Option<oneshot::Receiver<u32>>,
    dozer: &'a dyn Dozer,
    result: Rc<Cell<Option<Result<u32, RecvError>>>>,
}

impl Drop for RecvOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.result.set(Some(rx.recv(self.dozer)));
        }
    }
}

#[test]
fn runs_once_in_submission_order() {
    let _trace = trace_init();

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new().unwrap();

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let log = log.clone();
            sched.add(move |_| log.borrow_mut().push(i))
        })
        .collect();
    assert_eq!(sched.fiber_count(), 5);

    sched.step();
    assert_eq!(*log.borrow(), [0, 1, 2, 3, 4]);
    assert!(sched.is_empty());
    assert!(handles.iter().all(|handle| handle.is_finished()));

    sched.step();
    assert_eq!(log.borrow().len(), 5);
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let _trace = trace_init();

    let out = Rc::new(RefCell::new(String::new()));
    let mut sched = Scheduler::new().unwrap();

    for (digit, ms) in [('1', 300), ('2', 200), ('3', 100)] {
        let out = out.clone();
        sched.add(move |dozer| {
            out.borrow_mut().push(digit);
            dozer.sleep(Duration::from_millis(ms));
            out.borrow_mut().push(digit);
        });
    }

    let start = Instant::now();
    sched.run();

    assert_eq!(*out.borrow(), "123321");
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn doze_reports_wake_or_timeout() {
    let _trace = trace_init();

    let waker_slot: Rc<RefCell<Option<Waker>>> = Rc::default();
    let results = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new().unwrap();

    let waiter = {
        let waker_slot = waker_slot.clone();
        let results = results.clone();
        sched.add(move |dozer| {
            *waker_slot.borrow_mut() = Some(dozer.get_waker());
            let woken = dozer.doze(Duration::from_secs(10));
            results.borrow_mut().push(("woken", woken));
        })
    };
    {
        let results = results.clone();
        sched.add(move |dozer| {
            let _waker = dozer.get_waker();
            let woken = dozer.doze(Duration::from_millis(20));
            results.borrow_mut().push(("timed out", woken));
        });
    }

    sched.step();
    assert_eq!(waiter.status(), FiberStatus::Waiting);

    waker_slot.borrow_mut().take().unwrap().wake();

    let start = Instant::now();
    sched.run();
    assert!(start.elapsed() < Duration::from_secs(10));

    let mut results = results.take();
    results.sort_unstable();
    assert_eq!(results, [("timed out", false), ("woken", true)]);
}

#[test]
fn doze_zero_polls_without_suspending() {
    let _trace = trace_init();

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new().unwrap();

    {
        let log = log.clone();
        sched.add(move |dozer| {
            log.borrow_mut().push("a");
            assert!(!dozer.doze(Duration::ZERO));

            dozer.get_waker().wake();
            assert!(dozer.doze(Duration::ZERO));
            // consumed
            assert!(!dozer.doze(Duration::ZERO));
            log.borrow_mut().push("a done");
        });
    }
    {
        let log = log.clone();
        sched.add(move |_| log.borrow_mut().push("b"));
    }

    sched.step();
    assert_eq!(*log.borrow(), ["a", "a done", "b"]);
}

#[test]
fn wake_during_waker_handoff_is_kept() {
    let _trace = trace_init();

    let done = Rc::new(Cell::new(false));
    let mut sched = Scheduler::new().unwrap();

    {
        let done = done.clone();
        sched.add(move |dozer| {
            let first = dozer.get_waker();
            // `first` is still held, so this must not reset the pending state.
            let second = dozer.get_waker();
            assert!(!first.ptr_eq(&second));

            first.wake();
            drop(first);
            assert!(dozer.doze(Duration::from_secs(10)));
            drop(second);

            done.set(true);
        });
    }

    sched.run();
    assert!(done.get());
}

#[test]
fn unbounded_lifetime_runs_every_tick() {
    let _trace = trace_init();

    let count = Rc::new(Cell::new(0u32));
    let mut sched = Scheduler::new().unwrap();

    let handle = {
        let count = count.clone();
        sched.add_with_lifetime(Duration::MAX, move |_| count.set(count.get() + 1))
    };

    for _ in 0..10 {
        sched.step();
    }
    assert_eq!(count.get(), 10);
    assert_eq!(handle.status(), FiberStatus::Ready);

    handle.stop();
    sched.step();
    assert_eq!(count.get(), 10);
    assert!(handle.is_finished());
    assert!(sched.is_empty());
}

#[test]
fn bounded_lifetime_expires() {
    let _trace = trace_init();

    let count = Rc::new(Cell::new(0u32));
    let mut sched = Scheduler::new().unwrap();

    {
        let count = count.clone();
        sched.add_with_lifetime(Duration::from_millis(50), move |dozer| {
            count.set(count.get() + 1);
            dozer.sleep(Duration::from_millis(10));
        });
    }

    sched.run();
    // Every run takes at least 10ms, so the fiber is out of time after five.
    assert!((1..=5).contains(&count.get()));
}

#[test]
fn parked_stacks_are_restored() {
    let _trace = trace_init();

    const FIBERS: u8 = 5;
    const ROUNDS: u64 = 4;

    let finished = Rc::new(RefCell::new(Vec::new()));
    let mut sched = small_scheduler(2);

    for id in 0..FIBERS {
        let finished = finished.clone();
        sched.add(move |dozer| {
            let mut counter = 0u64;
            let buf = std::hint::black_box([id; 512]);
            assert!(dozer.is_unowned_data(&raw const counter));

            for round in 0..ROUNDS {
                assert_eq!(counter, round);
                counter += 1;
                dozer.sleep(Duration::from_millis(1));
                assert!(std::hint::black_box(&buf).iter().all(|b| *b == id));
            }

            finished.borrow_mut().push((id, counter));
        });
    }

    sched.step();
    // Two fibers own a slot, the other three are parked.
    assert_eq!(sched.physical_stack_count(), 2);
    assert_eq!(sched.parked_count(), usize::from(FIBERS) - 2);

    sched.run();
    assert_eq!(sched.parked_count(), 0);

    let mut finished = finished.take();
    finished.sort_unstable();
    let expected: Vec<_> = (0..FIBERS).map(|id| (id, ROUNDS)).collect();
    assert_eq!(finished, expected);
}

#[test]
fn stopped_sleeper_never_runs_again() {
    let _trace = trace_init();

    let ran = Rc::new(Cell::new(false));
    let dropped = Rc::new(Cell::new(false));
    let mut sched = small_scheduler(2);

    let handle = {
        let ran = ran.clone();
        let dropped = dropped.clone();
        sched.add(move |dozer| {
            let _guard = SetOnDrop(dropped.clone());
            dozer.sleep(Duration::from_millis(20));
            ran.set(true);
        })
    };

    sched.step();
    assert_eq!(handle.status(), FiberStatus::Sleeping);

    sched.stop(&handle);
    std::thread::sleep(Duration::from_millis(30));
    sched.step();

    assert!(!ran.get());
    assert!(dropped.get());
    assert!(handle.is_finished());
    assert!(sched.is_empty());
}

#[test]
fn stopped_fiber_can_block_in_destructors() {
    let _trace = trace_init();

    let result = Rc::new(Cell::new(None));
    let mut sched = Scheduler::new().unwrap();

    let (tx, rx) = oneshot::channel::<u32>();
    let mut rx = Some(rx);

    let handle = {
        let result = result.clone();
        sched.add(move |dozer| {
            let _guard = RecvOnDrop {
                rx: rx.take(),
                dozer,
                result: result.clone(),
            };
            dozer.doze(Duration::MAX);
        })
    };

    sched.step();
    assert_eq!(handle.status(), FiberStatus::Waiting);

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let th = std::thread::spawn(move || {
        // The teardown below must finish on its own, nobody ever sends on `tx`.
        let finished = done_rx.recv_timeout(Duration::from_secs(10)).is_ok();
        drop(tx);
        finished
    });

    handle.stop();
    sched.step();
    done_tx.send(()).unwrap();

    assert!(handle.is_finished());
    assert!(sched.is_empty());
    assert!(matches!(result.take(), Some(Err(_))));
    assert!(th.join().unwrap());
}

#[test]
fn self_stop_takes_effect_at_next_suspension() {
    let _trace = trace_init();

    let before = Rc::new(Cell::new(false));
    let after = Rc::new(Cell::new(false));
    let mut sched = Scheduler::new().unwrap();

    let handle = {
        let before = before.clone();
        let after = after.clone();
        sched.add_with_lifetime(Duration::MAX, move |dozer| {
            dozer.handle().stop();
            before.set(true);
            dozer.yield_now();
            after.set(true);
        })
    };

    sched.step();
    assert!(before.get());
    assert!(!after.get());
    assert!(handle.is_finished());
    assert!(sched.is_empty());
}

#[test]
fn stop_from_other_thread_interrupts_run() {
    let _trace = trace_init();

    let mut sched = Scheduler::new().unwrap();
    let handle = sched.add(|dozer| {
        let _waker = dozer.get_waker();
        // Nobody ever wakes this.
        dozer.doze(Duration::MAX);
        unreachable!();
    });

    let th = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.stop();
    });

    let start = Instant::now();
    sched.run();
    assert!(start.elapsed() < Duration::from_secs(10));
    th.join().unwrap();
}

#[test]
fn wake_from_other_thread_interrupts_run() {
    let _trace = trace_init();

    let woken = Rc::new(Cell::new(false));
    let mut sched = Scheduler::new().unwrap();

    {
        let woken = woken.clone();
        sched.add(move |dozer| {
            REMOTE_WAKERS.lock().unwrap().push(dozer.get_waker());
            woken.set(dozer.doze(Duration::MAX));
        });
    }

    let th = std::thread::spawn(|| {
        loop {
            if let Some(waker) = REMOTE_WAKERS.lock().unwrap().pop() {
                waker.wake();
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    sched.run();
    assert!(woken.get());
    th.join().unwrap();
}

#[test]
fn oneshot_works_inside_fibers() {
    let _trace = trace_init();

    let got = Rc::new(Cell::new(None));
    let mut sched = small_scheduler(1);

    let (tx, rx) = oneshot::channel::<u32>();
    let (mut tx, mut rx) = (Some(tx), Some(rx));

    {
        let got = got.clone();
        sched.add(move |dozer| {
            let rx = rx.take().unwrap();
            got.set(Some(rx.recv(dozer)));
        });
    }
    sched.add(move |dozer| {
        dozer.sleep(Duration::from_millis(5));
        tx.take().unwrap().send(42).unwrap();
    });

    sched.run();
    assert_eq!(got.take(), Some(Ok(42)));
}

#[test]
fn oneshot_from_other_thread() {
    let _trace = trace_init();

    let got = Rc::new(Cell::new(None));
    let mut sched = Scheduler::new().unwrap();

    let (tx, rx) = oneshot::channel::<u32>();
    let mut rx = Some(rx);
    {
        let got = got.clone();
        sched.add(move |dozer| {
            got.set(Some(rx.take().unwrap().recv(dozer)));
        });
    }

    let th = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        tx.send(7).unwrap();
    });

    sched.run();
    assert_eq!(got.take(), Some(Ok(7)));
    th.join().unwrap();
}

#[test]
fn spawned_fibers_join_the_next_tick() {
    let _trace = trace_init();

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new().unwrap();

    {
        let log = log.clone();
        sched.add(move |dozer| {
            log.borrow_mut().push("parent");
            let child_log = log.clone();
            dozer.spawn(move |_| child_log.borrow_mut().push("child"));
            log.borrow_mut().push("parent done");
        });
    }
    {
        let log = log.clone();
        sched.add(move |_| log.borrow_mut().push("sibling"));
    }

    sched.step();
    assert_eq!(*log.borrow(), ["parent", "parent done", "sibling"]);
    assert_eq!(sched.fiber_count(), 1);

    sched.step();
    assert_eq!(*log.borrow(), ["parent", "parent done", "sibling", "child"]);
    assert!(sched.is_empty());
}

#[test]
fn panic_propagates_out_of_step() {
    let _trace = trace_init();

    let after = Rc::new(Cell::new(false));
    let mut sched = Scheduler::new().unwrap();

    let handle = sched.add(|_| panic!("boom"));
    {
        let after = after.clone();
        sched.add(move |_| after.set(true));
    }

    let payload = panic::catch_unwind(AssertUnwindSafe(|| sched.step())).unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert!(handle.is_finished());
    assert!(!after.get());

    // The rest of the tick stays queued.
    sched.step();
    assert!(after.get());
    assert!(sched.is_empty());
}

#[test]
fn nested_scheduler_blocks_through_fiber_dozer() {
    let _trace = trace_init();

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut outer = Scheduler::new().unwrap();

    {
        let log = log.clone();
        outer.add(move |dozer| {
            let mut inner = small_scheduler(1);
            {
                let log = log.clone();
                inner.add(move |dozer| {
                    log.borrow_mut().push("inner");
                    dozer.sleep(Duration::from_millis(10));
                    log.borrow_mut().push("inner done");
                });
            }

            inner.run_with(dozer);
            log.borrow_mut().push("outer done");
        });
    }
    {
        let log = log.clone();
        outer.add(move |_| log.borrow_mut().push("sibling"));
    }

    outer.run();
    assert_eq!(
        *log.borrow(),
        ["inner", "sibling", "inner done", "outer done"]
    );
}

#[test]
fn dropping_scheduler_unwinds_fibers() {
    let _trace = trace_init();

    let dropped = Rc::new(Cell::new(false));
    let never_started = Rc::new(Cell::new(false));
    let mut sched = small_scheduler(1);

    let sleeper = {
        let dropped = dropped.clone();
        sched.add(move |dozer| {
            let _guard = SetOnDrop(dropped.clone());
            dozer.sleep(Duration::from_secs(3600));
        })
    };
    sched.step();

    let guard = SetOnDrop(never_started.clone());
    let fresh = sched.add(move |_| {
        let _guard = &guard;
    });

    drop(sched);
    assert!(dropped.get());
    assert!(never_started.get());
    assert!(sleeper.is_finished());
    assert!(fresh.is_finished());
}

#[test]
fn unowned_data_is_only_fiber_stack_memory() {
    let _trace = trace_init();

    let mut sched = Scheduler::new().unwrap();
    let on_host_stack = 0u32;
    let on_heap = Box::new(0u32);

    assert!(!sched.is_unowned_data(&raw const on_host_stack));
    assert!(!sched.is_unowned_data(&raw const *on_heap));

    let seen = Rc::new(Cell::new(false));
    {
        let seen = seen.clone();
        sched.add(move |dozer| {
            let local = 0u32;
            seen.set(dozer.is_unowned_data(&raw const local));
        });
    }
    sched.step();
    assert!(seen.get());
}
