// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::queue::TimerQueue;
use crate::stack_pool::StackPool;
use crate::task::{FiberHandle, FiberStatus, Request, Task, Wakeup};
use crate::{BuildError, Builder, Config, FiberDozer};
use core::cell::RefCell;
use core::fmt;
use core::ops::Range;
use core::panic::Location;
use dozer::{Deadline, Dozer, ThreadDozer, Waker};
use fiber::{Fiber, FiberResult};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// State the scheduler shares with the dozers of its fibers.
pub(crate) struct Shared {
    /// Parent of every fiber waker. Forwards to the outer dozer while `run` blocks.
    pub(crate) relay: Waker,
    /// Set when a fiber was stopped, so the timed queues need a sweep.
    pub(crate) sweep: Arc<AtomicBool>,
    /// Fibers spawned from inside a fiber, admitted after the current dispatch.
    pub(crate) spawned: RefCell<Vec<Task>>,
    stacks: Box<[Range<usize>]>,
}

impl Shared {
    pub(crate) fn is_unowned_data(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        self.stacks.iter().any(|range| range.contains(&addr))
    }
}

/// A single-threaded scheduler of cooperative fibers.
///
/// Fibers are added with [`add`](Self::add) and driven by [`step`](Self::step) or
/// [`run`](Self::run). A fiber only gives up the thread when it blocks through its
/// [`FiberDozer`], the scheduler then resumes it once its sleep deadline passed or its
/// waker fired.
///
/// All fibers share a small pool of physical stacks. A fiber whose stack slot is needed by
/// another fiber has its live stack contents parked on the heap in the meantime, see
/// [`is_unowned_data`](Self::is_unowned_data).
///
/// # Ticks
///
/// One call to [`step`](Self::step) is a tick. It first collects every fiber that became
/// runnable (due sleepers, woken or timed out waiters), then runs the fibers that were
/// ready at that point, in FIFO order. Fibers that become ready while the tick runs wait
/// for the next tick.
///
/// # Panics
///
/// A panic inside a fiber finishes that fiber and is re-raised from the `step` or `run`
/// call that resumed it. The scheduler stays usable.
pub struct Scheduler {
    ready: VecDeque<Task>,
    sleeping: TimerQueue<Task>,
    waiting: TimerQueue<(Task, Waker)>,
    stacks: StackPool,
    shared: Rc<Shared>,
    config: Config,
}

impl Scheduler {
    /// Creates a scheduler with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the physical stacks could not be mapped.
    pub fn new() -> Result<Self, BuildError> {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn with_config(config: Config) -> Result<Self, BuildError> {
        let stacks = StackPool::new(config.physical_stack_count, config.stack_size)?;
        let shared = Rc::new(Shared {
            relay: Waker::relay(),
            sweep: Arc::new(AtomicBool::new(false)),
            spawned: RefCell::new(Vec::new()),
            stacks: stacks.ranges(),
        });

        tracing::debug!(
            stack_size = config.stack_size,
            physical_stack_count = config.physical_stack_count,
            "scheduler created"
        );

        Ok(Self {
            ready: VecDeque::new(),
            sleeping: TimerQueue::new(),
            waiting: TimerQueue::new(),
            stacks,
            shared,
            config,
        })
    }

    /// Adds a fiber that runs `f` once.
    ///
    /// The fiber is ready immediately. It finishes when `f` returns.
    #[track_caller]
    pub fn add<F>(&mut self, f: F) -> FiberHandle
    where
        F: FnMut(&FiberDozer<'_>) + 'static,
    {
        self.add_with_lifetime(Duration::ZERO, f)
    }

    /// Adds a fiber that runs `f` repeatedly until it has been alive for `lifetime`.
    ///
    /// Every time `f` returns while the fiber is younger than `lifetime`, `f` is called
    /// again on the next tick. A lifetime of zero runs `f` exactly once and
    /// [`Duration::MAX`] never expires.
    #[track_caller]
    pub fn add_with_lifetime<F>(&mut self, lifetime: Duration, f: F) -> FiberHandle
    where
        F: FnMut(&FiberDozer<'_>) + 'static,
    {
        let (task, handle) = Task::new(&self.shared, lifetime, Location::caller(), f);
        self.ready.push_back(task);
        handle
    }

    /// Runs a single tick without blocking.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of a fiber that panicked during this tick.
    pub fn step(&mut self) {
        self.admit_spawned();
        self.collect(Instant::now());

        let batch = self.ready.len();
        for _ in 0..batch {
            let Some(task) = self.ready.pop_front() else {
                break;
            };
            self.dispatch(task);
        }
    }

    /// Runs until every fiber finished, blocking the calling thread while no fiber is
    /// ready.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of a fiber that panicked.
    pub fn run(&mut self) {
        self.run_with(&ThreadDozer::for_current());
    }

    /// Like [`run`](Self::run), but blocks through `outer`.
    ///
    /// Passing the [`FiberDozer`] of a fiber nests this scheduler inside the scheduler
    /// running that fiber.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of a fiber that panicked.
    pub fn run_with(&mut self, outer: &dyn Dozer) {
        loop {
            self.step();

            if self.is_empty() {
                tracing::trace!("all fibers finished");
                return;
            }
            if !self.ready.is_empty() {
                outer.yield_now();
                continue;
            }

            let deadline = self.next_deadline();
            let now = Instant::now();
            if deadline.is_due(now) {
                continue;
            }

            // Fiber wakers forward to `relay`, point it at the outer dozer while we block.
            let relay = &self.shared.relay;
            relay.set_relay_target(Some(outer.get_waker()));
            let mut gave_up = false;
            if !relay.take() {
                let timeout = deadline.timeout(now);
                tracing::trace!(?timeout, "nothing ready, dozing");
                gave_up = !outer.doze(timeout) && !deadline.is_due(Instant::now());
            }
            relay.set_relay_target(None);
            relay.take();

            if gave_up {
                tracing::debug!("outer dozer can no longer block, leaving fibers in place");
                return;
            }
        }
    }

    /// Requests that the fiber behind `handle` stops. See [`FiberHandle::stop`].
    pub fn stop(&self, handle: &FiberHandle) {
        handle.stop();
    }

    /// Whether `ptr` points into one of the physical stacks of this scheduler.
    ///
    /// Memory on a fiber's stack is moved out of the way while other fibers run on the same
    /// physical stack, so pointers to it must not be used outside of the owning fiber, and
    /// must not be held across a suspension by anyone else.
    pub fn is_unowned_data<T: ?Sized>(&self, ptr: *const T) -> bool {
        self.shared.is_unowned_data(ptr.cast::<u8>())
    }

    /// Number of fibers that have not finished yet.
    pub fn fiber_count(&self) -> usize {
        self.ready.len()
            + self.sleeping.len()
            + self.waiting.len()
            + self.shared.spawned.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fiber_count() == 0
    }

    pub fn physical_stack_count(&self) -> usize {
        self.stacks.len()
    }

    /// Number of fibers whose stack contents are currently parked on the heap.
    pub fn parked_count(&self) -> usize {
        self.stacks.parked_count()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn next_deadline(&self) -> Deadline {
        let sleeping = self.sleeping.next_deadline().unwrap_or(Deadline::Never);
        let waiting = self.waiting.next_deadline().unwrap_or(Deadline::Never);
        sleeping.min(waiting)
    }

    fn admit_spawned(&mut self) {
        let spawned = self.shared.spawned.take();
        for task in spawned {
            self.make_ready(task);
        }
    }

    fn make_ready(&mut self, task: Task) {
        task.header.set_status(FiberStatus::Ready);
        self.ready.push_back(task);
    }

    /// Moves every fiber that became runnable to the ready queue and retires stopped ones.
    fn collect(&mut self, now: Instant) {
        if self.shared.sweep.swap(false, Ordering::AcqRel) {
            let sleeping = self.sleeping.extract_if(|_, task| task.is_stopped());
            let waiting = self.waiting.extract_if(|_, (task, _)| task.is_stopped());

            let mut panicked = None;
            for task in sleeping.into_iter().chain(waiting.into_iter().map(|(task, _)| task)) {
                if let Err(payload) = self.retire(task) {
                    panicked.get_or_insert(payload);
                }
            }
            if let Some(payload) = panicked {
                panic::resume_unwind(payload);
            }
        }

        for mut task in self.sleeping.pop_due(now) {
            task.wakeup = Wakeup::Ready;
            self.make_ready(task);
        }

        let fired = self
            .waiting
            .extract_if(|deadline, (_, waker)| waker.state() || deadline.is_due(now));
        for (mut task, waker) in fired {
            task.wakeup = if waker.take() {
                Wakeup::Woken
            } else {
                Wakeup::TimedOut
            };
            self.make_ready(task);
        }
    }

    fn dispatch(&mut self, mut task: Task) {
        if task.is_stopped() {
            if let Err(payload) = self.retire(task) {
                panic::resume_unwind(payload);
            }
            return;
        }

        let id = task.id();
        let span = tracing::trace_span!(
            "fiber",
            fiber.id = %id,
            fiber.location = %task.header.location()
        );
        let _enter = span.enter();

        let slot = *task.slot.get_or_insert_with(|| self.stacks.assign());
        self.stacks.enter(slot, id);

        // The context is built on first dispatch, once the fiber has a slot.
        let fiber = match task.fiber {
            Some(ref mut fiber) => fiber,
            None => {
                let Some(body) = task.body.take() else {
                    unreachable!("fiber {id} has neither a context nor a body");
                };
                tracing::trace!(slot, "starting fiber");
                task.fiber
                    .insert(Fiber::with_stack(self.stacks.stack(slot), body))
            }
        };

        task.header.set_status(FiberStatus::Running);
        let wakeup = task.wakeup;
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume(wakeup)));

        let request = match result {
            Ok(FiberResult::Yield(request)) => {
                if let Some(sp) = fiber.stack_pointer() {
                    self.stacks.leave(slot, id, sp);
                }
                request
            }
            Ok(FiberResult::Return(())) => {
                tracing::trace!("fiber returned");
                self.stacks.release(Some(slot), id);
                drop(task);
                self.admit_spawned();
                return;
            }
            Err(payload) => {
                tracing::debug!("fiber panicked");
                self.stacks.release(Some(slot), id);
                drop(task);
                self.admit_spawned();
                panic::resume_unwind(payload);
            }
        };

        self.admit_spawned();

        if task.is_stopped() {
            if let Err(payload) = self.retire(task) {
                panic::resume_unwind(payload);
            }
            return;
        }

        match request {
            Request::Yield => {
                task.wakeup = Wakeup::Ready;
                self.make_ready(task);
            }
            Request::Sleep(deadline) => {
                tracing::trace!(?deadline, "fiber sleeping");
                task.header.set_status(FiberStatus::Sleeping);
                self.sleeping.push(deadline, task);
            }
            Request::Doze { deadline, waker } => {
                tracing::trace!(?deadline, "fiber waiting");
                task.header.set_status(FiberStatus::Waiting);
                self.waiting.push(deadline, (task, waker));
            }
        }
    }

    /// Tears a fiber down, running the destructors on its stack.
    ///
    /// A panic the fiber raises on its way out is returned once its slot is released.
    fn retire(&mut self, mut task: Task) -> thread::Result<()> {
        let id = task.id();
        let slot = task.slot;
        tracing::trace!(fiber.id = %id, "retiring fiber");

        let mut unwound = Ok(());
        if let Some(fiber) = task.fiber.as_mut()
            && !fiber.done()
        {
            if thread::panicking() {
                // Safety: the objects on the stack are leaked, which is memory safe
                unsafe { fiber.force_reset() }
            } else if let Some(slot) = slot {
                self.stacks.enter(slot, id);
                unwound = panic::catch_unwind(AssertUnwindSafe(|| fiber.force_unwind()));
            }
        }

        drop(task.body.take());
        self.stacks.release(slot, id);
        unwound
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Retiring runs destructors on fiber stacks, which may spawn more fibers.
        let mut panicked = None;
        loop {
            self.admit_spawned();

            let mut tasks: Vec<Task> = self.ready.drain(..).collect();
            tasks.extend(self.sleeping.drain());
            tasks.extend(self.waiting.drain().map(|(task, _)| task));
            if tasks.is_empty() {
                break;
            }

            for task in tasks {
                if let Err(payload) = self.retire(task) {
                    panicked.get_or_insert(payload);
                }
            }
        }

        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("ready", &self.ready.len())
            .field("sleeping", &self.sleeping.len())
            .field("waiting", &self.waiting.len())
            .field("stacks", &self.stacks)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
