// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::FiberDozer;
use crate::scheduler::Shared;
use core::fmt;
use core::panic::Location;
use dozer::{Deadline, Dozer, Waker};
use fiber::{Fiber, RawFiberStack, Suspend};
use static_assertions::assert_impl_all;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// An opaque ID that uniquely identifies a fiber within the process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a fiber currently is.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
#[repr(u8)]
pub enum FiberStatus {
    /// Queued to run on the next tick.
    Ready = 0,
    Running = 1,
    /// Suspended until a point in time.
    Sleeping = 2,
    /// Suspended until its waker fires or a timeout elapses.
    Waiting = 3,
    /// Returned, panicked or was stopped. It will never run again.
    Finished = 4,
}

impl FiberStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Sleeping,
            3 => Self::Waiting,
            _ => Self::Finished,
        }
    }
}

/// State shared between a fiber and its handles.
pub(crate) struct Header {
    id: FiberId,
    status: AtomicU8,
    stopped: AtomicBool,
    location: &'static Location<'static>,
    /// Raised on stop so the scheduler sweeps its timed queues.
    sweep: Arc<AtomicBool>,
    /// Woken on stop so a blocked scheduler re-polls.
    relay: Waker,
}

impl Header {
    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub(crate) fn set_status(&self, status: FiberStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A handle to a fiber owned by a [`Scheduler`](crate::Scheduler).
///
/// Handles can only observe the fiber and request that it stops; they never keep it
/// alive or run it. They can be sent to, and used from, other threads.
#[derive(Clone)]
pub struct FiberHandle {
    header: Arc<Header>,
}
assert_impl_all!(FiberHandle: Send, Sync);

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.header.id
    }

    pub fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.header.status.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.status() == FiberStatus::Finished
    }

    /// Requests that the fiber is removed from its scheduler.
    ///
    /// This takes effect the next time the scheduler looks at the fiber: a ready fiber is
    /// dropped instead of run, a sleeping or waiting one is evicted on the next tick. A
    /// fiber that stops itself runs until its next suspension point. Objects alive on the
    /// fiber's stack are dropped.
    pub fn stop(&self) {
        if !self.header.stopped.swap(true, Ordering::AcqRel) {
            tracing::trace!(fiber.id = %self.header.id, "stop requested");
            self.header.sweep.store(true, Ordering::Release);
            self.header.relay.wake();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.header.is_stopped()
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.header.id)
            .field("status", &self.status())
            .field("stopped", &self.is_stopped())
            .field("location", &self.header.location)
            .finish_non_exhaustive()
    }
}

/// What a suspending fiber asks the scheduler for.
pub(crate) enum Request {
    /// Run again on the next tick.
    Yield,
    /// Run again once the deadline passed.
    Sleep(Deadline),
    /// Run again once `waker` fired or the deadline passed.
    Doze { deadline: Deadline, waker: Waker },
}

/// Why a fiber was resumed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Wakeup {
    Start,
    Ready,
    Woken,
    TimedOut,
}

pub(crate) type SchedFiber = Fiber<Wakeup, Request, (), RawFiberStack>;
type Body = Box<dyn FnOnce(Wakeup, &Suspend<Wakeup, Request>)>;

/// A fiber as the scheduler's queues own it.
pub(crate) struct Task {
    pub(crate) header: Arc<Header>,
    /// Built on first dispatch, once the task has a stack slot.
    pub(crate) fiber: Option<SchedFiber>,
    pub(crate) body: Option<Body>,
    /// The physical stack slot the fiber is pinned to.
    pub(crate) slot: Option<usize>,
    /// Delivered to the fiber on its next resume.
    pub(crate) wakeup: Wakeup,
}

impl Task {
    pub(crate) fn new<F>(
        shared: &Rc<Shared>,
        lifetime: Duration,
        location: &'static Location<'static>,
        mut f: F,
    ) -> (Self, FiberHandle)
    where
        F: FnMut(&FiberDozer<'_>) + 'static,
    {
        let header = Arc::new(Header {
            id: FiberId::next(),
            status: AtomicU8::new(FiberStatus::Ready as u8),
            stopped: AtomicBool::new(false),
            location,
            sweep: shared.sweep.clone(),
            relay: shared.relay.clone(),
        });
        let handle = FiberHandle {
            header: header.clone(),
        };

        let expires = Deadline::after_from(Instant::now(), lifetime);
        let body: Body = {
            let shared = shared.clone();
            let handle = handle.clone();
            Box::new(move |_: Wakeup, suspend: &Suspend<Wakeup, Request>| {
                let fiber_dozer = FiberDozer::new(suspend, shared, handle);

                loop {
                    f(&fiber_dozer);

                    if lifetime.is_zero()
                        || fiber_dozer.handle().is_stopped()
                        || expires.is_due(Instant::now())
                    {
                        break;
                    }

                    // Re-admitted on the next tick.
                    fiber_dozer.yield_now();
                }
            })
        };

        tracing::trace!(fiber.id = %header.id, ?lifetime, %location, "fiber created");

        let task = Self {
            header,
            fiber: None,
            body: Some(body),
            slot: None,
            wakeup: Wakeup::Start,
        };
        (task, handle)
    }

    pub(crate) fn id(&self) -> FiberId {
        self.header.id()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.header.is_stopped()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // The scheduler unwinds fibers before dropping them. Reaching this with a live fiber
        // means its stack might not be in place anymore, so leak instead of unwinding.
        if let Some(fiber) = self.fiber.as_mut()
            && !fiber.done()
        {
            tracing::warn!(fiber.id = %self.header.id, "leaking the stack of a live fiber");
            // Safety: leaking is memory safe for the fiber itself
            unsafe { fiber.force_reset() }
        }
        self.header.set_status(FiberStatus::Finished);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.header.id)
            .field("slot", &self.slot)
            .field("wakeup", &self.wakeup)
            .field("started", &self.fiber.is_some())
            .finish_non_exhaustive()
    }
}
