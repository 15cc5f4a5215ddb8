// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Shared;
use crate::task::{FiberHandle, Request, Task, Wakeup};
use core::fmt;
use core::panic::Location;
use dozer::{Deadline, Dozer, Waker, WakerCell};
use fiber::Suspend;
use std::rc::Rc;
use std::time::Duration;

/// The [`Dozer`] of a fiber running on a [`Scheduler`](crate::Scheduler).
///
/// Every fiber body receives one. Blocking through it suspends the fiber and hands the
/// thread back to the scheduler, which resumes the fiber once the requested condition
/// holds. Code written against `&dyn Dozer` works unchanged with it.
///
/// While the fiber is being torn down (see [`FiberHandle::stop`]) the dozer never
/// suspends: `sleep` and `yield_now` return immediately and `doze` returns `false`.
pub struct FiberDozer<'a> {
    suspend: &'a Suspend<Wakeup, Request>,
    shared: Rc<Shared>,
    handle: FiberHandle,
    wakers: WakerCell,
}

impl<'a> FiberDozer<'a> {
    pub(crate) fn new(
        suspend: &'a Suspend<Wakeup, Request>,
        shared: Rc<Shared>,
        handle: FiberHandle,
    ) -> Self {
        Self {
            suspend,
            shared,
            handle,
            wakers: WakerCell::new(),
        }
    }

    /// The handle of the fiber this dozer belongs to.
    pub fn handle(&self) -> &FiberHandle {
        &self.handle
    }

    /// Adds a fiber to the scheduler running this one. See [`Scheduler::add`].
    ///
    /// The new fiber becomes ready once the current fiber suspends or returns; it never
    /// joins the batch of fibers the current tick is draining.
    ///
    /// [`Scheduler::add`]: crate::Scheduler::add
    #[track_caller]
    pub fn spawn<F>(&self, f: F) -> FiberHandle
    where
        F: FnMut(&FiberDozer<'_>) + 'static,
    {
        self.spawn_with_lifetime(Duration::ZERO, f)
    }

    /// Like [`spawn`](Self::spawn), but the body is re-run until it has been alive for
    /// `lifetime`. See [`Scheduler::add_with_lifetime`](crate::Scheduler::add_with_lifetime).
    #[track_caller]
    pub fn spawn_with_lifetime<F>(&self, lifetime: Duration, f: F) -> FiberHandle
    where
        F: FnMut(&FiberDozer<'_>) + 'static,
    {
        let (task, handle) = Task::new(&self.shared, lifetime, Location::caller(), f);
        self.shared.spawned.borrow_mut().push(task);
        handle
    }

    /// Whether `ptr` points into one of the physical stacks of this scheduler.
    ///
    /// Such memory is only valid while its fiber runs, see
    /// [`Scheduler::is_unowned_data`](crate::Scheduler::is_unowned_data).
    pub fn is_unowned_data<T: ?Sized>(&self, ptr: *const T) -> bool {
        self.shared.is_unowned_data(ptr.cast::<u8>())
    }

    fn root(&self) -> &Waker {
        self.wakers
            .root(|| Waker::with_parent(self.shared.relay.clone()))
    }

    fn suspend(&self, request: Request) -> Option<Wakeup> {
        if self.suspend.is_unwinding() {
            return None;
        }
        Some(self.suspend.suspend(request))
    }
}

impl Dozer for FiberDozer<'_> {
    fn yield_now(&self) {
        self.suspend(Request::Yield);
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            self.yield_now();
        } else {
            self.suspend(Request::Sleep(Deadline::after(duration)));
        }
    }

    fn doze(&self, timeout: Duration) -> bool {
        let root = self.root();
        if root.take() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let request = Request::Doze {
            deadline: Deadline::after(timeout),
            waker: root.clone(),
        };
        // The scheduler consumes the wake it reports.
        self.suspend(request) == Some(Wakeup::Woken)
    }

    fn get_waker(&self) -> Waker {
        self.wakers
            .get_waker(|| Waker::with_parent(self.shared.relay.clone()))
    }
}

impl fmt::Debug for FiberDozer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberDozer")
            .field("fiber", &self.handle.id())
            .field("wakers", &self.wakers)
            .finish_non_exhaustive()
    }
}
