// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::thread::{self, Thread};
use crate::time::Deadline;
use crate::{Dozer, Waker, WakerCell};
use core::marker::PhantomData;
use std::time::{Duration, Instant};

/// A [`Dozer`] that blocks the OS thread it was created on.
///
/// `doze` parks the thread and the dozer's wakers unpark it. The dozer is bound to its
/// thread and cannot be sent elsewhere.
#[derive(Debug)]
pub struct ThreadDozer {
    thread: Thread,
    wakers: WakerCell,
    yield_duration: Duration,
    _not_send: PhantomData<*const ()>,
}

impl ThreadDozer {
    /// Creates a dozer for the calling thread whose `yield_now` is a plain OS yield.
    pub fn for_current() -> Self {
        Self::with_yield_duration(Duration::ZERO)
    }

    /// Creates a dozer for the calling thread whose `yield_now` sleeps for
    /// `yield_duration`, which keeps busy polling loops from spinning a core.
    pub fn with_yield_duration(yield_duration: Duration) -> Self {
        Self {
            thread: thread::current(),
            wakers: WakerCell::new(),
            yield_duration,
            _not_send: PhantomData,
        }
    }

    fn root(&self) -> &Waker {
        self.wakers
            .root(|| Waker::for_thread(self.thread.clone()))
    }

    #[cfg(not(loom))]
    fn park_timeout(timeout: Duration) {
        thread::park_timeout(timeout);
    }

    #[cfg(loom)]
    fn park_timeout(_timeout: Duration) {
        unreachable!("loom doesn't support `park_timeout`");
    }
}

impl Dozer for ThreadDozer {
    fn yield_now(&self) {
        if self.yield_duration.is_zero() {
            thread::yield_now();
        } else {
            self.sleep(self.yield_duration);
        }
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            thread::yield_now();
        } else {
            std::thread::sleep(duration);
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

        tracing::trace!(?timeout, "dozing");
        let deadline = Deadline::after(timeout);
        loop {
            match deadline.remaining(Instant::now()) {
                None => thread::park(),
                Some(left) if left.is_zero() => return root.take(),
                Some(left) => Self::park_timeout(left),
            }

            // Unparks can be spurious, only the root flag counts.
            if root.take() {
                return true;
            }
        }
    }

    fn get_waker(&self) -> Waker {
        self.wakers
            .get_waker(|| Waker::for_thread(self.thread.clone()))
    }
}
