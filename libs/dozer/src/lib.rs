// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The suspend/resume contract shared by OS threads and fibers.
//!
//! Library code that needs to block (a channel receive, a mutex acquisition) is written
//! against a [`Dozer`] and a [`Waker`] instead of a concrete blocking primitive:
//!
//! ```ignore
//! let waker = dozer.get_waker();
//! register_somewhere(waker);
//! if !condition() {
//!     dozer.doze(timeout);
//! }
//! ```
//!
//! On an OS thread ([`ThreadDozer`]) dozing parks the thread, inside a fiber it suspends
//! the fiber and lets its scheduler run something else. Waking is the same in both cases
//! and works from any thread.

mod loom;
pub mod oneshot;
mod thread;
mod time;
mod waker;

pub use thread::ThreadDozer;
pub use time::Deadline;
pub use waker::{Waker, WakerCell};

use core::time::Duration;

/// Something that knows how to block the current thread of execution.
pub trait Dozer {
    /// Gives others a chance to run, then continues.
    fn yield_now(&self) {
        self.sleep(Duration::ZERO);
    }

    /// Blocks for at least `duration`. It may be longer, never shorter.
    fn sleep(&self, duration: Duration);

    /// Blocks until the waker handed out by [`get_waker`](Dozer::get_waker) fires or
    /// `timeout` elapses, whichever comes first.
    ///
    /// Returns `true` if a wake was observed, consuming it. [`Duration::MAX`] means no
    /// timeout, [`Duration::ZERO`] polls and never blocks.
    ///
    /// A dozer that can no longer block, such as the one of a fiber that is being torn
    /// down, returns `false` right away whatever the timeout. Callers must treat `false`
    /// as the end of their wait and not doze again for the same condition.
    fn doze(&self, timeout: Duration) -> bool;

    /// Returns a waker that ends a current or future [`doze`](Dozer::doze).
    ///
    /// Asking for a new waker while an earlier one is still held elsewhere never loses a
    /// wake sent through the earlier one.
    fn get_waker(&self) -> Waker;
}

impl<D: Dozer + ?Sized> Dozer for &D {
    fn yield_now(&self) {
        (**self).yield_now();
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }

    fn doze(&self, timeout: Duration) -> bool {
        (**self).doze(timeout)
    }

    fn get_waker(&self) -> Waker {
        (**self).get_waker()
    }
}

impl<D: Dozer + ?Sized> Dozer for Box<D> {
    fn yield_now(&self) {
        (**self).yield_now();
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }

    fn doze(&self, timeout: Duration) -> bool {
        (**self).doze(timeout)
    }

    fn get_waker(&self) -> Waker {
        (**self).get_waker()
    }
}
