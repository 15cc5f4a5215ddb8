// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::thread::Thread;
use core::cell::OnceCell;
use core::fmt;
use static_assertions::assert_impl_all;

/// A cross-thread "the thing you waited for happened" signal.
///
/// A waker is a shared flag. [`wake`](Waker::wake) sets it, and also wakes the waker's
/// parent (if it has one) so a signal propagates up a chain of wakers. Waking can
/// additionally unpark an OS thread ([`Waker::for_thread`]) or be forwarded to a target
/// that is swapped at runtime ([`Waker::relay`]).
///
/// Cloning a waker is cheap and all clones share the same flag.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<Inner>,
}
assert_impl_all!(Waker: Send, Sync);

struct Inner {
    woken: AtomicBool,
    parent: Option<Waker>,
    signal: Signal,
}

enum Signal {
    None,
    Unpark(Thread),
    Relay(spin::Mutex<Option<Waker>>),
}

// === impl Waker ===

impl Waker {
    /// Creates a plain waker that nobody is notified about.
    pub fn new() -> Self {
        Self::with_signal(None, Signal::None)
    }

    /// Creates a secondary waker: waking it also wakes `parent`.
    pub fn with_parent(parent: Waker) -> Self {
        Self::with_signal(Some(parent), Signal::None)
    }

    /// Creates a waker that unparks `thread` when woken.
    pub fn for_thread(thread: Thread) -> Self {
        Self::with_signal(None, Signal::Unpark(thread))
    }

    /// Creates a relay: a waker that forwards every wake to whatever target is currently
    /// installed with [`set_relay_target`](Waker::set_relay_target).
    pub fn relay() -> Self {
        Self::with_signal(None, Signal::Relay(spin::Mutex::new(None)))
    }

    fn with_signal(parent: Option<Waker>, signal: Signal) -> Self {
        Self {
            inner: Arc::new(Inner {
                woken: AtomicBool::new(false),
                parent,
                signal,
            }),
        }
    }

    /// Sets this waker and, transitively, all of its parents.
    ///
    /// Waking is idempotent: waking an already woken waker has no further effect on its
    /// observable state.
    pub fn wake(&self) {
        let mut next = Some(self);
        while let Some(waker) = next {
            waker.inner.woken.store(true, Ordering::Release);
            waker.inner.signal.notify();
            next = waker.inner.parent.as_ref();
        }
    }

    /// Returns whether this waker has been woken since it was last reset.
    pub fn state(&self) -> bool {
        self.inner.woken.load(Ordering::Acquire)
    }

    /// Clears the flag so the waker can be reused.
    ///
    /// Only the single consumer of the waker may call this, otherwise a wake can be lost.
    pub fn reset(&self) {
        self.inner.woken.store(false, Ordering::Release);
    }

    /// Clears the flag and returns whether it was set, consuming the wake.
    pub fn take(&self) -> bool {
        self.inner.woken.swap(false, Ordering::AcqRel)
    }

    /// Whether this is the only handle to the waker.
    ///
    /// Handles held as the parent of another waker count.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// The waker that is woken together with this one.
    pub fn parent(&self) -> Option<&Waker> {
        self.inner.parent.as_ref()
    }

    /// Whether both handles refer to the same waker.
    pub fn ptr_eq(&self, other: &Waker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Installs (or removes) the waker that wakes of this relay are forwarded to.
    ///
    /// # Panics
    ///
    /// Panics if this waker was not created with [`Waker::relay`].
    pub fn set_relay_target(&self, target: Option<Waker>) {
        let Signal::Relay(slot) = &self.inner.signal else {
            panic!("set_relay_target called on a waker that is not a relay");
        };
        let prev = core::mem::replace(&mut *slot.lock(), target);
        drop(prev);
    }
}

impl Default for Waker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.signal {
            Signal::None => "plain",
            Signal::Unpark(_) => "thread",
            Signal::Relay(_) => "relay",
        };

        f.debug_struct("Waker")
            .field("addr", &core::ptr::from_ref::<Inner>(&self.inner))
            .field("kind", &kind)
            .field("woken", &self.state())
            .field("parent", &self.inner.parent)
            .finish()
    }
}

// === impl Signal ===

impl Signal {
    fn notify(&self) {
        match self {
            Signal::None => {}
            Signal::Unpark(thread) => {
                tracing::trace!(thread = ?thread.id(), "unparking");
                thread.unpark();
            }
            Signal::Relay(slot) => {
                // Wake outside the lock, the target may be a relay itself.
                let target = slot.lock().clone();
                if let Some(target) = target {
                    target.wake();
                }
            }
        }
    }
}

/// The waker bookkeeping of a single dozer.
///
/// Every dozer owns one *root* waker, which is the flag its `doze` consumes. Handing
/// wakers out follows a small state machine:
///
/// - **empty**: the root is created on first use,
/// - **owned**: nobody but the cell holds the root, so any pending wake is stale. The
///   root is reset and handed out again,
/// - **shared**: someone still holds the root or a waker derived from it and may be about
///   to wake it. A new secondary waker whose parent is the root is handed out instead and
///   the root keeps its state, so a wake that is in flight during the handoff is not lost.
#[derive(Debug, Default)]
pub struct WakerCell {
    root: OnceCell<Waker>,
}

impl WakerCell {
    pub const fn new() -> Self {
        Self {
            root: OnceCell::new(),
        }
    }

    /// Returns the root waker, creating it with `init` if necessary.
    pub fn root(&self, init: impl FnOnce() -> Waker) -> &Waker {
        self.root.get_or_init(init)
    }

    /// Returns a waker whose wakes reach the root.
    pub fn get_waker(&self, init: impl FnOnce() -> Waker) -> Waker {
        let root = self.root(init);

        if root.is_unique() {
            root.reset();
            root.clone()
        } else {
            tracing::trace!(?root, "root waker is shared, handing out a secondary waker");
            Waker::with_parent(root.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;

    #[cfg(not(loom))]
    #[test]
    fn wake_is_idempotent() {
        let waker = Waker::new();
        waker.wake();
        waker.wake();
        assert!(waker.state());
        assert!(waker.take());
        assert!(!waker.take());
    }

    #[cfg(not(loom))]
    #[test]
    fn wake_propagates_to_parents() {
        let root = Waker::new();
        let middle = Waker::with_parent(root.clone());
        let leaf = Waker::with_parent(middle.clone());

        leaf.wake();
        assert!(leaf.state());
        assert!(middle.state());
        assert!(root.state());

        root.reset();
        middle.wake();
        assert!(root.state());

        // Wakes only travel upwards.
        for waker in [&root, &middle, &leaf] {
            waker.reset();
        }
        root.wake();
        assert!(!middle.state());
        assert!(!leaf.state());
    }

    #[cfg(not(loom))]
    #[test]
    fn relay_forwards_to_installed_target() {
        let relay = Waker::relay();
        let target = Waker::new();

        relay.wake();
        assert!(relay.take());

        relay.set_relay_target(Some(target.clone()));
        relay.wake();
        assert!(target.take());

        relay.set_relay_target(None);
        relay.wake();
        assert!(!target.state());
        assert!(relay.state());
    }

    #[cfg(not(loom))]
    #[test]
    #[should_panic(expected = "not a relay")]
    fn relay_target_on_plain_waker() {
        Waker::new().set_relay_target(None);
    }

    #[cfg(not(loom))]
    #[test]
    fn cell_reuses_unique_root() {
        let cell = WakerCell::new();

        let first = cell.get_waker(Waker::new);
        first.wake();
        drop(first);

        // The only remaining handle is the cell's, so the stale wake is cleared.
        let second = cell.get_waker(Waker::new);
        assert!(second.ptr_eq(cell.root(Waker::new)));
        assert!(!second.state());
    }

    #[cfg(not(loom))]
    #[test]
    fn cell_hands_out_secondary_when_shared() {
        let cell = WakerCell::new();

        let first = cell.get_waker(Waker::new);
        let second = cell.get_waker(Waker::new);

        assert!(!second.ptr_eq(&first));
        assert!(second.parent().unwrap().ptr_eq(&first));

        second.wake();
        assert!(cell.root(Waker::new).take());

        // A wake on the first waker arriving after the handoff still reaches the root.
        first.wake();
        assert!(cell.root(Waker::new).take());
    }

    #[test]
    fn wake_from_other_thread() {
        loom::model(|| {
            let root = Waker::new();
            let secondary = Waker::with_parent(root.clone());

            let th = loom::thread::spawn(move || secondary.wake());

            th.join().unwrap();
            assert!(root.take());
        });
    }

    #[test]
    fn concurrent_wakes_are_observed_once() {
        loom::model(|| {
            let waker = Waker::new();
            let a = waker.clone();
            let b = waker.clone();

            let th1 = loom::thread::spawn(move || a.wake());
            let th2 = loom::thread::spawn(move || b.wake());

            let early = waker.take();
            th1.join().unwrap();
            th2.join().unwrap();
            let late = waker.take();

            // At least one of the two observations sees the wakes, and once a take
            // after both wakes consumed the flag it stays consumed.
            assert!(early || late);
            assert!(!waker.take());
        });
    }
}
