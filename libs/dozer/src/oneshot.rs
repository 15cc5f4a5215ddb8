// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A channel for sending a single value.
//!
//! Receiving blocks through a [`Dozer`], so the same receiver works on an OS thread and
//! inside a fiber. Sending never blocks and works from any thread.

use crate::loom::sync::Arc;
use crate::{Deadline, Dozer, Waker};
use core::fmt;
use core::time::Duration;
use std::time::Instant;

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        slot: spin::Mutex::new(Slot {
            value: None,
            rx_waker: None,
            tx_dropped: false,
            rx_dropped: false,
        }),
    });

    let tx = Sender {
        inner: Some(inner.clone()),
    };
    let rx = Receiver { inner };

    (tx, rx)
}

#[derive(Debug)]
pub struct Sender<T> {
    inner: Option<Arc<Inner<T>>>,
}

#[derive(Debug)]
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    slot: spin::Mutex<Slot<T>>,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    rx_waker: Option<Waker>,
    tx_dropped: bool,
    rx_dropped: bool,
}

/// The sender was dropped without sending a value.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RecvError(pub(super) ());

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Closed,
}

// === impl Sender ===

impl<T> Sender<T> {
    /// Returns true if the associated [`Receiver`] has been dropped.
    ///
    /// If `true` is returned, a call to [`send`][Sender::send] will always result in an error.
    pub fn is_closed(&self) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|inner| inner.slot.lock().rx_dropped)
    }

    /// Attempts to send a value on this channel, returning it back if it could not be sent.
    ///
    /// This method never blocks.
    ///
    /// # Errors
    ///
    /// If the receiver has been dropped the value is returned in the `Err` variant.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let Some(inner) = self.inner.take() else {
            return Err(value);
        };

        let waker = {
            let mut slot = inner.slot.lock();
            if slot.rx_dropped {
                return Err(value);
            }
            slot.value = Some(value);
            slot.rx_waker.take()
        };

        if let Some(waker) = waker {
            tracing::trace!(?waker, "value sent, waking receiver");
            waker.wake();
        }

        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        let waker = {
            let mut slot = inner.slot.lock();
            slot.tx_dropped = true;
            slot.rx_waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// === impl Receiver ===

impl<T> Receiver<T> {
    /// Takes the value if it has been sent, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] if nothing has been sent yet and
    /// [`TryRecvError::Closed`] if nothing ever will be.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let mut slot = self.inner.slot.lock();
        if let Some(value) = slot.value.take() {
            Ok(value)
        } else if slot.tx_dropped {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Blocks through `dozer` until the value arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender was dropped without sending.
    pub fn recv(mut self, dozer: &dyn Dozer) -> Result<T, RecvError> {
        self.recv_timeout(dozer, Duration::MAX)
            .map_err(|_| RecvError(()))
    }

    /// Blocks through `dozer` until the value arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`RecvTimeoutError::Timeout`] if the timeout elapsed first, or if `dozer`
    /// stopped blocking, and [`RecvTimeoutError::Closed`] if the sender was dropped
    /// without sending.
    pub fn recv_timeout(
        &mut self,
        dozer: &dyn Dozer,
        timeout: Duration,
    ) -> Result<T, RecvTimeoutError> {
        let deadline = Deadline::after(timeout);
        let mut expired = false;

        loop {
            {
                // Register before checking so a send in between wakes us.
                let mut slot = self.inner.slot.lock();
                if let Some(value) = slot.value.take() {
                    return Ok(value);
                }
                if slot.tx_dropped {
                    return Err(RecvTimeoutError::Closed);
                }
                if expired {
                    slot.rx_waker = None;
                    return Err(RecvTimeoutError::Timeout);
                }
                slot.rx_waker = Some(dozer.get_waker());
            }

            let timeout = deadline.timeout(Instant::now());
            // `false` is final, see `Dozer::doze`.
            expired = timeout.is_zero() || !dozer.doze(timeout);
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock();
        slot.rx_dropped = true;
        slot.rx_waker = None;
    }
}

// === impl errors ===

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("channel closed")
    }
}

impl core::error::Error for RecvError {}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout => f.write_str("timed out waiting on channel"),
            RecvTimeoutError::Closed => f.write_str("channel closed"),
        }
    }
}

impl core::error::Error for RecvTimeoutError {}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => f.write_str("channel empty"),
            TryRecvError::Closed => f.write_str("channel closed"),
        }
    }
}

impl core::error::Error for TryRecvError {}
