// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::{Duration, Instant};

/// A point in time something should happen at, or never.
///
/// `Never` sorts after every instant so deadlines can key time-ordered queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    At(Instant),
    Never,
}

// === impl Deadline ===

impl Deadline {
    /// The deadline `timeout` from now. Timeouts too large to represent never expire.
    pub fn after(timeout: Duration) -> Self {
        Self::after_from(Instant::now(), timeout)
    }

    /// The deadline `timeout` after `now`.
    pub fn after_from(now: Instant, timeout: Duration) -> Self {
        now.checked_add(timeout).map_or(Deadline::Never, Deadline::At)
    }

    /// Time left until the deadline, zero if it passed, `None` if it never expires.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Deadline::At(at) => Some(at.saturating_duration_since(now)),
            Deadline::Never => None,
        }
    }

    /// Like [`remaining`](Self::remaining) but maps `Never` to [`Duration::MAX`], the
    /// "no timeout" value of [`Dozer::doze`](crate::Dozer::doze).
    pub fn timeout(&self, now: Instant) -> Duration {
        self.remaining(now).unwrap_or(Duration::MAX)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self {
            Deadline::At(at) => *at <= now,
            Deadline::Never => false,
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::At(at) => Some(*at),
            Deadline::Never => None,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}
