// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use dozer::Deadline;
use std::collections::BTreeMap;
use std::time::Instant;

/// A queue ordered by deadline. Entries with equal deadlines keep insertion order.
#[derive(Debug)]
pub(crate) struct TimerQueue<T> {
    entries: BTreeMap<(Deadline, u64), T>,
    next_seq: u64,
}

impl<T> TimerQueue<T> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn push(&mut self, deadline: Deadline, value: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), value);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest deadline in the queue.
    pub(crate) fn next_deadline(&self) -> Option<Deadline> {
        self.entries.first_key_value().map(|((deadline, _), _)| *deadline)
    }

    /// Removes every entry whose deadline is at or before `now`, in order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if !entry.key().0.is_due(now) {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Removes every entry `pred` returns true for, in order.
    pub(crate) fn extract_if(&mut self, mut pred: impl FnMut(&Deadline, &mut T) -> bool) -> Vec<T> {
        let keys: Vec<_> = self
            .entries
            .iter_mut()
            .filter_map(|(key, value)| pred(&key.0, value).then_some(*key))
            .collect();

        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    /// Removes every entry, in order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + use<T> {
        core::mem::take(&mut self.entries).into_values()
    }
}
