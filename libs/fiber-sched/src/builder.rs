// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{BuildError, Scheduler};
use fiber::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Settings of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Usable bytes of every physical stack.
    pub stack_size: usize,
    /// How many physical stacks the fibers share.
    pub physical_stack_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            physical_stack_count: 2,
        }
    }
}

impl Config {
    /// Checks the settings and rounds the stack size up to whole pages.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::StackTooSmall`] or [`BuildError::NoPhysicalStacks`] if the
    /// corresponding setting is out of range.
    pub fn validate(self) -> Result<Self, BuildError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(BuildError::StackTooSmall(self.stack_size));
        }
        if self.physical_stack_count == 0 {
            return Err(BuildError::NoPhysicalStacks);
        }

        let page_size = fiber::stack::page_size();
        let stack_size = self
            .stack_size
            .checked_next_multiple_of(page_size)
            .ok_or(BuildError::StackTooSmall(self.stack_size))?;

        Ok(Self {
            stack_size,
            ..self
        })
    }
}

/// Builds a [`Scheduler`] with custom settings.
///
/// ```ignore
/// let mut sched = Scheduler::builder()
///     .stack_size(256 * 1024)
///     .physical_stack_count(4)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usable bytes of every physical stack, rounded up to the page size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    /// How many physical stacks the fibers share. More stacks mean fewer parking copies.
    pub fn physical_stack_count(mut self, count: usize) -> Self {
        self.config.physical_stack_count = count;
        self
    }

    /// Replaces all settings at once.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Maps the physical stacks and creates the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or a stack could not be mapped.
    pub fn build(self) -> Result<Scheduler, BuildError> {
        let config = self.config.validate()?;
        Scheduler::with_config(config)
    }
}
