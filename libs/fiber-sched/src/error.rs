// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;

/// Errors returned when building a [`Scheduler`](crate::Scheduler).
#[derive(Debug)]
pub enum BuildError {
    /// The configured stack size is below [`fiber::MIN_STACK_SIZE`].
    StackTooSmall(usize),
    /// The scheduler was configured with zero physical stacks.
    NoPhysicalStacks,
    /// Mapping a physical stack failed.
    StackAlloc(io::Error),
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        BuildError::StackAlloc(err)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::StackTooSmall(size) => write!(
                f,
                "stack size of {size} bytes is below the minimum of {} bytes",
                fiber::MIN_STACK_SIZE
            ),
            BuildError::NoPhysicalStacks => f.write_str("at least one physical stack is required"),
            BuildError::StackAlloc(err) => write!(f, "failed to map physical stack: {err}"),
        }
    }
}

impl core::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            BuildError::StackAlloc(err) => Some(err),
            _ => None,
        }
    }
}
