// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded scheduler for stackful fibers.
//!
//! ```ignore
//! use dozer::Dozer;
//! use std::time::Duration;
//!
//! let mut sched = fiber_sched::Scheduler::new()?;
//!
//! sched.add(|dozer| {
//!     dozer.sleep(Duration::from_millis(10));
//!     println!("world");
//! });
//! sched.add(|_| println!("hello"));
//!
//! sched.run();
//! ```
//!
//! Fibers block through the [`FiberDozer`] they are handed, which implements the
//! [`Dozer`](dozer::Dozer) contract. Code written against `&dyn Dozer`, such as
//! [`dozer::oneshot`], therefore runs unchanged on a fiber and on a plain OS thread.
//!
//! To use many cores, run one scheduler per OS thread and let their fibers talk through
//! [`Waker`](dozer::Waker)s and channels.

mod builder;
mod error;
mod fiber_dozer;
mod queue;
mod scheduler;
mod stack_pool;
mod task;

pub use builder::{Builder, Config};
pub use error::BuildError;
pub use fiber_dozer::FiberDozer;
pub use scheduler::Scheduler;
pub use task::{FiberHandle, FiberId, FiberStatus};
