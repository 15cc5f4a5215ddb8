// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Raw execution contexts.
//!
//! An [`ExecutionContext`] is a snapshot of the callee-saved CPU state of a
//! suspended thread of execution together with the bounds of the stack it runs
//! on. It is the only machinery needed for cooperative switching:
//!
//! - [`capture`] records the current state, `setjmp` style,
//! - [`activate`] unconditionally resumes a context, `longjmp` style,
//! - [`exchange`] does both at once and is what fibers use to yield and resume,
//! - [`build`] prepares a context that starts a function on a fresh stack.
//!
//! None of these allocate and none of them check anything: activating a
//! context whose stack has been freed or whose entry function has returned
//! is undefined behaviour.

use crate::arch;
use crate::stack::FiberStack;

/// The saved state of a suspended thread of execution.
#[repr(C)]
#[derive(Debug)]
pub struct ExecutionContext {
    // The switch routines address this field directly so it must stay first.
    regs: arch::Registers,
    base: usize,
    limit: usize,
}

impl ExecutionContext {
    /// Returns an uninitialized context.
    ///
    /// It is only valid as the `out` argument of [`capture`] or [`exchange`],
    /// or as the target of [`build`].
    pub const fn new() -> Self {
        Self {
            regs: arch::Registers::zeroed(),
            base: 0,
            limit: 0,
        }
    }

    /// The highest address of the stack this context was built on, or `0` if it
    /// runs on a stack it did not create.
    pub fn stack_base(&self) -> usize {
        self.base
    }

    /// The lowest usable address of the stack this context was built on.
    pub fn stack_limit(&self) -> usize {
        self.limit
    }

    /// The stack pointer saved by the last [`capture`] or [`exchange`].
    ///
    /// Everything below this address (minus the red zone) is dead while the
    /// context is suspended.
    pub fn stack_pointer(&self) -> usize {
        self.regs.stack_pointer()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the calling thread of execution in `ctx`.
///
/// Returns `false` when called directly and `true` when control re-enters
/// through [`activate`] or [`exchange`].
///
/// # Safety
///
/// This function returns twice. Locals of the calling frame that were modified
/// after the capture hold unspecified values when it returns the second time,
/// and the calling frame must still be live when `ctx` is activated.
pub use arch::capture;

/// Switches to `ctx`. Never returns.
///
/// # Safety
///
/// `ctx` must hold state recorded by [`capture`] or [`exchange`] whose frame is
/// still live, or state prepared by [`build`] whose stack is still allocated.
/// Nothing on the current stack is dropped.
pub use arch::activate;

/// Records the caller in `out` and switches to `to`. Returns once something
/// activates `out`.
///
/// # Safety
///
/// Same requirements on `to` as [`activate`]. `out` and `to` must not alias.
pub use arch::exchange;

/// Prepares `ctx` so that activating it calls `entry(arg)` at the top of
/// `stack` with no predecessor frame.
///
/// # Safety
///
/// The stack must stay allocated, and must not be used by anything else, for
/// as long as the context may run. It must be large enough for everything
/// `entry` does: overflowing it is not detected beyond the guard page a
/// [`DefaultFiberStack`](crate::DefaultFiberStack) carries.
pub unsafe fn build<S: FiberStack + ?Sized>(
    ctx: &mut ExecutionContext,
    entry: unsafe extern "C" fn(usize) -> !,
    arg: usize,
    stack: &S,
) {
    let top = stack.top().get() & !(arch::STACK_ALIGNMENT - 1);

    // Safety: ensured by caller
    ctx.regs = unsafe { arch::Registers::fresh(top, entry, arg) };
    ctx.base = top;
    ctx.limit = stack.bottom().get();
}
