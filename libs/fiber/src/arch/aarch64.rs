// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AAPCS64 context switching.
//!
//! Callee-saved state is x19-x28, the frame pointer, the link register, the
//! stack pointer, the low halves of v8-v15 and FPCR.

use crate::context::ExecutionContext;
use core::arch::naked_asm;
use core::mem::offset_of;
use static_assertions::const_assert_eq;

pub const STACK_ALIGNMENT: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    x19_x28: [usize; 10],
    fp: usize,
    /// Address execution continues at when this context is activated.
    lr: usize,
    sp: usize,
    /// Value handed to the resumed code: the first argument of a fresh entry
    /// function, or the return value of `capture`.
    arg: usize,
    d8_d15: [u64; 8],
    fpcr: usize,
}

// The assembly below hardcodes these offsets.
const_assert_eq!(offset_of!(Registers, x19_x28), 0x00);
const_assert_eq!(offset_of!(Registers, fp), 0x50);
const_assert_eq!(offset_of!(Registers, lr), 0x58);
const_assert_eq!(offset_of!(Registers, sp), 0x60);
const_assert_eq!(offset_of!(Registers, arg), 0x68);
const_assert_eq!(offset_of!(Registers, d8_d15), 0x70);
const_assert_eq!(offset_of!(Registers, fpcr), 0xb0);

impl Registers {
    pub const fn zeroed() -> Self {
        Self {
            x19_x28: [0; 10],
            fp: 0,
            lr: 0,
            sp: 0,
            arg: 0,
            d8_d15: [0; 8],
            fpcr: 0,
        }
    }

    /// Prepares a register set that enters `entry(arg)` with the stack pointer
    /// at `top`.
    ///
    /// # Safety
    ///
    /// `top` must be the 16-byte aligned, writable upper end of a stack.
    pub unsafe fn fresh(top: usize, entry: unsafe extern "C" fn(usize) -> !, arg: usize) -> Self {
        debug_assert_eq!(top % STACK_ALIGNMENT, 0);

        // A zero frame pointer terminates the frame record chain.
        Self {
            sp: top,
            lr: entry as usize,
            arg,
            ..Self::zeroed()
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.sp
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn capture(ctx: *mut ExecutionContext) -> bool {
    naked_asm! {
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        // The link register is our return address and becomes the resume address.
        "stp x29, x30, [x0, #0x50]",
        // Re-entering through `activate` makes `capture` return true.
        "mov x9, sp",
        "mov x10, #1",
        "stp x9, x10, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        "mrs x9, fpcr",
        "str x9, [x0, #0xb0]",
        "mov x0, #0",
        "ret",
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn activate(ctx: *const ExecutionContext) -> ! {
    naked_asm! {
        "ldp x19, x20, [x0, #0x00]",
        "ldp x21, x22, [x0, #0x10]",
        "ldp x23, x24, [x0, #0x20]",
        "ldp x25, x26, [x0, #0x30]",
        "ldp x27, x28, [x0, #0x40]",
        "ldp x29, x30, [x0, #0x50]",
        "ldp x9, x10, [x0, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x0, #0x70]",
        "ldp d10, d11, [x0, #0x80]",
        "ldp d12, d13, [x0, #0x90]",
        "ldp d14, d15, [x0, #0xa0]",
        "ldr x9, [x0, #0xb0]",
        "msr fpcr, x9",
        // X0 is both the return value of a captured context and the first
        // argument of a freshly built one.
        "mov x0, x10",
        "br x30",
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn exchange(out: *mut ExecutionContext, to: *const ExecutionContext) {
    naked_asm! {
        // Save the caller into `out` exactly like `capture` does.
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "mov x10, #1",
        "stp x9, x10, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        "mrs x9, fpcr",
        "str x9, [x0, #0xb0]",
        // Then load `to`, see `activate`.
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldp x9, x10, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "ldr x9, [x1, #0xb0]",
        "msr fpcr, x9",
        "mov x0, x10",
        "br x30",
    }
}
