// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System V x86_64 context switching.
//!
//! Only the callee-saved state is recorded: everything else is clobbered by
//! the `extern "C"` call into one of the routines below anyway.

use crate::context::ExecutionContext;
use core::arch::naked_asm;
use core::mem::offset_of;
use static_assertions::const_assert_eq;

pub const STACK_ALIGNMENT: usize = 16;

/// Default MXCSR: all exceptions masked, round to nearest.
const DEFAULT_MXCSR: u32 = 0x1F80;
/// Default x87 control word: all exceptions masked, 64-bit precision.
const DEFAULT_FPU_CW: u16 = 0x037F;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    rsp: usize,
    rbp: usize,
    rbx: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
    /// Address execution continues at when this context is activated.
    rip: usize,
    /// Value handed to the resumed code: the first argument of a fresh entry
    /// function, or the return value of `capture`.
    arg: usize,
    mxcsr: u32,
    fpu_cw: u16,
    _pad: u16,
}

// The assembly below hardcodes these offsets.
const_assert_eq!(offset_of!(Registers, rsp), 0x00);
const_assert_eq!(offset_of!(Registers, rbp), 0x08);
const_assert_eq!(offset_of!(Registers, rbx), 0x10);
const_assert_eq!(offset_of!(Registers, r12), 0x18);
const_assert_eq!(offset_of!(Registers, r13), 0x20);
const_assert_eq!(offset_of!(Registers, r14), 0x28);
const_assert_eq!(offset_of!(Registers, r15), 0x30);
const_assert_eq!(offset_of!(Registers, rip), 0x38);
const_assert_eq!(offset_of!(Registers, arg), 0x40);
const_assert_eq!(offset_of!(Registers, mxcsr), 0x48);
const_assert_eq!(offset_of!(Registers, fpu_cw), 0x4c);

impl Registers {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            arg: 0,
            mxcsr: DEFAULT_MXCSR,
            fpu_cw: DEFAULT_FPU_CW,
            _pad: 0,
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

        // Push a null return address. The entry function then sees the same
        // alignment as after a `call` and frame walkers stop at the null slot.
        let rsp = top - size_of::<usize>();
        // Safety: ensured by caller
        unsafe {
            (rsp as *mut usize).write(0);
        }

        Self {
            rsp,
            rip: entry as usize,
            arg,
            ..Self::zeroed()
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn capture(ctx: *mut ExecutionContext) -> bool {
    naked_asm! {
        // The return address becomes the resume address and the stack pointer
        // is recorded as it will be once we have returned to the caller.
        "mov rax, [rsp]",
        "lea rcx, [rsp + 8]",
        "mov [rdi + 0x00], rcx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov [rdi + 0x38], rax",
        // Re-entering through `activate` makes `capture` return true.
        "mov qword ptr [rdi + 0x40], 1",
        "stmxcsr dword ptr [rdi + 0x48]",
        "fnstcw word ptr [rdi + 0x4c]",
        "xor eax, eax",
        "ret",
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn activate(ctx: *const ExecutionContext) -> ! {
    naked_asm! {
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "ldmxcsr dword ptr [rdi + 0x48]",
        "fldcw word ptr [rdi + 0x4c]",
        // RAX is the return value of a captured context, RDI the first
        // argument of a freshly built one.
        "mov rax, [rdi + 0x40]",
        "mov rcx, [rdi + 0x38]",
        "mov rdi, rax",
        "jmp rcx",
    }
}

#[unsafe(naked)]
pub unsafe extern "C" fn exchange(out: *mut ExecutionContext, to: *const ExecutionContext) {
    naked_asm! {
        // Save the caller into `out` exactly like `capture` does.
        "mov rax, [rsp]",
        "lea rcx, [rsp + 8]",
        "mov [rdi + 0x00], rcx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov [rdi + 0x38], rax",
        "mov qword ptr [rdi + 0x40], 1",
        "stmxcsr dword ptr [rdi + 0x48]",
        "fnstcw word ptr [rdi + 0x4c]",
        // Then load `to`, see `activate`.
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x48]",
        "fldcw word ptr [rsi + 0x4c]",
        "mov rax, [rsi + 0x40]",
        "mov rcx, [rsi + 0x38]",
        "mov rdi, rax",
        "jmp rcx",
    }
}
