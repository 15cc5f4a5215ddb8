// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Physical stacks shared by many fibers.
//!
//! The pool owns a fixed number of stack slots. Each fiber is pinned to one slot for its
//! whole life, but only one fiber at a time, the slot's *tenant*, has its stack contents
//! in place. Before a different fiber runs on the slot the tenant is *parked*: the live
//! part of its stack, from its saved stack pointer to the top of the slot, is copied into
//! a side buffer. The bytes are copied back, to the same addresses, right before the
//! parked fiber runs again. Pointers into a parked stack are therefore only valid while
//! the owning fiber runs.

use crate::task::FiberId;
use fiber::{DefaultFiberStack, FiberStack, RawFiberStack};
use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::ptr;

/// Bytes below the saved stack pointer that may still be live. The System V x86_64 ABI
/// lets leaf code use this much without moving the stack pointer.
const RED_ZONE: usize = 128;

#[derive(Debug)]
pub(crate) struct StackPool {
    slots: Box<[Slot]>,
    parked: HashMap<FiberId, ParkedStack>,
    clock: u64,
}

#[derive(Debug)]
struct Slot {
    stack: DefaultFiberStack,
    tenant: Option<Tenant>,
    last_used: u64,
}

#[derive(Debug, Clone, Copy)]
struct Tenant {
    id: FiberId,
    /// The saved stack pointer, `None` while the tenant runs.
    sp: Option<usize>,
}

#[derive(Debug)]
struct ParkedStack {
    /// Address the first byte of `bytes` is restored to.
    start: usize,
    bytes: Box<[u8]>,
}

impl StackPool {
    pub(crate) fn new(count: usize, stack_size: usize) -> io::Result<Self> {
        let slots = (0..count)
            .map(|_| {
                Ok(Slot {
                    stack: DefaultFiberStack::new(stack_size)?,
                    tenant: None,
                    last_used: 0,
                })
            })
            .collect::<io::Result<Box<[_]>>>()?;

        Ok(Self {
            slots,
            parked: HashMap::new(),
            clock: 0,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of fibers whose stacks are currently parked.
    pub(crate) fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// The address ranges of all slots.
    pub(crate) fn ranges(&self) -> Box<[Range<usize>]> {
        self.slots
            .iter()
            .map(|slot| slot.stack.bottom().get()..slot.stack.top().get())
            .collect()
    }

    /// Picks the slot a new fiber is pinned to: a free one if possible, otherwise the
    /// least recently used.
    pub(crate) fn assign(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| (slot.tenant.is_some(), slot.last_used))
            .map_or(0, |(idx, _)| idx)
    }

    /// Returns the stack a fiber pinned to `slot` runs on.
    pub(crate) fn stack(&self, slot: usize) -> RawFiberStack {
        // Safety: the slot's memory lives as long as the pool, and the scheduler retires
        // every fiber before the pool is dropped.
        unsafe { RawFiberStack::borrowed(&self.slots[slot].stack) }
    }

    /// Puts the stack contents of `id` in place in `slot`, parking the current tenant if
    /// it is someone else.
    pub(crate) fn enter(&mut self, slot: usize, id: FiberId) {
        self.clock += 1;

        let Self {
            slots,
            parked,
            clock,
        } = self;
        let slot = &mut slots[slot];
        slot.last_used = *clock;

        match slot.tenant {
            Some(tenant) if tenant.id == id => {}
            Some(tenant) => {
                let Some(sp) = tenant.sp else {
                    unreachable!("fiber {} is running while another enters its slot", tenant.id);
                };
                let stack = park(&slot.stack, sp);
                tracing::debug!(
                    fiber.id = %tenant.id,
                    bytes = stack.bytes.len(),
                    "parked stack"
                );
                parked.insert(tenant.id, stack);

                if let Some(stack) = parked.remove(&id) {
                    tracing::debug!(fiber.id = %id, bytes = stack.bytes.len(), "restoring stack");
                    restore(&slot.stack, &stack);
                }
            }
            None => {
                if let Some(stack) = parked.remove(&id) {
                    tracing::debug!(fiber.id = %id, bytes = stack.bytes.len(), "restoring stack");
                    restore(&slot.stack, &stack);
                }
            }
        }

        slot.tenant = Some(Tenant { id, sp: None });
    }

    /// Records that the tenant of `slot` suspended with stack pointer `sp`.
    pub(crate) fn leave(&mut self, slot: usize, id: FiberId, sp: usize) {
        let slot = &mut self.slots[slot];
        debug_assert!(slot.tenant.is_some_and(|tenant| tenant.id == id));
        debug_assert!(slot.stack.contains(sp));
        slot.tenant = Some(Tenant { id, sp: Some(sp) });
    }

    /// Forgets everything about a finished fiber.
    pub(crate) fn release(&mut self, slot: Option<usize>, id: FiberId) {
        if let Some(slot) = slot {
            let slot = &mut self.slots[slot];
            if slot.tenant.is_some_and(|tenant| tenant.id == id) {
                slot.tenant = None;
            }
        }
        self.parked.remove(&id);
    }
}

fn park(stack: &DefaultFiberStack, sp: usize) -> ParkedStack {
    let start = sp.saturating_sub(RED_ZONE).max(stack.bottom().get());
    let len = stack.top().get() - start;

    let mut bytes = vec![0u8; len].into_boxed_slice();
    // Safety: start..top lies inside the slot, which no fiber is running on right now.
    unsafe {
        ptr::copy_nonoverlapping(start as *const u8, bytes.as_mut_ptr(), len);
    }

    ParkedStack { start, bytes }
}

fn restore(stack: &DefaultFiberStack, parked: &ParkedStack) {
    debug_assert!(stack.contains(parked.start));
    debug_assert_eq!(parked.start + parked.bytes.len(), stack.top().get());

    // Safety: the parked range was copied out of this very slot, which no fiber is running
    // on right now.
    unsafe {
        ptr::copy_nonoverlapping(
            parked.bytes.as_ptr(),
            parked.start as *mut u8,
            parked.bytes.len(),
        );
    }
}
