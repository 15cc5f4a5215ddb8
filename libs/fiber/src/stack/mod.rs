// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod unix;

pub use unix::{DefaultFiberStack, page_size};

pub type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Default size of a [`DefaultFiberStack`], excluding guard pages.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

pub use crate::arch::STACK_ALIGNMENT;

/// A region of memory a fiber can run on.
///
/// # Safety
///
/// `bottom..top` must be readable and writable memory that stays valid for as
/// long as a fiber runs on it.
pub unsafe trait FiberStack {
    /// Returns the highest address (start address) of the stack.
    /// This must be aligned to [`STACK_ALIGNMENT`]
    fn top(&self) -> StackPointer;

    /// Returns the lowest usable address of the stack, excluding guard pages.
    fn bottom(&self) -> StackPointer;

    /// Number of usable bytes.
    fn len(&self) -> usize {
        self.top().get() - self.bottom().get()
    }

    /// Whether `addr` points into this stack.
    fn contains(&self, addr: usize) -> bool {
        (self.bottom().get()..self.top().get()).contains(&addr)
    }
}

/// A mutable reference to a stack can be used as a stack. The lifetime of the
/// resulting fiber will be bound to that of the reference.
// Safety: forwards to the underlying stack
unsafe impl<S: FiberStack> FiberStack for &mut S {
    #[inline]
    fn top(&self) -> StackPointer {
        (**self).top()
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        (**self).bottom()
    }
}

/// A stack whose memory is owned by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFiberStack {
    top: StackPointer,
    bottom: StackPointer,
}

impl RawFiberStack {
    /// # Safety
    ///
    /// `bottom..top` must satisfy the requirements of [`FiberStack`] for as long
    /// as this value, or any fiber built on it, is in use. `top` must be
    /// aligned to [`STACK_ALIGNMENT`].
    pub unsafe fn from_raw_parts(bottom: StackPointer, top: StackPointer) -> Self {
        debug_assert!(bottom < top);
        debug_assert_eq!(top.get() % STACK_ALIGNMENT, 0);
        Self { top, bottom }
    }

    /// Borrows the bounds of another stack.
    ///
    /// # Safety
    ///
    /// `stack` must outlive every use of the returned value.
    pub unsafe fn borrowed<S: FiberStack + ?Sized>(stack: &S) -> Self {
        // Safety: ensured by caller
        unsafe { Self::from_raw_parts(stack.bottom(), stack.top()) }
    }
}

// Safety: ensured by the constructor contract
unsafe impl FiberStack for RawFiberStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        self.bottom
    }
}
