// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{DEFAULT_STACK_SIZE, FiberStack, MIN_STACK_SIZE, StackPointer};
use std::io;
use std::ptr::{self, NonNull};

/// An `mmap`ed stack with a guard page below it.
#[derive(Debug)]
pub struct DefaultFiberStack {
    mmap: NonNull<libc::c_void>,
    mmap_len: usize,
    guard_len: usize,
}

impl DefaultFiberStack {
    /// Creates a new stack which has at least the given capacity.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the memory could not be mapped or protected, and
    /// [`io::ErrorKind::InvalidInput`] if the size overflows.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // Round the size up to a page boundary and add a guard page.
        let page_size = page_size();
        let usable = size
            .checked_next_multiple_of(page_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows"))?;
        let mmap_len = usable
            .checked_add(page_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows"))?;

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: we map fresh anonymous memory and only touch what we mapped
        unsafe {
            // Reserve some address space for the stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this will
            // be dropped and the memory will be unmapped.
            let out = Self {
                mmap: NonNull::new_unchecked(mmap),
                mmap_len,
                guard_len: page_size,
            };

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            tracing::trace!(bottom = ?mmap, len = mmap_len, "mapped fiber stack");

            Ok(out)
        }
    }
}

impl Default for DefaultFiberStack {
    /// Creates a [`DEFAULT_STACK_SIZE`] stack.
    ///
    /// # Panics
    ///
    /// Panics if the memory cannot be mapped.
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        // Safety: we mapped exactly this region in `new`
        let ret = unsafe { libc::munmap(self.mmap.as_ptr(), self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

// Safety: `bottom..top` is mapped read-write until drop
unsafe impl FiberStack for DefaultFiberStack {
    fn top(&self) -> StackPointer {
        // Safety: the mapping is non-null and its end does not wrap
        unsafe { StackPointer::new_unchecked(self.mmap.as_ptr() as usize + self.mmap_len) }
    }

    fn bottom(&self) -> StackPointer {
        // Safety: the mapping is non-null and its end does not wrap
        unsafe { StackPointer::new_unchecked(self.mmap.as_ptr() as usize + self.guard_len) }
    }
}

/// The system page size.
///
/// # Panics
///
/// Panics if the system reports a page size that is not a power of two.
pub fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).unwrap_or(MIN_STACK_SIZE);
    assert!(pagesize.is_power_of_two());
    pagesize
}
