// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful coroutines.
//!
//! This crate provides the [`Fiber`] which implements stackful [`coroutines`] on top of the
//! raw [`ExecutionContext`] switching primitives in [`context`]. A fiber owns a stack and a
//! closure; [`Fiber::resume`] runs the closure until it either returns or suspends itself
//! through the [`Suspend`] handle it was given.
//!
//! Panics raised inside a fiber are caught at the fiber's entry frame and re-raised from the
//! `resume` call that was running it.
//!
//! [`coroutines`]: https://en.wikipedia.org/wiki/Coroutine

mod arch;
pub mod context;
pub mod stack;

pub use crate::context::ExecutionContext;
pub use crate::stack::{
    DEFAULT_STACK_SIZE, DefaultFiberStack, FiberStack, MIN_STACK_SIZE, RawFiberStack,
    StackPointer,
};
use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;
use core::ptr;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

/// Value returned from resuming a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FiberResult<Yield, Return> {
    /// Value returned by a fiber suspending itself with [`Suspend::suspend`].
    Yield(Yield),

    /// Value returned by a fiber returning from its main function.
    Return(Return),
}

impl<Yield, Return> FiberResult<Yield, Return> {
    /// Returns the `Yield` value as an `Option<Yield>`.
    pub fn into_yield(self) -> Option<Yield> {
        match self {
            FiberResult::Yield(val) => Some(val),
            FiberResult::Return(_) => None,
        }
    }

    /// Returns the `Return` value as an `Option<Return>`.
    pub fn into_return(self) -> Option<Return> {
        match self {
            FiberResult::Yield(_) => None,
            FiberResult::Return(val) => Some(val),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Built but never resumed.
    Fresh,
    Running,
    Suspended,
    Finished,
}

/// Panic payload used to tear down a suspended fiber.
struct ForcedUnwind;

type Body<Input, Yield, Return> = Box<dyn FnOnce(Input, &Suspend<Input, Yield>) -> Return>;

/// Heap allocated state shared between the fiber and whoever resumes it.
struct Inner<Input, Yield, Return> {
    suspend: Suspend<Input, Yield>,
    state: Cell<State>,
    /// Set by the first `resume`, independent of how the fiber finished.
    resumed: Cell<bool>,
    func: Cell<Option<Body<Input, Yield, Return>>>,
    returned: Cell<Option<thread::Result<Return>>>,
}

pub struct Fiber<Input, Yield, Return, S: FiberStack = DefaultFiberStack> {
    /// Boxed so the address handed to the entry trampoline stays put when the
    /// fiber is moved.
    inner: Box<Inner<Input, Yield, Return>>,
    /// Stack that the fiber is executing on.
    stack: S,
    /// Fiber must be !Send.
    /// ```compile_fail
    /// fn send<T: Send>() {}
    /// send::<fiber::Fiber<(), (), ()>>();
    /// ```
    _m: PhantomData<*mut ()>,
}

impl<Input, Yield, Return> Fiber<Input, Yield, Return, DefaultFiberStack> {
    /// Creates a new fiber on a freshly mapped stack of at least `stack_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack could not be mapped.
    pub fn new<F>(stack_size: usize, func: F) -> io::Result<Self>
    where
        F: FnOnce(Input, &Suspend<Input, Yield>) -> Return + 'static,
    {
        let stack = DefaultFiberStack::new(stack_size)?;
        Ok(Self::with_stack(stack, func))
    }
}

impl<Input, Yield, Return, S: FiberStack> Fiber<Input, Yield, Return, S> {
    /// Creates a new fiber running `func` on the provided [`FiberStack`].
    ///
    /// Nothing runs until the first call to [`resume`](Self::resume), whose input becomes
    /// the first argument of `func`.
    pub fn with_stack<F>(stack: S, func: F) -> Self
    where
        F: FnOnce(Input, &Suspend<Input, Yield>) -> Return + 'static,
    {
        let inner = Box::new(Inner {
            suspend: Suspend {
                context: UnsafeCell::new(ExecutionContext::new()),
                resumer: UnsafeCell::new(ExecutionContext::new()),
                input: Cell::new(None),
                yielded: Cell::new(None),
                unwinding: Cell::new(false),
            },
            state: Cell::new(State::Fresh),
            resumed: Cell::new(false),
            func: Cell::new(Some(Box::new(func))),
            returned: Cell::new(None),
        });

        // Safety: the stack is owned by the fiber and outlives every activation of the
        // context, `inner` is boxed and is only freed after the fiber finished.
        unsafe {
            context::build(
                &mut *inner.suspend.context.get(),
                fiber_entry::<Input, Yield, Return>,
                ptr::from_ref(&*inner) as usize,
                &stack,
            );
        }

        Self {
            inner,
            stack,
            _m: PhantomData,
        }
    }

    /// Resumes execution of this fiber.
    ///
    /// This function will transfer execution to the fiber and resume from where it last left
    /// off. If this is the first time the fiber runs, `input` is passed to its main function,
    /// otherwise it is returned from the [`Suspend::suspend`] call that suspended it.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has already finished, or if it is resumed from inside itself. A
    /// panic raised by the fiber's code is re-raised here and the fiber is then finished.
    pub fn resume(&mut self, input: Input) -> FiberResult<Yield, Return> {
        assert!(!self.done(), "attempt to resume a completed fiber");
        assert_ne!(
            self.inner.state.get(),
            State::Running,
            "attempt to resume a running fiber"
        );

        self.inner.resumed.set(true);
        self.inner.suspend.input.set(Some(input));
        self.switch_in();

        if let Some(val) = self.inner.suspend.yielded.take() {
            return FiberResult::Yield(val);
        }

        match self.inner.returned.take() {
            Some(Ok(val)) => FiberResult::Return(val),
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("fiber finished without a result"),
        }
    }

    /// Returns whether this fiber has been resumed at least once.
    pub fn started(&self) -> bool {
        self.inner.resumed.get()
    }

    /// Returns whether this fiber has finished executing.
    ///
    /// A fiber finishes when its main function returns, when it panics, or when it is
    /// torn down by [`force_unwind`](Self::force_unwind) or [`force_reset`](Self::force_reset).
    pub fn done(&self) -> bool {
        self.inner.state.get() == State::Finished
    }

    /// Returns the stack this fiber runs on.
    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// The saved stack pointer of a suspended fiber.
    ///
    /// Everything between this address and the top of the stack is the fiber's live
    /// state, plus a small red zone below it on some ABIs.
    pub fn stack_pointer(&self) -> Option<usize> {
        if self.inner.state.get() == State::Suspended {
            // Safety: the context is not being written to while the fiber is suspended
            Some(unsafe { (*self.inner.suspend.context.get()).stack_pointer() })
        } else {
            None
        }
    }

    /// Unwinds the stack of a suspended fiber so that every object alive on it is dropped,
    /// then marks the fiber as finished.
    ///
    /// A fiber that never ran simply has its closure dropped. If the crate is built with
    /// `panic = "abort"` the stack contents are leaked instead, see
    /// [`force_reset`](Self::force_reset).
    ///
    /// # Panics
    ///
    /// Panics if the fiber is currently running, or if its code caught the unwind and
    /// suspended again. If its code caught the unwind and then panicked with a payload of
    /// its own, that panic is re-raised here once the fiber is finished.
    pub fn force_unwind(&mut self) {
        match self.inner.state.get() {
            State::Finished => {}
            State::Fresh => {
                drop(self.inner.func.take());
                self.inner.state.set(State::Finished);
            }
            State::Running => panic!("attempt to unwind a running fiber"),
            State::Suspended if cfg!(panic = "unwind") => {
                self.inner.suspend.unwinding.set(true);
                self.switch_in();
                assert!(self.done(), "fiber caught a forced unwind");
                // A body that swallowed the unwind may still have returned a value.
                if let Some(Err(payload)) = self.inner.returned.take() {
                    panic::resume_unwind(payload);
                }
            }
            State::Suspended => self.inner.state.set(State::Finished),
        }
    }

    /// Forcibly marks the fiber as finished without running destructors of the objects
    /// on its stack.
    ///
    /// # Safety
    ///
    /// Objects on the fiber stack are leaked, any of them that other code relies on being
    /// dropped (guards, pinned values) makes this unsound.
    pub unsafe fn force_reset(&mut self) {
        drop(self.inner.func.take());
        self.inner.state.set(State::Finished);
    }

    fn switch_in(&mut self) {
        let inner = &*self.inner;
        inner.state.set(State::Running);

        // Safety: the fiber context is either fresh or suspended inside `Suspend::suspend`,
        // and we own its stack. The resumer slot is ours until the fiber switches back.
        unsafe {
            context::exchange(inner.suspend.resumer.get(), inner.suspend.context.get());
        }

        if inner.state.get() == State::Running {
            inner.state.set(State::Suspended);
        }
    }
}

impl<Input, Yield, Return, S: FiberStack> Drop for Fiber<Input, Yield, Return, S> {
    fn drop(&mut self) {
        if self.done() {
            return;
        }

        if self.started() && thread::panicking() {
            // Unwinding a second stack while this one is already unwinding risks an abort.
            // Safety: leaking is always memory safe for the fiber itself
            unsafe { self.force_reset() }
        } else {
            self.force_unwind();
        }
    }
}

impl<Input, Yield, Return, S: FiberStack> core::fmt::Debug for Fiber<Input, Yield, Return, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.inner.state.get())
            .field("stack_top", &self.stack.top())
            .field("stack_bottom", &self.stack.bottom())
            .finish_non_exhaustive()
    }
}

/// Handle passed to a fiber's main function, used to suspend it.
pub struct Suspend<Input, Yield> {
    context: UnsafeCell<ExecutionContext>,
    resumer: UnsafeCell<ExecutionContext>,
    input: Cell<Option<Input>>,
    yielded: Cell<Option<Yield>>,
    unwinding: Cell<bool>,
}

impl<Input, Yield> Suspend<Input, Yield> {
    /// Suspends the fiber, handing `val` to the [`Fiber::resume`] call that is running it.
    /// Returns the input of the next `resume`.
    ///
    /// # Panics
    ///
    /// Panics if called while the fiber is being torn down by [`Fiber::force_unwind`].
    pub fn suspend(&self, val: Yield) -> Input {
        assert!(
            !self.unwinding.get(),
            "attempt to suspend a fiber that is being unwound"
        );

        self.yielded.set(Some(val));

        // Safety: we are running on the fiber stack and the resumer is parked inside
        // `Fiber::switch_in` until we switch back.
        unsafe {
            context::exchange(self.context.get(), self.resumer.get());
        }

        if self.unwinding.get() {
            panic::resume_unwind(Box::new(ForcedUnwind));
        }

        match self.input.take() {
            Some(input) => input,
            None => unreachable!("fiber resumed without an input"),
        }
    }

    /// Whether the fiber is being torn down by [`Fiber::force_unwind`].
    ///
    /// Code that runs from destructors can use this to avoid suspending.
    pub fn is_unwinding(&self) -> bool {
        self.unwinding.get()
    }
}

unsafe extern "C" fn fiber_entry<Input, Yield, Return>(arg: usize) -> ! {
    // Safety: `arg` is the boxed `Inner` the context was built for, which outlives the
    // fiber's execution.
    let inner = unsafe { &*(arg as *const Inner<Input, Yield, Return>) };

    run_body(inner);
    inner.state.set(State::Finished);

    // Safety: the last resumer is parked inside `Fiber::switch_in`. Nothing on this stack
    // needs dropping and the context is never activated again.
    unsafe { context::activate(inner.suspend.resumer.get()) }
}

// Kept out of `fiber_entry` so every local is dropped before the final switch.
fn run_body<Input, Yield, Return>(inner: &Inner<Input, Yield, Return>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let (Some(func), Some(input)) = (inner.func.take(), inner.suspend.input.take()) else {
            unreachable!("fiber entered without a body");
        };
        func(input, &inner.suspend)
    }));

    match result {
        Err(payload) if payload.is::<ForcedUnwind>() => {}
        result => inner.returned.set(Some(result)),
    }
}
