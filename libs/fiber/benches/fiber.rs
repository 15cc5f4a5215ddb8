// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::measurement::Measurement;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fiber::context::{self, ExecutionContext};
use fiber::{DefaultFiberStack, Fiber};

/// A resume plus the matching suspend on a long-lived fiber.
fn ping_pong<M: Measurement + 'static>(c: &mut Criterion<M>, name: &str) {
    let mut echo = Fiber::<u64, u64, ()>::new(64 * 1024, |mut value, suspend| {
        loop {
            value = suspend.suspend(value);
        }
    })
    .unwrap();

    c.bench_function(name, |b| b.iter(|| echo.resume(black_box(1))));

    // Safety: the loop above owns nothing that needs dropping
    unsafe { echo.force_reset() }
}

/// Building a fiber on an existing stack and running it to completion.
fn run_to_completion<M: Measurement + 'static>(c: &mut Criterion<M>, name: &str) {
    let mut stack = DefaultFiberStack::new(64 * 1024).unwrap();

    c.bench_function(name, move |b| {
        b.iter(|| {
            Fiber::<u64, (), u64, _>::with_stack(&mut stack, |value, _| value + 1)
                .resume(black_box(1))
        });
    });
}

struct Pair {
    main: ExecutionContext,
    child: ExecutionContext,
}

unsafe extern "C" fn bounce(arg: usize) -> ! {
    let pair = arg as *mut Pair;
    loop {
        // Safety: `pair` outlives the benchmark and only the running side touches it
        unsafe {
            context::exchange(&raw mut (*pair).child, &raw const (*pair).main);
        }
    }
}

/// Two bare context switches, without any of the fiber bookkeeping.
fn raw_exchange<M: Measurement + 'static>(c: &mut Criterion<M>, name: &str) {
    let stack = DefaultFiberStack::new(64 * 1024).unwrap();
    let pair = Box::into_raw(Box::new(Pair {
        main: ExecutionContext::new(),
        child: ExecutionContext::new(),
    }));

    // Safety: the stack and `pair` outlive every switch below
    unsafe {
        context::build(&mut (*pair).child, bounce, pair as usize, &stack);
    }

    c.bench_function(name, |b| {
        b.iter(|| {
            // Safety: the child is suspended in `bounce`
            unsafe { context::exchange(&raw mut (*pair).main, &raw const (*pair).child) }
        });
    });

    // The child never finishes; its stack holds nothing that needs dropping.
    // Safety: no context refers to `pair` anymore
    drop(unsafe { Box::from_raw(pair) });
}

fn time_targets(c: &mut Criterion) {
    ping_pong(c, "ping_pong_time");
    run_to_completion(c, "run_to_completion_time");
    raw_exchange(c, "raw_exchange_time");
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = time_targets
);

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn cycle_targets(c: &mut Criterion<CyclesPerByte>) {
            ping_pong(c, "ping_pong_cycles");
            raw_exchange(c, "raw_exchange_cycles");
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = cycle_targets
        );

        criterion_main!(time, cycles);
    } else {
        criterion_main!(time);
    }
}
