// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use dozer::Dozer;
use fiber_sched::Scheduler;
use std::time::Duration;

fn scheduler(physical_stack_count: usize) -> Scheduler {
    Scheduler::builder()
        .stack_size(64 * 1024)
        .physical_stack_count(physical_stack_count)
        .build()
        .unwrap()
}

/// One tick over `fibers` long-lived fibers that yield every time.
fn yield_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("yield_tick");

    for fibers in [1usize, 2, 8, 32] {
        // With two stacks, anything beyond two fibers parks on every switch.
        let stack_counts = if fibers > 2 { vec![2, fibers] } else { vec![2] };
        for stacks in stack_counts {
            let mut sched = scheduler(stacks);
            for _ in 0..fibers {
                sched.add_with_lifetime(Duration::MAX, |_| {
                    black_box(0u64);
                });
            }

            group.bench_with_input(
                BenchmarkId::new(format!("{stacks}_stacks"), fibers),
                &fibers,
                |b, _| b.iter(|| sched.step()),
            );
        }
    }

    group.finish();
}

/// Adding and running a short fiber to completion.
fn spawn_and_run(c: &mut Criterion) {
    let mut sched = scheduler(2);

    c.bench_function("spawn_and_run", |b| {
        b.iter(|| {
            sched.add(|dozer| dozer.yield_now());
            sched.step();
            sched.step();
        });
    });
}

criterion_group!(benches, yield_tick, spawn_and_run);
criterion_main!(benches);
