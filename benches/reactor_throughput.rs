// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]

use corenet::buffer::BufferPool;
use corenet::reactor::Reactor;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn bench_slabpool_reserve_16b(c: &mut Criterion) {
    c.bench_function("slabpool_reserve_16b", |b| {
        let pool = BufferPool::private();
        b.iter(|| {
            let (handle, _slice) = pool.reserve(black_box(16)).unwrap();
            pool.release(handle);
        })
    });
}

fn bench_reactor_timer_schedule(c: &mut Criterion) {
    c.bench_function("reactor_schedule_cancel_timer", |b| {
        let reactor = Reactor::new(1);
        b.iter(|| {
            let id = reactor.schedule_timer(Duration::from_secs(60), None, || {});
            reactor.cancel_timer(id);
        });
        reactor.stop();
    });
}

criterion_group!(benches, bench_slabpool_reserve_16b, bench_reactor_timer_schedule);
criterion_main!(benches);
