// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::missing_panics_doc)]

use corenet::reorder::ReorderBuffer;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_reorder_inorder_push(c: &mut Criterion) {
    c.bench_function("reorder_buffer_inorder_push", |b| {
        b.iter(|| {
            let mut buf = ReorderBuffer::new(1024);
            for seq in 0..256u16 {
                black_box(buf.push(seq, vec![0u8; 16]));
            }
        })
    });
}

fn bench_reorder_shuffled_push(c: &mut Criterion) {
    c.bench_function("reorder_buffer_shuffled_push", |b| {
        let mut seqs: Vec<u16> = (0..256).collect();
        // deterministic interleave, not a real shuffle (benches must be reproducible)
        seqs.rotate_left(128);
        b.iter(|| {
            let mut buf = ReorderBuffer::new(1024);
            for &seq in &seqs {
                black_box(buf.push(seq, vec![0u8; 16]));
            }
        })
    });
}

criterion_group!(benches, bench_reorder_inorder_push, bench_reorder_shuffled_push);
criterion_main!(benches);
