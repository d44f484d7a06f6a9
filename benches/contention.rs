// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional memory throughput
//!
//! Test subjects:
//! - uncontended read-write commits on an inline cell
//! - read-only snapshots
//! - contended increments across a thread pool

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use threadpool::ThreadPool;
use wstm::{atomic, read_only, TVar};

fn bnc_rw_increment(c: &mut Criterion) {
    let counter = TVar::new(0u64);

    c.bench_function("rw_increment", |b| {
        b.iter(|| {
            atomic(|tx| {
                let value = tx.get(&counter)?;
                tx.set(&counter, black_box(value + 1))
            })
            .unwrap()
        })
    });
}

fn bnc_read_only_snapshot(c: &mut Criterion) {
    let cell = TVar::new(7u64);

    c.bench_function("read_only_snapshot", |b| {
        b.iter(|| {
            let value = read_only(|tx| tx.get(&cell)).unwrap();
            black_box(value)
        })
    });
}

fn bnc_contended_counter(c: &mut Criterion) {
    const WORKERS: usize = 4;
    const PER_WORKER: usize = 256;

    c.bench_function("contended_counter", |b| {
        b.iter(|| {
            let counter = TVar::new(0u64);
            let pool = ThreadPool::new(WORKERS);
            for _ in 0..WORKERS {
                let counter = counter.clone();
                pool.execute(move || {
                    for _ in 0..PER_WORKER {
                        atomic(|tx| {
                            let value = tx.get(&counter)?;
                            tx.set(&counter, value + 1)
                        })
                        .unwrap();
                    }
                });
            }
            pool.join();
            assert_eq!(unsafe { counter.unsafe_read() }, (WORKERS * PER_WORKER) as u64);
        })
    });
}

criterion_group!(
    benches,
    bnc_rw_increment,
    bnc_read_only_snapshot,
    bnc_contended_counter
);
criterion_main!(benches);
