// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::info;
use wstm::{atomic, read_only, retry, Domain, TVar, TxError};

#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

#[test]
fn test_counter_no_dropped_updates() {
    const THREADS: usize = 2;
    const INCREMENTS: usize = 100_000;

    let counter = TVar::new(0u64);

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let counter = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..INCREMENTS {
                atomic(|tx| {
                    let value = tx.get(&counter)?;
                    tx.set(&counter, value + 1)
                })
                .expect("increment failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let final_value = read_only(|tx| tx.get(&counter)).unwrap();
    assert_eq!(final_value, (THREADS * INCREMENTS) as u64);
}

#[test]
fn test_transfer_preserves_total() {
    const A_TO_B: i64 = 30_000;
    const B_TO_A: i64 = 19_999;

    let account_a = TVar::new(300i64);
    let account_b = TVar::new(300i64);
    let done = Arc::new(AtomicBool::new(false));

    let (a, b) = (account_a.clone(), account_b.clone());
    let forward = thread::spawn(move || {
        for _ in 0..A_TO_B {
            atomic(|tx| {
                let from = tx.get(&a)?;
                let to = tx.get(&b)?;
                tx.set(&a, from - 20)?;
                tx.set(&b, to + 20)
            })
            .unwrap();
        }
    });

    let (a, b) = (account_a.clone(), account_b.clone());
    let backward = thread::spawn(move || {
        for _ in 0..B_TO_A {
            atomic(|tx| {
                let from = tx.get(&b)?;
                let to = tx.get(&a)?;
                tx.set(&b, from - 30)?;
                tx.set(&a, to + 30)
            })
            .unwrap();
        }
    });

    // a concurrent observer must find the invariant intact in every snapshot
    let (a, b) = (account_a.clone(), account_b.clone());
    let stop = done.clone();
    let observer = thread::spawn(move || {
        let mut snapshots = 0usize;
        while !stop.load(Ordering::Relaxed) {
            let total = read_only(|tx| Ok(tx.get(&a)? + tx.get(&b)?)).unwrap();
            assert_eq!(total, 600);
            snapshots += 1;
        }
        snapshots
    });

    forward.join().unwrap();
    backward.join().unwrap();
    done.store(true, Ordering::Relaxed);
    let snapshots = observer.join().unwrap();
    info!("observer took {} consistent snapshots", snapshots);

    let final_a = read_only(|tx| tx.get(&account_a)).unwrap();
    let final_b = read_only(|tx| tx.get(&account_b)).unwrap();
    assert_eq!(final_a, 300 - 20 * A_TO_B + 30 * B_TO_A);
    assert_eq!(final_b, 300 + 20 * A_TO_B - 30 * B_TO_A);
    assert_eq!(final_a + final_b, 600);
}

#[test]
fn test_dining_philosophers() {
    const SEATS: usize = 5;
    const MEALS: usize = 1_000;

    let forks: Vec<TVar<bool>> = (0..SEATS).map(|_| TVar::new(false)).collect();

    let mut handles = Vec::new();
    for seat in 0..SEATS {
        let left = forks[seat].clone();
        let right = forks[(seat + 1) % SEATS].clone();

        handles.push(thread::spawn(move || {
            let mut food = MEALS;
            while food > 0 {
                atomic(|tx| {
                    if tx.get(&left)? || tx.get(&right)? {
                        return retry();
                    }
                    tx.set(&left, true)?;
                    tx.set(&right, true)
                })
                .unwrap();

                food -= 1;

                atomic(|tx| {
                    tx.set(&left, false)?;
                    tx.set(&right, false)
                })
                .unwrap();
            }
            food
        }));
    }

    for handle in handles {
        assert_eq!(handle.join().expect("philosopher panicked"), 0);
    }
    for fork in &forks {
        assert!(!read_only(|tx| tx.get(fork)).unwrap());
    }
}

#[test]
fn test_user_retry_wakes_on_concurrent_commit() {
    let var = TVar::new(0u64);

    let writer_var = var.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        atomic(|tx| tx.set(&writer_var, 10)).unwrap();
    });

    // blocks (busy-retrying) until the other thread has stored 10
    let observed = atomic(|tx| {
        let value = tx.get(&var)?;
        if value < 10 {
            return retry();
        }
        Ok(value)
    })
    .unwrap();

    assert_eq!(observed, 10);
    writer.join().unwrap();
}

#[test]
fn test_failure_rolls_back_writes() {
    let var = TVar::new(String::from("committed"));

    let result: Result<(), TxError> = atomic(|tx| {
        tx.set(&var, String::from("speculative"))?;
        Err(TxError::Abort)
    });
    assert_eq!(result, Err(TxError::Abort));

    let value = read_only(|tx| tx.get(&var)).unwrap();
    assert_eq!(value, "committed");
}

#[test]
fn test_panic_rolls_back_writes() {
    let var = TVar::new(41u64);

    let panicked = catch_unwind(AssertUnwindSafe(|| {
        let _: Result<(), TxError> = atomic(|tx| {
            tx.set(&var, 99)?;
            panic!("closure gave up")
        });
    }));
    assert!(panicked.is_err());

    // the thread's transactional state must be clean again
    let value = atomic(|tx| {
        let value = tx.get(&var)?;
        tx.set(&var, value + 1)?;
        tx.get(&var)
    })
    .unwrap();
    assert_eq!(value, 42);
}

#[test]
fn test_untracked_read_skips_logging() {
    let ticket = TVar::new(7u64);
    let noise = TVar::new(1u64);

    let value = atomic(|tx| {
        let hint = tx.untracked_get(&noise)?;
        Ok(tx.get(&ticket)? + hint)
    })
    .unwrap();
    assert_eq!(value, 8);
}

#[test]
fn test_nested_read_only_within_read_write() {
    let var = TVar::new(5u64);
    let probe = var.clone();

    atomic(|tx| {
        tx.set(&var, 6)?;
        // flat nesting: the inner read-only observes the pending write
        let inner = read_only(|ro| ro.get(&probe))?;
        assert_eq!(inner, 6);
        Ok(())
    })
    .unwrap();

    assert_eq!(read_only(|tx| tx.get(&var)).unwrap(), 6);
}

#[test]
fn test_separate_domains_have_separate_clocks() {
    let red = Domain::new();
    let blue = Domain::new();

    let var = TVar::new(1u64);
    red.read_write(|tx| tx.set(&var, 2)).unwrap();

    assert_eq!(red.clock_value(), 1);
    assert_eq!(blue.clock_value(), 0);
}

#[test]
fn test_threaded_set_insertions() {
    use rand::Rng;

    const WORKERS: usize = 8;
    const PER_WORKER: usize = 64;

    let pool = threadpool::ThreadPool::new(WORKERS);
    let cells: Arc<Vec<TVar<u64>>> = Arc::new((0..16).map(|_| TVar::new(0)).collect());
    let committed = Arc::new(AtomicUsize::new(0));

    for _ in 0..WORKERS {
        let cells = cells.clone();
        let committed = committed.clone();
        pool.execute(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..PER_WORKER {
                let index = rng.gen_range(0..cells.len());
                let var = &cells[index];
                atomic(|tx| {
                    let value = tx.get(var)?;
                    tx.set(var, value + 1)
                })
                .unwrap();
                committed.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    pool.join();

    let total: u64 = cells
        .iter()
        .map(|var| read_only(|tx| tx.get(var)).unwrap())
        .sum();
    assert_eq!(total as usize, committed.load(Ordering::Relaxed));
    assert_eq!(total as usize, WORKERS * PER_WORKER);
}
