// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use batchtm::{Access, Region};
use rand::Rng;
use std::{sync::Arc, thread};
use threadpool::ThreadPool;

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Increments racing over a single word must never be lost: every retry
/// re-reads the committed value, and epochs serialize the survivors.
#[test]
fn test_concurrent_counter_loses_no_increment() {
    const THREADS: usize = 8;
    const INCREMENTS: usize = 100;

    let region = Arc::new(Region::new(8, 8).unwrap());

    let mut threads = Vec::new();
    for _ in 0..THREADS {
        let region = region.clone();

        threads.push(thread::spawn(move || {
            let start = region.start();
            for _ in 0..INCREMENTS {
                region
                    .execute(Access::ReadWrite, |tx| {
                        let mut word = [0u8; 8];
                        tx.read(start, &mut word)?;
                        let value = u64::from_ne_bytes(word) + 1;
                        tx.write(&value.to_ne_bytes(), start)
                    })
                    .expect("increment transaction failed");
            }
        }));
    }

    for t in threads {
        t.join().expect("failed to join incrementing thread");
    }

    let total = region
        .execute(Access::ReadOnly, |tx| {
            let mut word = [0u8; 8];
            tx.read(region.start(), &mut word)?;
            Ok(u64::from_ne_bytes(word))
        })
        .unwrap();

    assert_eq!(total, (THREADS * INCREMENTS) as u64);
}

/// Readers running next to a writer observe a monotonic counter: each
/// epoch exposes either the old or the new committed value, never a
/// tentative or torn one.
#[test]
fn test_readers_observe_monotonic_commits() {
    const WRITES: usize = 200;
    const READERS: usize = 4;

    let region = Arc::new(Region::new(8, 8).unwrap());

    let writer = {
        let region = region.clone();
        thread::spawn(move || {
            let start = region.start();
            for i in 1..=WRITES as u64 {
                region
                    .execute(Access::ReadWrite, |tx| tx.write(&i.to_ne_bytes(), start))
                    .expect("write transaction failed");
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..READERS {
        let region = region.clone();

        readers.push(thread::spawn(move || {
            let start = region.start();
            let mut last = 0u64;
            for _ in 0..WRITES {
                let seen = region
                    .execute(Access::ReadOnly, |tx| {
                        let mut word = [0u8; 8];
                        tx.read(start, &mut word)?;
                        Ok(u64::from_ne_bytes(word))
                    })
                    .expect("read transaction failed");

                assert!(seen >= last, "counter went backwards: {} < {}", seen, last);
                assert!(seen <= WRITES as u64);
                last = seen;
            }
        }));
    }

    writer.join().expect("failed to join writer thread");
    for t in readers {
        t.join().expect("failed to join reader thread");
    }
}

/// Randomized allocate/fill/verify/free churn across a thread pool. Every
/// transaction works on its own fresh segment, so all of them commit and
/// the region ends up holding only its first segment.
#[test]
fn test_randomized_segment_churn() {
    const TASKS: usize = 16;
    const ROUNDS: usize = 25;

    let region = Arc::new(Region::new(64, 8).unwrap());
    let pool = ThreadPool::new(4);

    for _ in 0..TASKS {
        let region = region.clone();

        pool.execute(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..ROUNDS {
                let size = rng.gen_range(1..9usize) * 8;
                let fill: u8 = rng.gen();

                region
                    .execute(Access::ReadWrite, |tx| {
                        let addr = tx.alloc(size)?;
                        tx.write(&vec![fill; size], addr)?;

                        let mut back = vec![0u8; size];
                        tx.read(addr, &mut back)?;
                        assert_eq!(back, vec![fill; size]);

                        tx.free(addr)
                    })
                    .expect("churn transaction failed");
            }
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);

    // all scratch segments were reclaimed; the first segment remains
    let mut word = [0u8; 8];
    let mut tx = region.begin(Access::ReadOnly);
    tx.read(region.start(), &mut word).unwrap();
    tx.commit().unwrap();
    assert_eq!(word, [0u8; 8]);
}

/// Every batch of transactions closes exactly one epoch.
#[test]
fn test_epoch_advances_once_per_batch() {
    let region = Region::new(8, 8).unwrap();
    let before = region.epoch();

    for _ in 0..5 {
        region
            .execute(Access::ReadWrite, |tx| {
                let mut word = [0u8; 8];
                tx.read(region.start(), &mut word)
            })
            .unwrap();
    }

    assert_eq!(region.epoch(), before + 5);
}
