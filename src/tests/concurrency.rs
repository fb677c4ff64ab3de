use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use rand::Rng;

use super::{anonymous_cache, sized_cache};
use crate::{SetError, MAX_TTL};

/// Random mixed workload: many threads hammering a small key space. Every
/// successful read must observe bytes some thread stored for that key, which
/// the key-derived values make checkable.
#[test]
fn mixed_workload_soak() {
    let cache = anonymous_cache();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..32 {
            scope.spawn(|| {
                let mut rng = rand::thread_rng();
                while !stop.load(Ordering::Relaxed) {
                    let key = rng.gen_range(0u64..100).to_le_bytes();
                    match rng.gen_range(0u8..5) {
                        0 | 1 => {
                            let item = cache
                                .set_item(&key, &key, MAX_TTL)
                                .expect("set_item in soak");
                            assert_eq!(item.value(), key);
                        }
                        2 => {
                            let _ = cache.remove(&key);
                        }
                        _ => {
                            if let Some(item) = cache.get(&key) {
                                assert_eq!(item.key(), key);
                                assert_eq!(item.value(), key);
                            }
                        }
                    }
                }
            });
        }

        thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::Relaxed);
    });
}

/// A pinned payload must stay byte-stable however hard concurrent writers
/// churn the region; the writers fail with NoRoom instead.
#[test]
fn pinned_bytes_are_immutable_under_concurrent_churn() {
    let cache = sized_cache(4096, 256 * 1024);
    let filler = vec![b'z'; 16 * 1024];

    let survivor = cache
        .set_item(b"survivor", b"survive, please!", MAX_TTL)
        .expect("survivor stored");

    thread::scope(|scope| {
        for worker in 0u64..4 {
            let filler = &filler;
            let cache = &cache;
            scope.spawn(move || {
                for i in 0..200 {
                    let key = (worker * 1000 + i).to_le_bytes();
                    match cache.set(&key, filler, MAX_TTL) {
                        Ok(()) | Err(SetError::NoRoom) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            });
        }
    });

    assert_eq!(survivor.value(), b"survive, please!");
    drop(survivor);

    // Back-pressure lifts once the pin is gone.
    cache
        .set(b"after", &filler, MAX_TTL)
        .expect("set after release");
}

/// Concurrent transactions on distinct keys hold disjoint reservations and
/// commit independently.
#[test]
fn concurrent_transactions_commit_cleanly() {
    let cache = anonymous_cache();

    thread::scope(|scope| {
        for worker in 0u64..8 {
            let cache = &cache;
            scope.spawn(move || {
                for i in 0..100 {
                    let key = (worker * 1_000_000 + i).to_le_bytes();
                    let mut txn = cache
                        .begin_set(&key, 8, MAX_TTL)
                        .expect("reservation in scope");
                    txn.value_mut().copy_from_slice(&key);
                    txn.commit();
                }
            });
        }
    });

    for worker in 0u64..8 {
        for i in 0..100 {
            let key = (worker * 1_000_000 + i).to_le_bytes();
            let item = cache.get(&key).expect("committed entry resident");
            assert_eq!(item.value(), key);
        }
    }
}
