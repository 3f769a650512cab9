use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conc_collections::ConcurrentDict;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt as _;

const THREADS: usize = 8;

/// Surfaces the resize lifecycle trace/debug events on `--nocapture` instead
/// of discarding them, since these tests are the primary place a resize
/// actually gets exercised under load.
fn trace_guard() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(io::stderr)
        .set_default()
}

#[test]
fn concurrent_inserts_are_all_eventually_visible() {
    let _guard = trace_guard();
    let dict = Arc::new(ConcurrentDict::<usize, usize>::with_capacity(16).unwrap());
    let per_thread = 2_000;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let dict = dict.clone();
            scope.spawn(move || {
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    dict.insert(key, key);
                }
            });
        }
    });

    for t in 0..THREADS {
        for i in 0..per_thread {
            let key = t * per_thread + i;
            assert_eq!(dict.get(&key), Some(key));
        }
    }
    assert_eq!(dict.len(), THREADS * per_thread);
}

#[test]
fn racing_writers_on_one_key_leave_no_torn_or_absent_value() {
    let dict = Arc::new(ConcurrentDict::<&str, i32>::new());
    let iterations = 10_000;
    let observed_absent = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        let d = dict.clone();
        scope.spawn(move || {
            for _ in 0..iterations {
                d.insert("k", 1);
            }
        });
        let d = dict.clone();
        scope.spawn(move || {
            for _ in 0..iterations {
                d.insert("k", 2);
            }
        });
        let d = dict.clone();
        let absent = observed_absent.clone();
        scope.spawn(move || {
            for _ in 0..iterations {
                match d.get(&"k") {
                    Some(1) | Some(2) => {}
                    Some(other) => panic!("torn value: {other}"),
                    None => {
                        absent.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });
    });

    assert_eq!(observed_absent.load(Ordering::Relaxed), 0);
    assert!(matches!(dict.get(&"k"), Some(1) | Some(2)));
}

#[test]
fn resize_is_transparent_to_concurrent_readers_and_writers() {
    let _guard = trace_guard();
    let dict = Arc::new(ConcurrentDict::<usize, usize>::with_capacity(2).unwrap());
    let total = 20_000;

    std::thread::scope(|scope| {
        for t in 0..4 {
            let dict = dict.clone();
            scope.spawn(move || {
                let mut i = t;
                while i < total {
                    dict.insert(i, i);
                    i += 4;
                }
            });
        }
    });

    assert!(dict.capacity() > 2);
    for i in 0..total {
        assert_eq!(dict.get(&i), Some(i));
    }
    assert_eq!(dict.len(), total);
}

#[test]
fn sweep_removal_races_with_concurrent_insert_of_new_keys() {
    let dict = Arc::new(ConcurrentDict::<usize, usize>::with_capacity(1024).unwrap());
    for i in 0..10_000 {
        dict.insert(i, i * 2);
    }

    std::thread::scope(|scope| {
        let d = dict.clone();
        scope.spawn(move || {
            d.remove_where(|v| v % 2 == 0);
        });
        let d = dict.clone();
        scope.spawn(move || {
            for i in 10_000..20_000 {
                d.insert(i, i * 2);
            }
        });
    });

    // Every preloaded key is gone (all of its values were even); every
    // freshly inserted key from the second thread is still present,
    // regardless of how it interleaved with the sweep.
    for i in 0..10_000 {
        assert_eq!(dict.get(&i), None);
    }
    for i in 10_000..20_000 {
        assert_eq!(dict.get(&i), Some(i * 2));
    }
}

#[test]
fn iterator_sees_a_best_effort_but_complete_snapshot_at_quiescence() {
    let dict = Arc::new(ConcurrentDict::<usize, usize>::with_capacity(8).unwrap());
    let total = 5_000;

    std::thread::scope(|scope| {
        for t in 0..4 {
            let dict = dict.clone();
            scope.spawn(move || {
                let mut i = t;
                while i < total {
                    dict.insert(i, i);
                    i += 4;
                }
            });
        }
    });

    let seen: HashSet<usize> = dict.iter().map(|(k, _)| k).collect();
    let expected: HashSet<usize> = (0..total).collect();
    assert_eq!(seen, expected);
}

#[test]
fn clear_during_quiescence_makes_every_key_absent() {
    let dict = ConcurrentDict::<usize, usize>::new();
    for i in 0..500 {
        dict.insert(i, i);
    }
    dict.clear();
    for i in 0..500 {
        assert_eq!(dict.get(&i), None);
    }
}
