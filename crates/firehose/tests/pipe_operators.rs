// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pipeline operator integration tests
//!
//! Materializes operator chains onto a single-worker dispatcher (one
//! worker keeps cross-event side effects strictly ordered; the chain for
//! each event runs depth-first regardless) and checks the values each
//! sink observes.

use firehose::{Firehose, FirehoseConfig, Key, Pipe, StateProvider};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn serial_bus() -> Arc<Firehose<Key>> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Firehose::with_config(
        FirehoseConfig::new()
            .pool_size(1)
            .ring_capacity(256)
            .wheel_tick(Duration::from_millis(5)),
    ))
}

fn drain<T>(rx: &mpsc::Receiver<T>, count: usize) -> Vec<T> {
    (0..count)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(2))
                .expect("sink should observe the expected number of values")
        })
        .collect()
}

#[test]
fn test_map_chain_transforms_once() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .map(|n: &i64| n + 1)
        .map(|n: &i64| n * 2)
        .consume(move |n: &i64| tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    bus.notify(Key::single("numbers"), 3i64);

    assert_eq!(drain(&rx, 1), vec![8]);
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "sink must observe the value exactly once"
    );
    bus.shutdown();
}

#[test]
fn test_scan_publishes_every_accumulation() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .scan(|sum: &i64, n: &i64| sum + n, 0)
        .consume(move |total: &i64| tx.send(*total).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    for n in [1i64, 2, 3] {
        bus.notify(Key::single("numbers"), n);
    }

    assert_eq!(drain(&rx, 3), vec![1, 3, 6]);
    bus.shutdown();
}

#[test]
fn test_filter_drops_rejected_values() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .filter(|n: &i64| n % 2 == 0)
        .consume(move |n: &i64| tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    for n in 1..=5i64 {
        bus.notify(Key::single("numbers"), n);
    }
    bus.shutdown();

    let observed: Vec<i64> = rx.try_iter().collect();
    assert_eq!(observed, vec![2, 4]);
}

#[test]
fn test_sliding_window_keeps_last_three() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .slide(|window: Vec<i64>| {
            let overflow = window.len().saturating_sub(3);
            window[overflow..].to_vec()
        })
        .consume(move |window: &Vec<i64>| tx.send(window.clone()).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    for n in 1..=5i64 {
        bus.notify(Key::single("numbers"), n);
    }
    bus.shutdown();

    let observed: Vec<Vec<i64>> = rx.try_iter().collect();
    assert_eq!(
        observed,
        vec![
            vec![1],
            vec![1, 2],
            vec![1, 2, 3],
            vec![2, 3, 4],
            vec![3, 4, 5],
        ]
    );
}

#[test]
fn test_partition_emits_full_batches_only() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .partition(|batch: &[i64]| batch.len() >= 3)
        .consume(move |batch: &Vec<i64>| tx.send(batch.clone()).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    for n in 1..=7i64 {
        bus.notify(Key::single("numbers"), n);
    }
    bus.shutdown();

    let observed: Vec<Vec<i64>> = rx.try_iter().collect();
    // Residual [7] stays buffered and is never emitted.
    assert_eq!(observed, vec![vec![1, 2, 3], vec![4, 5, 6]]);
}

#[test]
fn test_debounce_emits_latest_once_per_quiet_window() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .debounce(Duration::from_millis(100))
        .consume(move |n: &i64| tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    bus.notify(Key::single("numbers"), 1i64);
    std::thread::sleep(Duration::from_millis(50));
    bus.notify(Key::single("numbers"), 2i64);

    // The window opened by the first event fires once, with the latest
    // value observed inside the window.
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        2,
        "debounce emits the latest value"
    );
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "debounce fires once per window"
    );
    bus.shutdown();
}

#[test]
fn test_throttle_waits_for_idle_stream() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<i64>::new()
        .throttle(Duration::from_millis(80))
        .consume(move |n: &i64| tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    // Three quick events: each reschedules; only the last survives.
    for n in [1i64, 2, 3] {
        bus.notify(Key::single("numbers"), n);
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    bus.shutdown();
}

#[test]
fn test_map_with_builds_mapper_per_materialization() {
    let bus = serial_bus();

    // Each materialization numbers the values it sees, starting at 1.
    let numbered = Pipe::<i64>::new().map_with(|| {
        let seen = AtomicU64::new(0);
        move |_n: &i64| (seen.fetch_add(1, Ordering::SeqCst) + 1) as i64
    });

    let (first_tx, first_rx) = mpsc::channel();
    let (second_tx, second_rx) = mpsc::channel();
    numbered
        .consume(move |n: &i64| first_tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("left"));
    numbered
        .consume(move |n: &i64| second_tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("right"));

    bus.notify(Key::single("left"), 10i64);
    bus.notify(Key::single("left"), 10i64);
    bus.notify(Key::single("right"), 10i64);

    assert_eq!(drain(&first_rx, 2), vec![1, 2]);
    assert_eq!(
        drain(&second_rx, 1),
        vec![1],
        "each subscription owns a freshly built mapper"
    );
    bus.shutdown();
}

#[test]
fn test_map_stateful_counts_events() {
    let bus = serial_bus();
    let (tx, rx) = mpsc::channel();

    Pipe::<&'static str>::new()
        .map_stateful(
            |seen: &firehose::sync::Atom<u64>, _word: &&'static str| *seen.swap(|n| n + 1),
            0u64,
        )
        .consume(move |count: &u64| tx.send(*count).unwrap())
        .subscribe(&bus, Key::single("words"));

    for word in ["a", "b", "c"] {
        bus.notify(Key::single("words"), word);
    }

    assert_eq!(drain(&rx, 3), vec![1, 2, 3]);
    bus.shutdown();
}

#[test]
fn test_unsubscribe_stops_delivery_without_touching_other_consumers() {
    let bus = serial_bus();
    let (pipe_tx, pipe_rx) = mpsc::channel();
    let (direct_tx, direct_rx) = mpsc::channel();

    // Plain consumer on the same source key, outside the pipeline.
    bus.on_value(Key::single("numbers"), move |n: &i64| {
        direct_tx.send(*n).unwrap();
    });

    let subscription = Pipe::<i64>::new()
        .map(|n: &i64| n * 10)
        .consume(move |n: &i64| pipe_tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    bus.notify(Key::single("numbers"), 1i64);
    assert_eq!(pipe_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 10);
    assert_eq!(direct_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);

    subscription.unsubscribe();

    bus.notify(Key::single("numbers"), 2i64);
    assert_eq!(
        direct_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        2,
        "unrelated consumer on the source key must survive unsubscribe"
    );
    assert!(
        pipe_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "pipeline must observe nothing after unsubscribe"
    );
    bus.shutdown();
}

#[test]
fn test_keyed_state_survives_resubscription() {
    let bus = serial_bus();
    let pipe = Pipe::<i64>::with_state(StateProvider::keyed())
        .scan(|sum: &i64, n: &i64| sum + n, 0);

    let (tx, rx) = mpsc::channel();
    let sink = tx.clone();
    let first = pipe
        .consume(move |total: &i64| sink.send(*total).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    bus.notify(Key::single("numbers"), 5i64);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 5);
    first.unsubscribe();

    let second = pipe
        .consume(move |total: &i64| tx.send(*total).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    bus.notify(Key::single("numbers"), 2i64);
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        7,
        "keyed provider resumes the accumulator"
    );
    second.unsubscribe();
    bus.shutdown();
}

#[test]
fn test_pipe_is_immutable_under_extension() {
    let bus = serial_bus();
    let base = Pipe::<i64>::new().map(|n: &i64| n + 1);

    let (doubles_tx, doubles_rx) = mpsc::channel();
    let (triples_tx, triples_rx) = mpsc::channel();

    // Extending `base` twice must not let the branches interfere.
    base.map(|n: &i64| n * 2)
        .consume(move |n: &i64| doubles_tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));
    base.map(|n: &i64| n * 3)
        .consume(move |n: &i64| triples_tx.send(*n).unwrap())
        .subscribe(&bus, Key::single("numbers"));

    bus.notify(Key::single("numbers"), 1i64);

    assert_eq!(doubles_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 4);
    assert_eq!(triples_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 6);
    bus.shutdown();
}
