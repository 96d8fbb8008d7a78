// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch core integration tests
//!
//! Exercises the published invariants: exactly-once delivery per matching
//! registration, failure isolation, per-publisher FIFO, the capacity
//! bound of the ring handoff, and selector consistency.

use firehose::{
    ClosureConsumer, DispatchError, ErrorHandler, Firehose, FirehoseConfig, Key, KeyedConsumer,
    Payload, Selector,
};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn config(pool: usize, capacity: usize) -> FirehoseConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    FirehoseConfig::new().pool_size(pool).ring_capacity(capacity)
}

#[test]
fn test_every_matching_registration_sees_event_exactly_once() {
    let bus: Firehose<Key> = Firehose::with_config(config(2, 64));
    let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    for count in &counts {
        let count = Arc::clone(count);
        bus.on_value(Key::single("k"), move |_: &i32| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    bus.notify(Key::single("k"), 1i32);
    bus.shutdown();

    for count in &counts {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_failure_isolation() {
    // S7: two consumers, the first throws; the second still runs and the
    // error handler fires exactly once.
    let errors = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&errors);
    let handler: ErrorHandler = Arc::new(move |error| {
        if matches!(error, DispatchError::ConsumerPanic { .. }) {
            counted.fetch_add(1, Ordering::SeqCst);
        }
    });
    let bus: Firehose<Key> = Firehose::with_error_handler(config(2, 64), handler);

    let survivors = Arc::new(AtomicUsize::new(0));
    bus.on_value(Key::single("k"), |_: &i32| panic!("broken consumer"));
    let survived = Arc::clone(&survivors);
    bus.on_value(Key::single("k"), move |_: &i32| {
        survived.fetch_add(1, Ordering::SeqCst);
    });

    bus.notify(Key::single("k"), 1i32);
    bus.shutdown();

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(survivors.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fifo_per_publisher_per_key() {
    let bus: Firehose<Key> = Firehose::with_config(config(1, 256));
    let (tx, rx) = mpsc::channel();

    bus.on_value(Key::single("k"), move |n: &u64| {
        tx.send(*n).unwrap();
    });

    for n in 0..100u64 {
        bus.notify(Key::single("k"), n);
    }
    bus.shutdown();

    let observed: Vec<u64> = rx.try_iter().collect();
    assert_eq!(observed, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_backpressure_bounds_outstanding_tasks() {
    // S8: capacity 2, slow consumers, 100 publishes from one thread. The
    // publisher must block while the handoff is saturated, every event is
    // still delivered, and outstanding tasks never exceed capacity.
    let bus: Arc<Firehose<Key>> = Arc::new(Firehose::with_config(config(4, 2)));

    let in_flight = Arc::new(AtomicIsize::new(0));
    let peak = Arc::new(AtomicIsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        let delivered = Arc::clone(&delivered);
        bus.on_value(Key::single("slow"), move |_: &u64| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            delivered.fetch_add(1, Ordering::SeqCst);
        });
    }

    let publisher = {
        let bus = Arc::clone(&bus);
        std::thread::spawn(move || {
            let started = std::time::Instant::now();
            for n in 0..100u64 {
                bus.notify(Key::single("slow"), n);
            }
            started.elapsed()
        })
    };

    let publish_time = publisher.join().unwrap();
    bus.shutdown();

    // 100 events x 4 registrations, each delivered exactly once.
    assert_eq!(delivered.load(Ordering::SeqCst), 400);
    // With capacity 2 and ~8 ms of consumer work per event, a publisher
    // that never blocked would finish in microseconds.
    assert!(
        publish_time > Duration::from_millis(50),
        "publisher should have been gated, finished in {publish_time:?}"
    );
    assert!(bus.metrics().backpressure_parks > 0);
    // At most `capacity` events are in flight across the pool at once.
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_selector_consistency() {
    let bus: Firehose<Key> = Firehose::with_config(config(1, 64));
    let (tx, rx) = mpsc::channel();

    let seen = tx.clone();
    let selector = Selector::key_prefix(["sensors"]).with_consumer(ClosureConsumer::new(
        move |key: &Key, _: &Payload| {
            seen.send(key.parts().join("/")).unwrap();
        },
    ));
    bus.on_selector(selector.clone());

    bus.notify(Key::of(["sensors", "temp"]), 20i32);
    bus.notify(Key::of(["actuators", "valve"]), 1i32);
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "sensors/temp"
    );

    // After unregistration the selector no longer matches anything.
    assert!(bus.unregister_matching(&selector));
    bus.notify(Key::of(["sensors", "temp"]), 21i32);
    bus.shutdown();

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_selector_rewriter_registers_derived_consumers() {
    let bus: Firehose<Key> = Firehose::with_config(config(1, 64));
    let (tx, rx) = mpsc::channel();

    let sink = tx.clone();
    bus.on_selector(Selector::key_prefix(["metrics"]).with_rewriter(move |matched: &Key| {
        let sink = sink.clone();
        vec![(
            matched.derived(),
            Arc::new(ClosureConsumer::new(move |_: &Key, payload: &Payload| {
                if let Some(value) = payload.downcast_ref::<u64>() {
                    sink.send(*value).unwrap();
                }
            })) as Arc<dyn KeyedConsumer<Key>>,
        )]
    }));

    bus.notify(Key::of(["metrics", "qps"]), 250u64);
    bus.shutdown();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 250);
}

#[test]
fn test_unregister_key_removes_all_its_consumers() {
    let bus: Firehose<Key> = Firehose::with_config(config(1, 64));
    let delivered = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let delivered = Arc::clone(&delivered);
        bus.on_value(Key::single("k"), move |_: &i32| {
            delivered.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(bus.unregister(&Key::single("k")));
    bus.notify(Key::single("k"), 1i32);
    bus.shutdown();

    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(bus.metrics().events_dropped, 1);
}

#[test]
fn test_shutdown_drains_queued_events() {
    let bus: Firehose<Key> = Firehose::with_config(config(2, 128));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);

    bus.on_value(Key::single("k"), move |_: &u64| {
        std::thread::sleep(Duration::from_millis(1));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for n in 0..50u64 {
        bus.notify(Key::single("k"), n);
    }
    bus.shutdown();

    assert_eq!(delivered.load(Ordering::SeqCst), 50);
}

#[test]
fn test_concurrent_publishers_lose_no_events() {
    let bus: Arc<Firehose<Key>> = Arc::new(Firehose::with_config(config(4, 32)));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);

    bus.on_value(Key::single("k"), move |_: &u64| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let publishers: Vec<_> = (0..4)
        .map(|p| {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                for n in 0..250u64 {
                    bus.notify(Key::single("k"), p * 1000 + n);
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }
    bus.shutdown();

    assert_eq!(delivered.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_reentrant_chain_does_not_deadlock_at_capacity() {
    // A consumer republished into a saturated dispatcher must not block:
    // reentrant publishes bypass the gate and dispatch depth-first.
    let bus: Arc<Firehose<Key>> = Arc::new(Firehose::with_config(config(1, 1)));
    let (tx, rx) = mpsc::channel();

    let chained = Arc::clone(&bus);
    bus.on_value(Key::single("first"), move |n: &u64| {
        chained.notify(Key::single("second"), n + 1);
    });
    bus.on_value(Key::single("second"), move |n: &u64| {
        tx.send(*n).unwrap();
    });

    for n in 0..20u64 {
        bus.notify(Key::single("first"), n * 10);
    }

    let mut observed: Vec<u64> = Vec::new();
    for _ in 0..20 {
        observed.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
    observed.sort_unstable();
    assert_eq!(observed, (0..20).map(|n| n * 10 + 1).collect::<Vec<_>>());
    bus.shutdown();
}
