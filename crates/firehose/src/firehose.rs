// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Keyed publish/subscribe dispatcher.
//!
//! Publishers call [`Firehose::notify`]; matching consumers run on a fixed
//! worker pool draining the ring handoff. A publish issued from inside a
//! worker bypasses both the backpressure gate and the ring and dispatches
//! synchronously on the current thread, which keeps operator chains
//! depth-first and cannot deadlock on an exhausted ring.
//!
//! # Architecture
//!
//! ```text
//! notify(key, value)
//!     in worker context -> dispatch(key, value) on this thread
//!     otherwise         -> claim_slot (park while saturated)
//!                            -> RingHandoff -> worker: dispatch(key, value)
//!                                  v
//!                          Registry.select(key) -> consumer.accept(..) each,
//!                          panic-isolated per consumer
//! ```
//!
//! # Ordering
//!
//! Events for one key from one publishing thread enter the ring in
//! publication order. Distinct keys, distinct publishers, and concurrent
//! workers carry no ordering guarantee; reentrant publications are
//! delivered depth-first.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::FirehoseConfig;
use crate::consumer::{KeyedConsumer, Payload, TypedConsumer};
use crate::key::{EventKey, Selector};
use crate::registry::Registry;
use crate::ring::RingHandoff;
use crate::timer::{panic_detail, TimingWheel};
use crate::{DispatchError, ErrorHandler};

thread_local! {
    /// Instance id of the dispatcher currently dispatching on this thread,
    /// 0 when outside any worker context.
    static ACTIVE_DISPATCHER: Cell<u64> = const { Cell::new(0) };
}

/// Source of dispatcher instance ids (0 is reserved for "none").
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Spins before the backpressure gate falls back to timed parking.
const GATE_SPINS: u32 = 64;

/// Initial and maximum park interval of the saturated gate.
const GATE_PARK_MIN: Duration = Duration::from_micros(10);
const GATE_PARK_MAX: Duration = Duration::from_millis(2);

/// Relaxed counters tracking dispatch outcomes.
///
/// All fields use relaxed atomics; consumers only need monotonic
/// snapshots for observability.
#[derive(Debug, Default)]
pub struct FirehoseMetrics {
    pub events_published: AtomicU64,
    pub events_dispatched: AtomicU64,
    pub consumer_errors: AtomicU64,
    pub events_dropped: AtomicU64,
    pub backpressure_parks: AtomicU64,
}

/// Point-in-time copy of [`FirehoseMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_dispatched: u64,
    pub consumer_errors: u64,
    pub events_dropped: u64,
    pub backpressure_parks: u64,
}

impl FirehoseMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            consumer_errors: self.consumer_errors.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            backpressure_parks: self.backpressure_parks.load(Ordering::Relaxed),
        }
    }
}

/// Keyed publish/subscribe bus with bounded handoff and worker fan-out.
///
/// # Examples
///
/// ```
/// use firehose::{Firehose, Key};
/// use std::sync::atomic::{AtomicI64, Ordering};
/// use std::sync::Arc;
///
/// let bus: Firehose<Key> = Firehose::new();
/// let sum = Arc::new(AtomicI64::new(0));
/// let sink = Arc::clone(&sum);
///
/// bus.on_value(Key::single("totals"), move |n: &i64| {
///     sink.fetch_add(*n, Ordering::SeqCst);
/// });
/// bus.notify(Key::single("totals"), 40i64);
/// bus.notify(Key::single("totals"), 2i64);
/// bus.shutdown();
/// assert_eq!(sum.load(Ordering::SeqCst), 42);
/// ```
pub struct Firehose<K: EventKey> {
    instance: u64,
    registry: Arc<Registry<K>>,
    ring: Arc<RingHandoff>,
    error_handler: ErrorHandler,
    metrics: Arc<FirehoseMetrics>,
    wheel: OnceLock<TimingWheel>,
    config: FirehoseConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: EventKey> Firehose<K> {
    /// Dispatcher with default configuration and the logging error handler.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FirehoseConfig::default())
    }

    /// Dispatcher with an explicit configuration.
    #[must_use]
    pub fn with_config(config: FirehoseConfig) -> Self {
        Self::with_error_handler(config, crate::default_error_handler())
    }

    /// Dispatcher with an explicit configuration and error handler.
    #[must_use]
    pub fn with_error_handler(config: FirehoseConfig, error_handler: ErrorHandler) -> Self {
        Self::assemble(Arc::new(Registry::new()), config, error_handler)
    }

    fn assemble(
        registry: Arc<Registry<K>>,
        config: FirehoseConfig,
        error_handler: ErrorHandler,
    ) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let ring = Arc::new(RingHandoff::with_capacity(config.ring_capacity));

        let mut workers = Vec::with_capacity(config.pool_size);
        for worker_index in 0..config.pool_size {
            let ring = Arc::clone(&ring);
            let handler = Arc::clone(&error_handler);
            let handle = std::thread::Builder::new()
                .name(format!("firehose-worker-{worker_index}"))
                .spawn(move || worker_loop(instance, &ring, &handler))
                .expect("failed to spawn dispatch worker");
            workers.push(handle);
        }

        log::debug!(
            "[FIREHOSE] started instance={} workers={} capacity={}",
            instance,
            config.pool_size,
            config.ring_capacity
        );

        Self {
            instance,
            registry,
            ring,
            error_handler,
            metrics: Arc::new(FirehoseMetrics::default()),
            wheel: OnceLock::new(),
            config,
            workers: Mutex::new(workers),
        }
    }

    /// New dispatcher sharing this registry (and error handler) with its
    /// own ring handoff and worker pool.
    #[must_use]
    pub fn fork(&self, pool_size: usize, ring_capacity: usize) -> Firehose<K> {
        let config = self
            .config
            .clone()
            .pool_size(pool_size)
            .ring_capacity(ring_capacity);
        Self::assemble(
            Arc::clone(&self.registry),
            config,
            Arc::clone(&self.error_handler),
        )
    }

    /// Publish `value` under `key`.
    ///
    /// Every registration matching `key` at selection time observes the
    /// event exactly once, in `select()` order; a panicking consumer is
    /// reported and skipped without starving the rest. With no matching
    /// registration the event is silently dropped (counted).
    ///
    /// Blocks while the ring handoff is saturated, unless called from
    /// inside a worker, where delivery is synchronous and depth-first.
    pub fn notify<V: Send + Sync + 'static>(&self, key: K, value: V) -> &Self {
        self.notify_payload(key, Arc::new(value))
    }

    /// Publish an already type-erased payload (avoids re-wrapping when an
    /// operator republishes a value it received).
    pub fn notify_payload(&self, key: K, payload: Payload) -> &Self {
        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);

        if ACTIVE_DISPATCHER.get() == self.instance {
            // Reentrant publish: dispatch depth-first on this worker.
            self.run_guarded(&key, &payload);
            return self;
        }

        if !self.claim_slot_blocking(&key) {
            return self;
        }

        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.error_handler);
        let metrics = Arc::clone(&self.metrics);
        self.ring.offer(Box::new(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
                dispatch_event(&registry, &handler, &metrics, &key, &payload);
            })) {
                handler(&DispatchError::WorkerFailure {
                    key: format!("{key:?}"),
                    detail: panic_detail(&panic),
                });
            }
        }));
        self
    }

    /// Synchronous dispatch with the same outer guard the ring tasks get.
    fn run_guarded(&self, key: &K, payload: &Payload) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
            dispatch_event(
                &self.registry,
                &self.error_handler,
                &self.metrics,
                key,
                payload,
            );
        })) {
            (self.error_handler)(&DispatchError::WorkerFailure {
                key: format!("{key:?}"),
                detail: panic_detail(&panic),
            });
        }
    }

    /// Backpressure gate: spin briefly, then park in escalating intervals
    /// until a slot frees. Returns false when the dispatcher shut down
    /// while waiting (the event is dropped).
    fn claim_slot_blocking(&self, key: &K) -> bool {
        let mut spins: u32 = 0;
        let mut park = GATE_PARK_MIN;
        let mut parked = false;

        loop {
            if self.ring.claim_slot() {
                return true;
            }
            if !self.ring.is_open() {
                log::warn!(
                    "[FIREHOSE] dropping publish for key={:?}: shut down while gated",
                    key
                );
                self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if spins < GATE_SPINS {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            if !parked {
                parked = true;
                self.metrics.backpressure_parks.fetch_add(1, Ordering::Relaxed);
                log::debug!("[FIREHOSE] gate saturated, parking publisher");
            }
            self.ring.wait_for_slot(park);
            park = (park * 2).min(GATE_PARK_MAX);
        }
    }

    /// Register a consumer under an exact key.
    pub fn on<C>(&self, key: K, consumer: C) -> u64
    where
        C: KeyedConsumer<K> + 'static,
    {
        self.registry.register(key, consumer)
    }

    /// Register a typed callback receiving key and value.
    pub fn on_keyed<V, F>(&self, key: K, callback: F) -> u64
    where
        V: Send + Sync + 'static,
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        let consumer = TypedConsumer::new(callback, Arc::clone(&self.error_handler));
        self.registry.register(key, consumer)
    }

    /// Register a typed callback receiving only the value.
    pub fn on_value<V, F>(&self, key: K, callback: F) -> u64
    where
        V: Send + Sync + 'static,
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.on_keyed(key, move |_key: &K, value: &V| callback(value))
    }

    /// Register a selector; its rewriter entries are materialized for each
    /// matching key on demand.
    pub fn on_selector(&self, selector: Selector<K>) -> u64 {
        self.registry.register_selector(selector)
    }

    /// Remove all registrations for `key`.
    pub fn unregister(&self, key: &K) -> bool {
        self.registry.unregister(key)
    }

    /// Remove one registration by id.
    pub fn unregister_id(&self, id: u64) -> bool {
        self.registry.unregister_id(id)
    }

    /// Remove every registration matched by the selector's predicate, and
    /// the selector itself if registered.
    pub fn unregister_matching(&self, selector: &Selector<K>) -> bool {
        self.registry.unregister_matching(selector)
    }

    /// Shared consumer registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry<K>> {
        &self.registry
    }

    /// Configured error handler.
    #[must_use]
    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    #[must_use]
    pub fn config(&self) -> &FirehoseConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Timing wheel, started on first access.
    pub fn timer(&self) -> &TimingWheel {
        self.wheel.get_or_init(|| {
            TimingWheel::start(
                self.config.wheel_tick,
                self.config.wheel_slots,
                Arc::clone(&self.error_handler),
            )
        })
    }

    /// Orderly stop: close the ring intake, drain queued tasks, join the
    /// workers. Running consumers finish; the registry is untouched.
    pub fn shutdown(&self) {
        self.ring.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        log::debug!("[FIREHOSE] instance={} shut down", self.instance);
    }
}

impl<K: EventKey> Default for Firehose<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EventKey> Drop for Firehose<K> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<K: EventKey> std::fmt::Debug for Firehose<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firehose")
            .field("instance", &self.instance)
            .field("registry", &self.registry)
            .field("ring", &self.ring)
            .finish()
    }
}

/// Worker body: drain the ring, mark the dispatcher context around every
/// task (including panic paths), release the slot after completion.
fn worker_loop(instance: u64, ring: &RingHandoff, handler: &ErrorHandler) {
    while let Some(task) = ring.next_task() {
        let previous = ACTIVE_DISPATCHER.replace(instance);
        let outcome = catch_unwind(AssertUnwindSafe(task));
        ACTIVE_DISPATCHER.set(previous);
        ring.release_slot();

        if let Err(panic) = outcome {
            // Tasks guard themselves with key context; this is the final
            // backstop for failures outside any dispatch.
            handler(&DispatchError::WorkerFailure {
                key: "<task>".to_string(),
                detail: panic_detail(&panic),
            });
        }
    }
}

/// Deliver one event to every matching registration, in `select()` order,
/// isolating consumer panics.
fn dispatch_event<K: EventKey>(
    registry: &Registry<K>,
    handler: &ErrorHandler,
    metrics: &FirehoseMetrics,
    key: &K,
    payload: &Payload,
) {
    let matched = registry.select(key);
    if matched.is_empty() {
        metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
        log::debug!("[FIREHOSE] drop key={:?} (no matching consumer)", key);
        return;
    }

    for registration in matched.iter() {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            registration.consumer().accept(key, payload);
        }));
        match outcome {
            Ok(()) => {
                metrics.events_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                metrics.consumer_errors.fetch_add(1, Ordering::Relaxed);
                handler(&DispatchError::ConsumerPanic {
                    key: format!("{key:?}"),
                    detail: panic_detail(&panic),
                });
            }
        }
    }
}
