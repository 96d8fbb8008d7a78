// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Firehose - keyed in-process event dispatch
//!
//! A publish/subscribe engine for `(key, value)` events with bounded
//! backpressure, plus declarative stream pipelines materialized on top of
//! it.
//!
//! ## Quick Start
//!
//! ```
//! use firehose::{Firehose, FirehoseConfig, Key, Pipe};
//! use std::sync::mpsc;
//! use std::sync::Arc;
//!
//! // One worker keeps the two publishes strictly ordered end to end.
//! let bus: Arc<Firehose<Key>> =
//!     Arc::new(Firehose::with_config(FirehoseConfig::new().pool_size(1)));
//! let (tx, rx) = mpsc::channel();
//!
//! Pipe::<i64>::new()
//!     .scan(|sum: &i64, n: &i64| sum + n, 0)
//!     .consume(move |total: &i64| tx.send(*total).unwrap())
//!     .subscribe(&bus, Key::single("numbers"));
//!
//! bus.notify(Key::single("numbers"), 2i64);
//! bus.notify(Key::single("numbers"), 3i64);
//!
//! assert_eq!(rx.recv().unwrap(), 2);
//! assert_eq!(rx.recv().unwrap(), 5);
//! bus.shutdown();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Pipeline Composer                       |
//! |   Pipe: map | scan | filter | slide | partition | debounce   |
//! +--------------------------------------------------------------+
//! |                     Dispatch Core (Firehose)                 |
//! |   notify -> backpressure gate -> RingHandoff -> worker pool  |
//! |   Registry.select(key) -> consumers (panic-isolated)         |
//! +--------------------------------------------------------------+
//! |   Registry (copy-on-write) | Atom (CAS) | TimingWheel        |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Firehose`] | The dispatcher: publish, register, fork, shut down |
//! | [`Key`] | Routing identity with stage lineage for pipelines |
//! | [`Selector`] | Predicate registration over key families |
//! | [`Pipe`] | Immutable operator chain materialized onto a dispatcher |
//! | [`sync::Atom`] | CAS cell holding per-stage operator state |
//! | [`TimingWheel`] | One-shot timers driving debounce/throttle |
//!
//! ## Guarantees
//!
//! - Every matching registration sees each event exactly once, in
//!   deterministic order; a panicking consumer never starves the rest.
//! - The ring handoff never holds more than its capacity in outstanding
//!   tasks; saturated publishers park until a worker frees a slot.
//! - Publications from inside a consumer are delivered depth-first on the
//!   same thread, bypassing the gate (no self-deadlock).
//!
//! Ordering holds per publisher per key up to worker concurrency: tasks
//! enter the ring in publication order and pipeline chains run depth-first
//! within one task. Run a single-worker pool when strict cross-event
//! ordering of side effects matters.
//!
//! The engine is strictly in-process: no persistence, no wire protocol,
//! no cross-process delivery.

/// Engine configuration and defaults.
pub mod config;
/// Consumer trait and adapters.
pub mod consumer;
mod firehose;
/// Routing keys and selectors.
pub mod key;
/// Pipeline composer and operators.
pub mod pipe;
/// Concurrent consumer registry.
pub mod registry;
/// Bounded task handoff between publishers and workers.
pub mod ring;
/// Reactive-streams bridges.
pub mod streams;
/// Concurrency primitives (Atom, WakeNotifier).
pub mod sync;
/// Hashed timing wheel.
pub mod timer;

pub use config::FirehoseConfig;
pub use consumer::{ClosureConsumer, KeyedConsumer, Payload, TypedConsumer};
pub use firehose::{Firehose, FirehoseMetrics, MetricsSnapshot};
pub use key::{EventKey, Key, Selector};
pub use pipe::{Pipe, PipeEnd, PipeSubscription, StateProvider, StreamSupplier};
pub use registry::{Registration, Registry};
pub use ring::RingHandoff;
pub use streams::{FirehosePublisher, StreamPublisher, StreamSubscriber, StreamSubscription};
pub use timer::{TimerHandle, TimingWheel};

use std::sync::Arc;

/// Failures raised by the dispatch engine.
///
/// Failures that happen off the caller's thread (consumer panics, worker
/// failures, payload type mismatches, timer callback panics, upstream
/// stream errors) are routed to the configured error handler and dispatch
/// continues; the engine never terminates on them, and
/// [`Firehose::shutdown`] is the only orderly stop. Precondition
/// violations ([`DispatchError::InvalidDemand`]) are returned to the
/// caller directly instead.
#[derive(Debug)]
pub enum DispatchError {
    /// A consumer panicked during dispatch; remaining consumers still ran.
    ConsumerPanic { key: String, detail: String },
    /// A failure inside a worker outside any single consumer, wrapped
    /// with the offending key for context.
    WorkerFailure { key: String, detail: String },
    /// A typed consumer received a payload of a different type.
    TypeMismatch { key: String, expected: &'static str },
    /// A stream subscriber requested non-positive demand. Returned from
    /// [`StreamSubscription::request`] synchronously, never routed to the
    /// error handler.
    InvalidDemand { requested: i64 },
    /// A timing wheel callback panicked.
    TimerFailure { detail: String },
    /// An upstream reactive-streams source signalled an error.
    UpstreamFailure { detail: String },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::ConsumerPanic { key, detail } => {
                write!(f, "consumer panicked for key {key}: {detail}")
            }
            DispatchError::WorkerFailure { key, detail } => {
                write!(f, "dispatch failed for key {key}: {detail}")
            }
            DispatchError::TypeMismatch { key, expected } => {
                write!(f, "payload for key {key} is not a {expected}")
            }
            DispatchError::InvalidDemand { requested } => {
                write!(f, "non-positive demand requested: {requested}")
            }
            DispatchError::TimerFailure { detail } => {
                write!(f, "timer callback panicked: {detail}")
            }
            DispatchError::UpstreamFailure { detail } => {
                write!(f, "upstream stream failed: {detail}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Callback receiving every [`DispatchError`].
///
/// Must be cheap and non-blocking; it runs on worker threads, the timing
/// wheel thread, and publishing threads.
pub type ErrorHandler = Arc<dyn Fn(&DispatchError) + Send + Sync>;

/// Default handler: log the failure and keep dispatching.
#[must_use]
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|error| {
        log::error!("[FIREHOSE] {}", error);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let error = DispatchError::ConsumerPanic {
            key: "Key(a/b)".to_string(),
            detail: "boom".to_string(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("Key(a/b)"));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn test_default_handler_does_not_panic() {
        let handler = default_error_handler();
        handler(&DispatchError::TimerFailure {
            detail: "boom".to_string(),
        });
    }
}
