// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactive-streams bridges.
//!
//! Connects pull-based subscriber/publisher endpoints to the dispatcher:
//! [`Firehose::subscriber`] feeds an external stream into the bus one
//! requested item at a time, [`Firehose::publisher`] exposes one key as a
//! demand-honouring publisher.
//!
//! Demand is a saturating signed counter; `i64::MAX` means unbounded.
//! Events arriving with zero demand are dropped for that subscriber, not
//! buffered.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::consumer::{ClosureConsumer, Payload};
use crate::firehose::Firehose;
use crate::key::EventKey;
use crate::DispatchError;

/// Link between a publisher and one subscriber.
pub trait StreamSubscription: Send + Sync {
    /// Signal demand for `count` more items.
    ///
    /// # Errors
    /// Non-positive demand is a precondition violation, rejected
    /// synchronously with [`DispatchError::InvalidDemand`] and leaving the
    /// demand counter untouched. The error handler is not involved; it is
    /// reserved for failures that happen off the caller's thread.
    fn request(&self, count: i64) -> Result<(), DispatchError>;
    /// Stop the flow; idempotent.
    fn cancel(&self);
}

/// Receiver of a demand-driven stream.
pub trait StreamSubscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn StreamSubscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync));
    fn on_complete(&self);
}

/// Source of a demand-driven stream.
pub trait StreamPublisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn StreamSubscriber<T>>);
}

/// Saturating demand accumulation; `i64::MAX` is sticky unbounded.
fn add_demand(counter: &AtomicI64, count: i64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        if current == i64::MAX {
            None
        } else {
            Some(current.saturating_add(count))
        }
    });
}

/// Take one unit of demand; unbounded never decrements.
fn try_take_demand(counter: &AtomicI64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if current == i64::MAX {
                Some(current)
            } else if current > 0 {
                Some(current - 1)
            } else {
                None
            }
        })
        .is_ok()
}

/// Subscriber feeding a dispatcher, requesting one item at a time.
struct IntoFirehose<K: EventKey, F> {
    firehose: Arc<Firehose<K>>,
    transpose: F,
    upstream: Mutex<Option<Arc<dyn StreamSubscription>>>,
}

impl<K, F> StreamSubscriber<(K, Payload)> for IntoFirehose<K, F>
where
    K: EventKey,
    F: Fn(&K, &Payload) -> K + Send + Sync,
{
    fn on_subscribe(&self, subscription: Arc<dyn StreamSubscription>) {
        // request(1) cannot violate the demand precondition.
        let _ = subscription.request(1);
        *self.upstream.lock() = Some(subscription);
    }

    fn on_next(&self, item: (K, Payload)) {
        let (key, payload) = item;
        let key = (self.transpose)(&key, &payload);
        self.firehose.notify_payload(key, payload);
        if let Some(subscription) = &*self.upstream.lock() {
            let _ = subscription.request(1);
        }
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        (self.firehose.error_handler())(&DispatchError::UpstreamFailure {
            detail: error.to_string(),
        });
    }

    fn on_complete(&self) {
        if let Some(subscription) = self.upstream.lock().take() {
            subscription.cancel();
        }
    }
}

/// Subscription handed out by [`FirehosePublisher`].
struct KeySubscription<K: EventKey> {
    demand: Arc<AtomicI64>,
    firehose: Arc<Firehose<K>>,
    key: K,
}

impl<K: EventKey> StreamSubscription for KeySubscription<K> {
    fn request(&self, count: i64) -> Result<(), DispatchError> {
        if count < 1 {
            return Err(DispatchError::InvalidDemand { requested: count });
        }
        add_demand(&self.demand, count);
        Ok(())
    }

    fn cancel(&self) {
        self.firehose.unregister(&self.key);
    }
}

/// Publisher over one dispatcher key.
///
/// Every subscriber gets its own forwarding registration and demand
/// counter; cancellation unregisters the key.
pub struct FirehosePublisher<K: EventKey> {
    firehose: Arc<Firehose<K>>,
    key: K,
}

impl<K: EventKey> StreamPublisher<(K, Payload)> for FirehosePublisher<K> {
    fn subscribe(&self, subscriber: Arc<dyn StreamSubscriber<(K, Payload)>>) {
        let demand = Arc::new(AtomicI64::new(0));

        let subscription = Arc::new(KeySubscription {
            demand: Arc::clone(&demand),
            firehose: Arc::clone(&self.firehose),
            key: self.key.clone(),
        });
        subscriber.on_subscribe(subscription);

        let forward = Arc::clone(&subscriber);
        self.firehose.on(
            self.key.clone(),
            ClosureConsumer::new(move |key: &K, payload: &Payload| {
                if try_take_demand(&demand) {
                    forward.on_next((key.clone(), Arc::clone(payload)));
                }
            }),
        );
    }
}

impl<K: EventKey> Firehose<K> {
    /// Subscriber endpoint: every `on_next((key, value))` is published on
    /// this dispatcher, then one more item is requested. Upstream errors
    /// go to the error handler; completion cancels the upstream
    /// subscription.
    pub fn subscriber(self: &Arc<Self>) -> Arc<dyn StreamSubscriber<(K, Payload)>> {
        self.subscriber_keyed_by(|key: &K, _payload: &Payload| key.clone())
    }

    /// Subscriber endpoint that transposes the key before publishing.
    pub fn subscriber_keyed_by<F>(
        self: &Arc<Self>,
        transpose: F,
    ) -> Arc<dyn StreamSubscriber<(K, Payload)>>
    where
        F: Fn(&K, &Payload) -> K + Send + Sync + 'static,
    {
        Arc::new(IntoFirehose {
            firehose: Arc::clone(self),
            transpose,
            upstream: Mutex::new(None),
        })
    }

    /// Publisher endpoint over `key`.
    #[must_use]
    pub fn publisher(self: &Arc<Self>, key: K) -> FirehosePublisher<K> {
        FirehosePublisher {
            firehose: Arc::clone(self),
            key,
        }
    }
}
