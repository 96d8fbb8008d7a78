// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffering pipeline operators.
//!
//! The sliding-window and partition stages carry a shared buffer in an
//! [`Atom`]; every structural decision happens inside the CAS transition,
//! and downstream publication happens only after the winning attempt, so
//! concurrent events on one key can never double-emit or drop a batch.

use std::sync::{Arc, Weak};

use crate::consumer::{KeyedConsumer, Payload};
use crate::firehose::Firehose;
use crate::key::Key;
use crate::sync::Atom;
use crate::{DispatchError, ErrorHandler};

/// Windowing stage: append each value, trim with the user function,
/// publish the resulting window downstream.
pub(crate) struct SlidingWindow<V> {
    pub(crate) firehose: Weak<Firehose<Key>>,
    pub(crate) buffer: Arc<Atom<Vec<V>>>,
    pub(crate) trim: Arc<dyn Fn(Vec<V>) -> Vec<V> + Send + Sync>,
    pub(crate) destination: Key,
    pub(crate) on_mismatch: ErrorHandler,
}

impl<V> KeyedConsumer<Key> for SlidingWindow<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn accept(&self, key: &Key, value: &Payload) {
        let Some(value) = value.downcast_ref::<V>() else {
            (self.on_mismatch)(&DispatchError::TypeMismatch {
                key: format!("{key:?}"),
                expected: std::any::type_name::<V>(),
            });
            return;
        };

        let window = self.buffer.swap(|current| {
            let mut next = current.clone();
            next.push(value.clone());
            (self.trim)(next)
        });

        if let Some(firehose) = self.firehose.upgrade() {
            firehose.notify_payload(self.destination.clone(), window);
        }
    }
}

/// Partitioning stage: append each value; when the user predicate accepts
/// the buffer, emit it downstream and reset.
///
/// Append, test, and reset all run inside one CAS transition; the emit is
/// deferred to after the successful swap.
pub(crate) struct PartitionBuffer<V> {
    pub(crate) firehose: Weak<Firehose<Key>>,
    pub(crate) buffer: Arc<Atom<Vec<V>>>,
    pub(crate) emit_when: Arc<dyn Fn(&[V]) -> bool + Send + Sync>,
    pub(crate) destination: Key,
    pub(crate) on_mismatch: ErrorHandler,
}

impl<V> KeyedConsumer<Key> for PartitionBuffer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn accept(&self, key: &Key, value: &Payload) {
        let Some(value) = value.downcast_ref::<V>() else {
            (self.on_mismatch)(&DispatchError::TypeMismatch {
                key: format!("{key:?}"),
                expected: std::any::type_name::<V>(),
            });
            return;
        };

        let (_, emitted) = self.buffer.swap_with(|current| {
            let mut next = current.clone();
            next.push(value.clone());
            if (self.emit_when)(&next) {
                (Vec::new(), Some(next))
            } else {
                (next, None)
            }
        });

        if let Some(batch) = emitted {
            if let Some(firehose) = self.firehose.upgrade() {
                firehose.notify(self.destination.clone(), batch);
            }
        }
    }
}
