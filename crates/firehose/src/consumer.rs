// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer trait and adapters for receiving keyed events.
//!
//! # Thread Safety
//! Implementations must be Send + Sync as callbacks are invoked from
//! worker threads, and from the publishing thread during reentrant
//! dispatch.

use std::any::Any;
use std::sync::Arc;

use crate::key::EventKey;
use crate::{DispatchError, ErrorHandler};

/// Type-erased event value.
///
/// Events are heterogeneous: a single key may carry integers on one hop of
/// a pipeline and windows of them on the next. Typed entry points wrap and
/// downcast at the edges; a mismatch is routed to the error handler, never
/// a panic.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Consumer invoked for every event whose key matches its registration.
///
/// # Examples
/// ```
/// use firehose::{KeyedConsumer, Payload};
///
/// struct Printer;
///
/// impl KeyedConsumer<String> for Printer {
///     fn accept(&self, key: &String, value: &Payload) {
///         if let Some(n) = value.downcast_ref::<i64>() {
///             println!("{key} = {n}");
///         }
///     }
/// }
/// ```
pub trait KeyedConsumer<K>: Send + Sync {
    /// Called once per matching event.
    ///
    /// # Panics
    /// A panic here is caught by the dispatcher, routed to the error
    /// handler, and never prevents delivery to the remaining consumers.
    fn accept(&self, key: &K, value: &Payload);
}

impl<K, C> KeyedConsumer<K> for Arc<C>
where
    C: KeyedConsumer<K> + ?Sized,
{
    fn accept(&self, key: &K, value: &Payload) {
        (**self).accept(key, value);
    }
}

/// Closure-based consumer over the raw type-erased payload.
pub struct ClosureConsumer<F> {
    callback: F,
}

impl<F> ClosureConsumer<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<K, F> KeyedConsumer<K> for ClosureConsumer<F>
where
    K: EventKey,
    F: Fn(&K, &Payload) + Send + Sync,
{
    fn accept(&self, key: &K, value: &Payload) {
        (self.callback)(key, value);
    }
}

/// Consumer that downcasts the payload to a concrete type before invoking
/// its callback.
///
/// A payload of any other type is reported as
/// [`DispatchError::TypeMismatch`] through the dispatcher's error handler
/// and skipped.
pub struct TypedConsumer<V, F> {
    callback: F,
    on_mismatch: ErrorHandler,
    _value: std::marker::PhantomData<fn(&V)>,
}

impl<V, F> TypedConsumer<V, F> {
    pub fn new(callback: F, on_mismatch: ErrorHandler) -> Self {
        Self {
            callback,
            on_mismatch,
            _value: std::marker::PhantomData,
        }
    }
}

impl<K, V, F> KeyedConsumer<K> for TypedConsumer<V, F>
where
    K: EventKey,
    V: Send + Sync + 'static,
    F: Fn(&K, &V) + Send + Sync,
{
    fn accept(&self, key: &K, value: &Payload) {
        match value.downcast_ref::<V>() {
            Some(typed) => (self.callback)(key, typed),
            None => (self.on_mismatch)(&DispatchError::TypeMismatch {
                key: format!("{key:?}"),
                expected: std::any::type_name::<V>(),
            }),
        }
    }
}
