// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Declarative stream pipelines over the dispatcher.
//!
//! A [`Pipe`] is an immutable description: every operator returns a new
//! pipe extending the supplier sequence, the prior value is unchanged and
//! freely shareable. Nothing runs until [`PipeEnd::subscribe`] wires the
//! chain onto a [`Firehose`]: each link becomes a keyed consumer
//! registered at its stage key that republishes downstream under the next
//! stage key (a derived clone of the source key, see [`Key::derived`]).
//!
//! Because operators republish from inside a worker, the whole chain for
//! one event runs depth-first on one thread.
//!
//! # Example
//!
//! ```
//! use firehose::{Firehose, Key, Pipe};
//! use std::sync::mpsc;
//! use std::sync::Arc;
//!
//! let bus: Arc<Firehose<Key>> = Arc::new(Firehose::new());
//! let (tx, rx) = mpsc::channel();
//!
//! let subscription = Pipe::<i64>::new()
//!     .map(|n: &i64| n + 1)
//!     .filter(|n: &i64| n % 2 == 0)
//!     .consume(move |n: &i64| tx.send(*n).unwrap())
//!     .subscribe(&bus, Key::single("numbers"));
//!
//! bus.notify(Key::single("numbers"), 3i64);
//! assert_eq!(rx.recv().unwrap(), 4);
//!
//! subscription.unsubscribe();
//! bus.shutdown();
//! ```

/// Buffering stage consumers (sliding window, partition).
mod operation;
/// Per-stage state allocation.
mod state;

pub use state::StateProvider;

use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::consumer::{ClosureConsumer, KeyedConsumer, Payload};
use crate::firehose::Firehose;
use crate::key::Key;
use crate::sync::Atom;
use crate::timer::TimerHandle;
use crate::{DispatchError, ErrorHandler};

use operation::{PartitionBuffer, SlidingWindow};

/// Consumer registered for one pipeline link.
pub type StageConsumer = Arc<dyn KeyedConsumer<Key>>;

/// Produces the consumer for one link at materialization time.
///
/// `src` is the key the consumer is registered at, `dst` the derived key
/// it publishes to (unused by terminal stages).
pub trait StreamSupplier: Send + Sync {
    fn supply(&self, src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>) -> StageConsumer;
}

struct FnSupplier<F>(F);

impl<F> StreamSupplier for FnSupplier<F>
where
    F: Fn(&Key, &Key, &Arc<Firehose<Key>>) -> StageConsumer + Send + Sync,
{
    fn supply(&self, src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>) -> StageConsumer {
        (self.0)(src, dst, firehose)
    }
}

/// Typed stage body: downcast the payload, report mismatches, delegate.
fn stage<V, F>(on_mismatch: ErrorHandler, body: F) -> StageConsumer
where
    V: Send + Sync + 'static,
    F: Fn(&Key, &Payload, &V) + Send + Sync + 'static,
{
    Arc::new(ClosureConsumer::new(move |key: &Key, payload: &Payload| {
        match payload.downcast_ref::<V>() {
            Some(value) => body(key, payload, value),
            None => on_mismatch(&DispatchError::TypeMismatch {
                key: format!("{key:?}"),
                expected: std::any::type_name::<V>(),
            }),
        }
    }))
}

/// Immutable pipeline description from `In` events to `Cur` values.
///
/// Stage consumers hold only a [`Weak`](std::sync::Weak) reference to the
/// dispatcher, so a materialized pipeline never keeps its dispatcher alive
/// through the registry.
pub struct Pipe<In, Cur = In> {
    suppliers: Arc<[Arc<dyn StreamSupplier>]>,
    state: StateProvider,
    _shape: PhantomData<fn(In) -> Cur>,
}

impl<In, Cur> Clone for Pipe<In, Cur> {
    fn clone(&self) -> Self {
        Self {
            suppliers: Arc::clone(&self.suppliers),
            state: self.state.clone(),
            _shape: PhantomData,
        }
    }
}

impl<In: Send + Sync + 'static> Pipe<In, In> {
    /// Empty pipeline with fresh per-materialization state.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(StateProvider::fresh())
    }

    /// Empty pipeline drawing operator state from `state`.
    #[must_use]
    pub fn with_state(state: StateProvider) -> Self {
        Self {
            suppliers: Arc::from(Vec::new()),
            state,
            _shape: PhantomData,
        }
    }
}

impl<In: Send + Sync + 'static> Default for Pipe<In, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Cur> Pipe<In, Cur>
where
    In: Send + Sync + 'static,
    Cur: Send + Sync + 'static,
{
    /// Extend the supplier sequence; the receiver is unchanged.
    fn next<Next>(&self, supplier: impl StreamSupplier + 'static) -> Pipe<In, Next> {
        let mut suppliers: Vec<Arc<dyn StreamSupplier>> = self.suppliers.to_vec();
        suppliers.push(Arc::new(supplier));
        Pipe {
            suppliers: Arc::from(suppliers),
            state: self.state.clone(),
            _shape: PhantomData,
        }
    }

    fn end(&self, supplier: impl StreamSupplier + 'static) -> PipeEnd<In> {
        let mut suppliers: Vec<Arc<dyn StreamSupplier>> = self.suppliers.to_vec();
        suppliers.push(Arc::new(supplier));
        PipeEnd {
            suppliers: Arc::from(suppliers),
            _shape: PhantomData,
        }
    }

    /// Transform each value.
    pub fn map<Next, F>(&self, mapper: F) -> Pipe<In, Next>
    where
        Next: Send + Sync + 'static,
        F: Fn(&Cur) -> Next + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        self.next(FnSupplier(move |_src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let mapper = Arc::clone(&mapper);
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, _payload: &Payload, value: &Cur| {
                    if let Some(firehose) = weak.upgrade() {
                        firehose.notify(dst.clone(), mapper(value));
                    }
                },
            )
        }))
    }

    /// Transform with a mapper built once per materialization.
    ///
    /// Lets a subscription own mapper-local state (caches, RNGs) without
    /// sharing it across subscriptions of the same pipe.
    pub fn map_with<Next, M, B>(&self, builder: B) -> Pipe<In, Next>
    where
        Next: Send + Sync + 'static,
        M: Fn(&Cur) -> Next + Send + Sync + 'static,
        B: Fn() -> M + Send + Sync + 'static,
    {
        let builder = Arc::new(builder);
        self.next(FnSupplier(move |_src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let mapper = builder();
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, _payload: &Payload, value: &Cur| {
                    if let Some(firehose) = weak.upgrade() {
                        firehose.notify(dst.clone(), mapper(value));
                    }
                },
            )
        }))
    }

    /// Transform with access to a per-stage [`Atom`] seeded with `init`.
    pub fn map_stateful<S, Next, F>(&self, mapper: F, init: S) -> Pipe<In, Next>
    where
        S: Clone + Send + Sync + 'static,
        Next: Send + Sync + 'static,
        F: Fn(&Atom<S>, &Cur) -> Next + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        let state = self.state.clone();
        let init = Arc::new(init);
        self.next(FnSupplier(move |src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let cell = state.atom(src, || (*init).clone());
            let mapper = Arc::clone(&mapper);
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, _payload: &Payload, value: &Cur| {
                    if let Some(firehose) = weak.upgrade() {
                        firehose.notify(dst.clone(), mapper(&cell, value));
                    }
                },
            )
        }))
    }

    /// Fold every value into an accumulator, publishing each intermediate.
    pub fn scan<S, F>(&self, step: F, init: S) -> Pipe<In, S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(&S, &Cur) -> S + Send + Sync + 'static,
    {
        let step = Arc::new(step);
        let state = self.state.clone();
        let init = Arc::new(init);
        self.next(FnSupplier(move |src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let cell = state.atom(src, || (*init).clone());
            let step = Arc::clone(&step);
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, _payload: &Payload, value: &Cur| {
                    let accumulated = cell.swap(|current| step(current, value));
                    if let Some(firehose) = weak.upgrade() {
                        firehose.notify_payload(dst.clone(), accumulated);
                    }
                },
            )
        }))
    }

    /// Pass through values satisfying `predicate`.
    pub fn filter<P>(&self, predicate: P) -> Pipe<In, Cur>
    where
        P: Fn(&Cur) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.next(FnSupplier(move |_src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let predicate = Arc::clone(&predicate);
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, payload: &Payload, value: &Cur| {
                    if predicate(value) {
                        if let Some(firehose) = weak.upgrade() {
                            firehose.notify_payload(dst.clone(), Arc::clone(payload));
                        }
                    }
                },
            )
        }))
    }
}

impl<In, Cur> Pipe<In, Cur>
where
    In: Send + Sync + 'static,
    Cur: Clone + Send + Sync + 'static,
{
    /// Sliding window: append each value, trim with `trim`, publish the
    /// window.
    pub fn slide<F>(&self, trim: F) -> Pipe<In, Vec<Cur>>
    where
        F: Fn(Vec<Cur>) -> Vec<Cur> + Send + Sync + 'static,
    {
        let trim: Arc<dyn Fn(Vec<Cur>) -> Vec<Cur> + Send + Sync> = Arc::new(trim);
        let state = self.state.clone();
        self.next(FnSupplier(move |src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            Arc::new(SlidingWindow {
                firehose: Arc::downgrade(firehose),
                buffer: state.atom(src, Vec::new),
                trim: Arc::clone(&trim),
                destination: dst.clone(),
                on_mismatch: Arc::clone(firehose.error_handler()),
            }) as StageConsumer
        }))
    }

    /// Partition: buffer values until `emit_when` accepts the buffer, then
    /// emit it downstream and reset.
    pub fn partition<F>(&self, emit_when: F) -> Pipe<In, Vec<Cur>>
    where
        F: Fn(&[Cur]) -> bool + Send + Sync + 'static,
    {
        let emit_when: Arc<dyn Fn(&[Cur]) -> bool + Send + Sync> = Arc::new(emit_when);
        let state = self.state.clone();
        self.next(FnSupplier(move |_src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            Arc::new(PartitionBuffer {
                firehose: Arc::downgrade(firehose),
                // Partition state is keyed to the destination: each
                // materialized link accumulates its own batches.
                buffer: state.atom(dst, Vec::new),
                emit_when: Arc::clone(&emit_when),
                destination: dst.clone(),
                on_mismatch: Arc::clone(firehose.error_handler()),
            }) as StageConsumer
        }))
    }

    /// Emit the latest value once per quiet window: the first event of a
    /// window schedules a single firing after `period`; later events only
    /// replace the pending value.
    pub fn debounce(&self, period: Duration) -> Pipe<In, Cur> {
        let state = self.state.clone();
        self.next(FnSupplier(move |src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let last_seen: Arc<Atom<Option<Cur>>> = state.atom(src, || None);
            let pending: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, _payload: &Payload, value: &Cur| {
                    last_seen.swap(|_| Some(value.clone()));

                    let mut pending_guard = pending.lock();
                    if pending_guard.is_some() {
                        return;
                    }
                    let Some(firehose) = weak.upgrade() else {
                        return;
                    };
                    let fire_last = Arc::clone(&last_seen);
                    let fire_pending = Arc::clone(&pending);
                    let fire_weak = weak.clone();
                    let fire_dst = dst.clone();
                    *pending_guard = Some(firehose.timer().submit(period, move || {
                        fire_pending.lock().take();
                        if let Some(value) = &*fire_last.load() {
                            if let Some(firehose) = fire_weak.upgrade() {
                                firehose.notify(fire_dst.clone(), value.clone());
                            }
                        }
                    }));
                },
            )
        }))
    }

    /// Emit the latest value once the stream has been idle for `period`:
    /// every event cancels the pending firing and schedules a new one.
    pub fn throttle(&self, period: Duration) -> Pipe<In, Cur> {
        let state = self.state.clone();
        self.next(FnSupplier(move |src: &Key, dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let last_seen: Arc<Atom<Option<Cur>>> = state.atom(src, || None);
            let pending: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
            let weak = Arc::downgrade(firehose);
            let dst = dst.clone();
            stage(
                Arc::clone(firehose.error_handler()),
                move |_key: &Key, _payload: &Payload, value: &Cur| {
                    let mut pending_guard = pending.lock();
                    if let Some(prior) = pending_guard.take() {
                        prior.cancel();
                    }
                    last_seen.swap(|_| Some(value.clone()));

                    let Some(firehose) = weak.upgrade() else {
                        return;
                    };
                    let fire_last = Arc::clone(&last_seen);
                    let fire_pending = Arc::clone(&pending);
                    let fire_weak = weak.clone();
                    let fire_dst = dst.clone();
                    *pending_guard = Some(firehose.timer().submit(period, move || {
                        fire_pending.lock().take();
                        if let Some(value) = &*fire_last.load() {
                            if let Some(firehose) = fire_weak.upgrade() {
                                firehose.notify(fire_dst.clone(), value.clone());
                            }
                        }
                    }));
                },
            )
        }))
    }
}

impl<In, Cur> Pipe<In, Cur>
where
    In: Send + Sync + 'static,
    Cur: Send + Sync + 'static,
{
    /// Terminate the pipeline with a value sink.
    pub fn consume<F>(&self, sink: F) -> PipeEnd<In>
    where
        F: Fn(&Cur) + Send + Sync + 'static,
    {
        self.consume_keyed(move |_key: &Key, value: &Cur| sink(value))
    }

    /// Terminate the pipeline with a key-aware sink.
    pub fn consume_keyed<F>(&self, sink: F) -> PipeEnd<In>
    where
        F: Fn(&Key, &Cur) + Send + Sync + 'static,
    {
        let sink = Arc::new(sink);
        self.end(FnSupplier(move |_src: &Key, _dst: &Key, firehose: &Arc<Firehose<Key>>| {
            let sink = Arc::clone(&sink);
            stage(
                Arc::clone(firehose.error_handler()),
                move |key: &Key, _payload: &Payload, value: &Cur| sink(key, value),
            )
        }))
    }
}

impl<In, Cur> std::fmt::Debug for Pipe<In, Cur> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("links", &self.suppliers.len())
            .finish()
    }
}

/// Completed pipeline, ready to materialize.
pub struct PipeEnd<In> {
    suppliers: Arc<[Arc<dyn StreamSupplier>]>,
    _shape: PhantomData<fn(In)>,
}

impl<In> Clone for PipeEnd<In> {
    fn clone(&self) -> Self {
        Self {
            suppliers: Arc::clone(&self.suppliers),
            _shape: PhantomData,
        }
    }
}

impl<In: Send + Sync + 'static> PipeEnd<In> {
    /// Wire the chain onto `firehose`, starting at `source`.
    ///
    /// Link `i` is registered at stage key `k_i` (with `k_0 = source`) and
    /// publishes to the freshly derived `k_{i+1}`. The returned handle
    /// unsubscribes exactly the registrations created here.
    pub fn subscribe(&self, firehose: &Arc<Firehose<Key>>, source: Key) -> PipeSubscription {
        let mut registrations = Vec::with_capacity(self.suppliers.len());
        let mut link = source;

        for supplier in self.suppliers.iter() {
            let dst = link.derived();
            let consumer = supplier.supply(&link, &dst, firehose);
            registrations.push(firehose.on(link.clone(), consumer));
            link = dst;
        }

        log::debug!(
            "[PIPE] subscribed {} links ({} registrations)",
            self.suppliers.len(),
            registrations.len()
        );

        PipeSubscription {
            firehose: Arc::clone(firehose),
            registrations,
        }
    }
}

impl<In> std::fmt::Debug for PipeEnd<In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd")
            .field("links", &self.suppliers.len())
            .finish()
    }
}

/// Handle over one materialized pipeline.
#[derive(Debug)]
pub struct PipeSubscription {
    firehose: Arc<Firehose<Key>>,
    registrations: Vec<u64>,
}

impl PipeSubscription {
    /// Number of registrations this subscription created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Tear down every registration created by `subscribe`.
    pub fn unsubscribe(self) {
        for id in &self.registrations {
            self.firehose.unregister_id(*id);
        }
        log::debug!("[PIPE] unsubscribed {} registrations", self.registrations.len());
    }
}
