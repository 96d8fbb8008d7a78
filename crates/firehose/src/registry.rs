// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concurrent consumer registry.
//!
//! Two indexes kept consistent: an exact key index and an ordered selector
//! list. Readers never block: the whole index is an immutable snapshot
//! behind an atomic swap, writers serialize on a short mutex, rebuild, and
//! publish the next snapshot. A registration is therefore always observed
//! fully or not at all.
//!
//! `select()` results are cached per key and tagged with the snapshot
//! version; any mutation publishes a new version, so a cached list can
//! never outlive the index it was computed from.
//!
//! # Ordering
//!
//! `select(k)` is deterministic: exact registrations before
//! selector-derived ones, each class in insertion order.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::consumer::KeyedConsumer;
use crate::key::{EventKey, Selector};

/// One registered consumer: identity, routing key, callback.
///
/// Immutable once created. For selector-derived entries the key is the
/// rewriter's derived key and the id is the owning selector's id.
pub struct Registration<K> {
    id: u64,
    key: K,
    consumer: Arc<dyn KeyedConsumer<K>>,
}

impl<K: EventKey> Registration<K> {
    #[must_use]
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[must_use]
    #[inline]
    pub fn consumer(&self) -> &Arc<dyn KeyedConsumer<K>> {
        &self.consumer
    }
}

impl<K: EventKey> std::fmt::Debug for Registration<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Ordered list of registrations matching one key.
pub type SelectList<K> = Arc<Vec<Arc<Registration<K>>>>;

struct SelectorEntry<K> {
    id: u64,
    selector: Selector<K>,
}

/// Immutable index snapshot. Rebuilt (not mutated) on every change.
struct Index<K> {
    version: u64,
    exact: HashMap<K, Vec<Arc<Registration<K>>>>,
    selectors: Vec<SelectorEntry<K>>,
}

impl<K: EventKey> Index<K> {
    fn empty() -> Self {
        Self {
            version: 0,
            exact: HashMap::new(),
            selectors: Vec::new(),
        }
    }

    fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            exact: self.exact.clone(),
            selectors: self
                .selectors
                .iter()
                .map(|entry| SelectorEntry {
                    id: entry.id,
                    selector: entry.selector.clone(),
                })
                .collect(),
        }
    }
}

/// Concurrent mapping from key to ordered registrations, plus a selector
/// index for wildcard registration.
pub struct Registry<K: EventKey> {
    index: ArcSwap<Index<K>>,
    cache: DashMap<K, (u64, SelectList<K>)>,
    write_gate: Mutex<()>,
    next_id: AtomicU64,
}

impl<K: EventKey> Registry<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: ArcSwap::from_pointee(Index::empty()),
            cache: DashMap::new(),
            write_gate: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Rebuild and publish the index under the write gate.
    fn mutate<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut Index<K>) -> bool,
    {
        let _gate = self.write_gate.lock();
        let mut next = self.index.load().next();
        let changed = edit(&mut next);
        if changed {
            self.index.store(Arc::new(next));
            self.cache.clear();
        }
        changed
    }

    /// Append a consumer to the exact index under `key`.
    pub fn register<C>(&self, key: K, consumer: C) -> u64
    where
        C: KeyedConsumer<K> + 'static,
    {
        let id = self.allocate_id();
        let registration = Arc::new(Registration {
            id,
            key: key.clone(),
            consumer: Arc::new(consumer) as Arc<dyn KeyedConsumer<K>>,
        });
        self.mutate(|index| {
            index.exact.entry(key.clone()).or_default().push(registration);
            true
        });
        log::debug!("[REGISTRY] register id={} key={:?}", id, key);
        id
    }

    /// Append a selector (predicate plus rewriter) to the selector index.
    pub fn register_selector(&self, selector: Selector<K>) -> u64 {
        let id = self.allocate_id();
        self.mutate(|index| {
            index.selectors.push(SelectorEntry {
                id,
                selector: selector.clone(),
            });
            true
        });
        log::debug!("[REGISTRY] register_selector id={}", id);
        id
    }

    /// Every registration matching `key`, in deterministic order.
    ///
    /// Computed lazily from the current snapshot and cached until the next
    /// mutation. Selector rewriters are materialized on demand.
    pub fn select(&self, key: &K) -> SelectList<K> {
        let snapshot = self.index.load();

        if let Some(cached) = self.cache.get(key) {
            let (version, list) = cached.value();
            if *version == snapshot.version {
                return Arc::clone(list);
            }
        }

        let mut matched: Vec<Arc<Registration<K>>> = snapshot
            .exact
            .get(key)
            .map(|registrations| registrations.clone())
            .unwrap_or_default();

        for entry in &snapshot.selectors {
            if entry.selector.matches(key) {
                for (derived, consumer) in entry.selector.materialize(key) {
                    matched.push(Arc::new(Registration {
                        id: entry.id,
                        key: derived,
                        consumer,
                    }));
                }
            }
        }

        let list: SelectList<K> = Arc::new(matched);
        self.cache
            .insert(key.clone(), (snapshot.version, Arc::clone(&list)));
        list
    }

    /// Remove all exact registrations for `key`. Returns true if any
    /// were removed.
    pub fn unregister(&self, key: &K) -> bool {
        let removed = self.mutate(|index| index.exact.remove(key).is_some());
        if removed {
            log::debug!("[REGISTRY] unregister key={:?}", key);
        }
        removed
    }

    /// Remove one registration by id (exact or selector).
    pub fn unregister_id(&self, id: u64) -> bool {
        self.mutate(|index| {
            let mut removed = false;
            index.exact.retain(|_, registrations| {
                let before = registrations.len();
                registrations.retain(|registration| registration.id != id);
                removed |= registrations.len() != before;
                !registrations.is_empty()
            });
            let before = index.selectors.len();
            index.selectors.retain(|entry| entry.id != id);
            removed |= index.selectors.len() != before;
            removed
        })
    }

    /// Remove every exact registration whose key satisfies the selector's
    /// predicate, and every selector entry definitionally equal to it
    /// (same predicate allocation).
    pub fn unregister_matching(&self, selector: &Selector<K>) -> bool {
        self.mutate(|index| {
            let before_exact: usize = index.exact.len();
            index.exact.retain(|key, _| !selector.matches(key));
            let mut removed = index.exact.len() != before_exact;

            let before_selectors = index.selectors.len();
            index
                .selectors
                .retain(|entry| !entry.selector.same_predicate(selector));
            removed |= index.selectors.len() != before_selectors;
            removed
        })
    }

    /// Count of keys with at least one exact registration.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.index.load().exact.len()
    }
}

impl<K: EventKey> Default for Registry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EventKey> std::fmt::Debug for Registry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.index.load();
        f.debug_struct("Registry")
            .field("version", &snapshot.version)
            .field("keys", &snapshot.exact.len())
            .field("selectors", &snapshot.selectors.len())
            .finish()
    }
}
