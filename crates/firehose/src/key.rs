// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing identity and key-matching selectors.
//!
//! The engine routes on any application key type satisfying [`EventKey`].
//! [`Key`] is the concrete type pipelines use: named parts plus a stage
//! lineage tag, so a pipeline stage can derive a fresh routing address
//! that still carries the source identity.
//!
//! Lineage participates in equality and hashing. A stage key registered
//! for a downstream consumer is therefore exactly the key the upstream
//! operator publishes to, with no selector machinery on the hot path.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::consumer::KeyedConsumer;

/// Bounds required of a routing key.
///
/// Blanket-implemented; application key types (strings, ids, tuples) and
/// [`Key`] all qualify.
pub trait EventKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> EventKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Monotonic source of stage lineage tags, shared by every pipeline.
static NEXT_STAGE: AtomicU64 = AtomicU64::new(1);

/// Routing key: named parts plus stage lineage.
///
/// # Examples
/// ```
/// use firehose::Key;
///
/// let readings = Key::of(["sensors", "temperature"]);
/// let stage = readings.derived();
///
/// assert_eq!(stage.parts(), readings.parts());
/// assert_ne!(stage, readings);    // lineage distinguishes routing
/// assert!(stage.is_derived());
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    parts: Arc<[String]>,
    stage: u64,
}

impl Key {
    /// Key from an ordered list of parts.
    pub fn of<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
            stage: 0,
        }
    }

    /// Single-part key.
    pub fn single(part: impl Into<String>) -> Self {
        Self::of([part.into()])
    }

    #[must_use]
    #[inline]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Derive a clone of this key carrying a fresh stage lineage tag.
    ///
    /// The parts (the source identity) are shared; only the lineage
    /// differs, so the derived key routes independently of its source.
    #[must_use]
    pub fn derived(&self) -> Self {
        Self {
            parts: Arc::clone(&self.parts),
            stage: NEXT_STAGE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// True for keys produced by [`Key::derived`].
    #[must_use]
    #[inline]
    pub fn is_derived(&self) -> bool {
        self.stage != 0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}", self.parts.join("/"))?;
        if self.stage != 0 {
            write!(f, "#{}", self.stage)?;
        }
        write!(f, ")")
    }
}

/// Derived entries produced by a selector's header rewriter on match.
pub type RewriterEntries<K> = Vec<(K, Arc<dyn KeyedConsumer<K>>)>;

type Predicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;
type Rewriter<K> = Arc<dyn Fn(&K) -> RewriterEntries<K> + Send + Sync>;

/// Predicate over keys, optionally carrying a header rewriter that maps a
/// matched key to derived key/consumer entries.
///
/// Selector identity (for predicate-based unregistration) is pointer
/// identity of the predicate allocation: cloning a selector preserves its
/// identity, rebuilding it from the same closure source does not.
pub struct Selector<K> {
    predicate: Predicate<K>,
    rewriter: Option<Rewriter<K>>,
}

impl<K: EventKey> Selector<K> {
    /// Selector from a bare predicate.
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&K) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            rewriter: None,
        }
    }

    /// Selector matching every key.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Attach a header rewriter producing derived entries on match.
    #[must_use]
    pub fn with_rewriter<R>(mut self, rewriter: R) -> Self
    where
        R: Fn(&K) -> RewriterEntries<K> + Send + Sync + 'static,
    {
        self.rewriter = Some(Arc::new(rewriter));
        self
    }

    /// Attach a single consumer delivered under the matched key itself.
    #[must_use]
    pub fn with_consumer<C>(self, consumer: C) -> Self
    where
        C: KeyedConsumer<K> + 'static,
    {
        let consumer: Arc<dyn KeyedConsumer<K>> = Arc::new(consumer);
        self.with_rewriter(move |key: &K| vec![(key.clone(), Arc::clone(&consumer))])
    }

    #[inline]
    pub fn matches(&self, key: &K) -> bool {
        (self.predicate)(key)
    }

    /// Materialize the derived entries for a matched key.
    ///
    /// Empty when the selector carries no rewriter.
    pub fn materialize(&self, key: &K) -> RewriterEntries<K> {
        match &self.rewriter {
            Some(rewriter) => rewriter(key),
            None => Vec::new(),
        }
    }

    /// Definitional equality: same predicate allocation.
    #[must_use]
    pub fn same_predicate(&self, other: &Selector<K>) -> bool {
        Arc::ptr_eq(&self.predicate, &other.predicate)
    }
}

impl Selector<Key> {
    /// Selector matching keys whose leading parts equal `prefix`.
    ///
    /// Wildcard registration over a key namespace, e.g. every
    /// `["sensors", ..]` key.
    pub fn key_prefix<I, S>(prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
        Self::new(move |key: &Key| {
            key.parts().len() >= prefix.len() && key.parts()[..prefix.len()] == prefix[..]
        })
    }
}

impl<K> Clone for Selector<K> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
            rewriter: self.rewriter.clone(),
        }
    }
}

impl<K> fmt::Debug for Selector<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("predicate", &Arc::as_ptr(&self.predicate))
            .field("has_rewriter", &self.rewriter.is_some())
            .finish()
    }
}
