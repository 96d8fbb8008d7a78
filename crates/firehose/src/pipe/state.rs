// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-stage state allocation for pipeline operators.
//!
//! Stateful operators (scan, slide, partition, debounce) obtain their
//! [`Atom`] cells from a [`StateProvider`] at materialization time. The
//! default provider hands out fresh cells; the keyed provider retains
//! cells per `(key, state type)` so a pipeline re-subscribed at the same
//! source key resumes its accumulated state.

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::key::Key;
use crate::sync::Atom;

type RetainedCells = DashMap<(Key, TypeId), Arc<dyn Any + Send + Sync>>;

/// Source of operator state cells.
#[derive(Clone)]
pub struct StateProvider {
    retained: Option<Arc<RetainedCells>>,
}

impl StateProvider {
    /// Every materialization gets a fresh cell (the default).
    #[must_use]
    pub fn fresh() -> Self {
        Self { retained: None }
    }

    /// Cells are retained per key and state type across materializations.
    #[must_use]
    pub fn keyed() -> Self {
        Self {
            retained: Some(Arc::new(DashMap::new())),
        }
    }

    /// Cell for `key`, created from `init` when absent.
    pub fn atom<T, F>(&self, key: &Key, init: F) -> Arc<Atom<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let Some(retained) = &self.retained else {
            return Arc::new(Atom::new(init()));
        };

        let init = std::cell::Cell::new(Some(init));
        let make = || {
            let init = init.take().expect("init invoked at most once per call");
            Arc::new(Atom::new(init())) as Arc<dyn Any + Send + Sync>
        };

        let cell = retained
            .entry((key.clone(), TypeId::of::<T>()))
            .or_insert_with(&make)
            .value()
            .clone();

        // The TypeId in the map key makes a mismatch unreachable; fall
        // back to a fresh cell rather than panic regardless.
        cell.downcast::<Atom<T>>().unwrap_or_else(|_| {
            make()
                .downcast::<Atom<T>>()
                .unwrap_or_else(|_| unreachable!())
        })
    }
}

impl Default for StateProvider {
    fn default() -> Self {
        Self::fresh()
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("keyed", &self.retained.is_some())
            .finish()
    }
}
