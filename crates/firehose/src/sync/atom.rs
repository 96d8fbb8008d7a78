// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-slot compare-and-swap cell.
//!
//! Holds the per-stage state of pipeline operators (scan accumulators,
//! sliding windows, partition buffers). All mutation goes through
//! [`Atom::swap`]: the transition function is applied to a fresh snapshot
//! and installed with CAS, retrying on contention. Readers never block.
//!
//! There is deliberately no mutable getter; the only way to change the
//! value is a transition applied under CAS.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Lock-free single-value cell.
///
/// # Example
///
/// ```
/// use firehose::sync::Atom;
///
/// let counter = Atom::new(0u64);
/// counter.swap(|n| n + 1);
/// counter.swap(|n| n + 1);
/// assert_eq!(*counter.load(), 2);
/// ```
pub struct Atom<T> {
    cell: ArcSwap<T>,
}

impl<T> Atom<T> {
    /// Create a cell holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            cell: ArcSwap::from_pointee(initial),
        }
    }

    /// Current value, unsynchronized eventually-consistent snapshot.
    #[inline]
    pub fn load(&self) -> Arc<T> {
        self.cell.load_full()
    }

    /// Apply `transition` under compare-and-swap until it sticks.
    ///
    /// `transition` may run several times under contention and must be
    /// side-effect free. Returns the value that won the CAS.
    pub fn swap<F>(&self, transition: F) -> Arc<T>
    where
        F: Fn(&T) -> T,
    {
        let mut current = self.cell.load();
        loop {
            let next = Arc::new(transition(&current));
            let previous = self.cell.compare_and_swap(&*current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                return next;
            }
            current = previous;
        }
    }

    /// Like [`Atom::swap`], but the transition also yields a decision value
    /// that is returned from the winning attempt only.
    ///
    /// Lets callers take an action (such as publishing an emitted batch)
    /// exactly once per successful transition, which is what makes the
    /// partition operator's append-test-emit-reset sequence atomic.
    pub fn swap_with<F, D>(&self, transition: F) -> (Arc<T>, D)
    where
        F: Fn(&T) -> (T, D),
    {
        let mut current = self.cell.load();
        loop {
            let (next, decision) = transition(&current);
            let next = Arc::new(next);
            let previous = self.cell.compare_and_swap(&*current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                return (next, decision);
            }
            current = previous;
        }
    }

    /// Unconditionally replace the value.
    pub fn reset(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        self.cell.store(Arc::clone(&next));
        next
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Atom").field(&self.cell.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_load_initial() {
        let atom = Atom::new(41);
        assert_eq!(*atom.load(), 41);
    }

    #[test]
    fn test_swap_returns_new_value() {
        let atom = Atom::new(1);
        let new = atom.swap(|n| n * 10);
        assert_eq!(*new, 10);
        assert_eq!(*atom.load(), 10);
    }

    #[test]
    fn test_swap_with_decision() {
        let atom = Atom::new(vec![1, 2]);
        let (new, emitted) = atom.swap_with(|buf| {
            let mut next = buf.clone();
            next.push(3);
            if next.len() >= 3 {
                (Vec::new(), Some(next))
            } else {
                (next, None)
            }
        });
        assert!(new.is_empty());
        assert_eq!(emitted, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_reset() {
        let atom = Atom::new("a".to_string());
        atom.reset("b".to_string());
        assert_eq!(*atom.load(), "b");
    }

    #[test]
    fn test_contended_swaps_lose_no_updates() {
        let atom = Arc::new(Atom::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let atom = Arc::clone(&atom);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    atom.swap(|n| n + 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*atom.load(), 8000);
    }
}
