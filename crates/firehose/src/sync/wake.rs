// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake notification with atomic fast-path.
//!
//! Parks workers waiting for tasks and publishers waiting for ring slots.
//!
//! # Architecture
//! - Atomic flag for lock-free fast-path (hot traffic)
//! - Condvar fallback for idle wake (sporadic traffic)
//!
//! Unlike a bare condvar, a notification that arrives while no thread is
//! parked is not lost: the flag stays set and the next waiter returns
//! immediately.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Two-tier wake notification.
///
/// 1. Atomic flag checked lock-free by spinning callers
/// 2. Condvar for blocking waits when idle
///
/// Several threads may park on the same notifier; `notify()` wakes all of
/// them so each can re-check its own wake condition (task available, slot
/// free, shutdown requested).
#[derive(Debug)]
pub struct WakeNotifier {
    /// Atomic flag for lock-free fast-path
    signal: AtomicBool,
    /// Count of parked threads, guarded for the condvar
    sleepers: Mutex<usize>,
    /// Condvar for efficient waiting when idle
    condvar: Condvar,
}

impl WakeNotifier {
    #[inline]
    pub fn new() -> Self {
        Self {
            signal: AtomicBool::new(false),
            sleepers: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Signal that the wake condition may have changed.
    ///
    /// Fast-path is a single atomic store; the condvar is only touched
    /// when a thread might actually be parked. The sleeper check is racy
    /// but safe, the worst case is an extra broadcast.
    #[inline]
    pub fn notify(&self) {
        self.signal.store(true, Ordering::Release);

        if *self.sleepers.lock() > 0 {
            self.condvar.notify_all();
        }
    }

    /// Consume a pending signal without blocking.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.signal.swap(false, Ordering::Acquire)
    }

    /// Park until notified or the timeout elapses.
    ///
    /// Returns `true` when a notification was consumed, `false` on timeout.
    /// Returns immediately when a signal is already pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.signal.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleepers = self.sleepers.lock();

        // Double-check after acquiring the lock: a notify() may have won
        // the race between the fast-path check and the lock.
        if self.signal.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleepers += 1;
        let _ = self.condvar.wait_for(&mut sleepers, timeout);
        *sleepers -= 1;
        drop(sleepers);

        // Consumed signal counts as a wake even when the condvar timed out
        // in the same instant; the signal must never be lost.
        self.signal.swap(false, Ordering::Acquire)
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
