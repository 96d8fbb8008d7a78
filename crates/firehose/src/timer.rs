// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hashed timing wheel for one-shot deferred callbacks.
//!
//! Drives the time-based pipeline operators (debounce, throttle). The
//! wheel runs on its own dedicated thread; callbacks fire there and must
//! stay short and non-blocking. Heavy work belongs back on the dispatcher
//! via `notify`.
//!
//! # Architecture
//!
//! ```text
//! submit(delay, cb) -> bucket[(cursor + ticks) % slots], rounds = ticks / slots
//!        v
//! wheel thread: every tick, drain bucket at cursor
//!        rounds > 0 -> decrement, keep
//!        rounds == 0 -> fire (panic-isolated)
//! ```
//!
//! Resolution is the tick (default 10 ms); a firing happens at least
//! `delay` after submission, quantized up to the next tick boundary.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::{DispatchError, ErrorHandler};

/// One-shot wheel callback.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    /// Taken exactly once, by firing or by cancellation.
    callback: Mutex<Option<TimerCallback>>,
    /// Full wheel revolutions left before this entry may fire.
    rounds: AtomicU64,
    cancelled: AtomicBool,
}

impl TimerEntry {
    fn take_callback(&self) -> Option<TimerCallback> {
        self.callback.lock().take()
    }
}

/// Cancellable handle for a pending firing.
///
/// Cancel is idempotent and safe from any thread; the expiration fires at
/// most once.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
}

impl TimerHandle {
    /// Prevent the pending firing. No-op when already fired or cancelled.
    pub fn cancel(&self) {
        if !self.entry.cancelled.swap(true, Ordering::AcqRel) {
            // Drop the callback now so captured state is released early.
            drop(self.entry.take_callback());
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Hashed timing wheel with a dedicated driver thread.
pub struct TimingWheel {
    buckets: Arc<Vec<Mutex<Vec<Arc<TimerEntry>>>>>,
    tick: Duration,
    cursor: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimingWheel {
    /// Start the wheel thread.
    ///
    /// `error_handler` receives callback panics as
    /// [`DispatchError::TimerFailure`].
    pub fn start(tick: Duration, slots: usize, error_handler: ErrorHandler) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let slots = slots.max(2);
        let buckets: Arc<Vec<Mutex<Vec<Arc<TimerEntry>>>>> =
            Arc::new((0..slots).map(|_| Mutex::new(Vec::new())).collect());
        let cursor = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let driver = {
            let buckets = Arc::clone(&buckets);
            let cursor = Arc::clone(&cursor);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("firehose-timer".to_string())
                .spawn(move || {
                    drive_wheel(&buckets, &cursor, &stop, tick, &error_handler);
                })
                .expect("failed to spawn timing wheel thread")
        };

        log::debug!(
            "[WHEEL] started tick={:?} slots={}",
            tick,
            buckets.len()
        );

        Self {
            buckets,
            tick,
            cursor,
            stop,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Schedule `callback` to fire once after at least `delay`.
    pub fn submit<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let slots = self.buckets.len() as u64;
        // One extra tick so a submission landing mid-tick never fires early.
        let ticks = delay.as_nanos().div_ceil(self.tick.as_nanos()).max(1) as u64 + 1;
        let cursor = self.cursor.load(Ordering::Acquire) as u64;
        let bucket = ((cursor + ticks) % slots) as usize;
        let rounds = (ticks - 1) / slots;

        let entry = Arc::new(TimerEntry {
            callback: Mutex::new(Some(Box::new(callback))),
            rounds: AtomicU64::new(rounds),
            cancelled: AtomicBool::new(false),
        });
        self.buckets[bucket].lock().push(Arc::clone(&entry));

        TimerHandle { entry }
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Stop the driver thread. Pending entries are discarded.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("tick", &self.tick)
            .field("slots", &self.buckets.len())
            .finish()
    }
}

fn drive_wheel(
    buckets: &[Mutex<Vec<Arc<TimerEntry>>>],
    cursor: &AtomicUsize,
    stop: &AtomicBool,
    tick: Duration,
    error_handler: &ErrorHandler,
) {
    let mut next_deadline = Instant::now() + tick;
    let mut tick_number: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        tick_number += 1;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        }
        next_deadline += tick;

        let slot = (tick_number % buckets.len() as u64) as usize;
        cursor.store(slot, Ordering::Release);

        let due = {
            let mut bucket = buckets[slot].lock();
            let mut due = Vec::new();
            bucket.retain(|entry| {
                if entry.cancelled.load(Ordering::Acquire) {
                    return false;
                }
                if entry.rounds.load(Ordering::Acquire) > 0 {
                    entry.rounds.fetch_sub(1, Ordering::AcqRel);
                    return true;
                }
                due.push(Arc::clone(entry));
                false
            });
            due
        };

        for entry in due {
            let Some(callback) = entry.take_callback() else {
                continue;
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
                error_handler(&DispatchError::TimerFailure {
                    detail: panic_detail(&panic),
                });
            }
        }
    }
}

pub(crate) fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
