// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity multi-consumer task handoff.
//!
//! The single contention point between publishers and the worker pool.
//! Publishers reserve a slot with [`RingHandoff::claim_slot`] before
//! enqueueing; a slot is released only when a worker *finishes* the task,
//! so the count of outstanding tasks (queued or running) never exceeds
//! capacity.
//!
//! # Protocol
//!
//! ```text
//! publisher: claim_slot() -> offer(task)
//!                v
//! worker:    next_task() -> run -> release_slot()
//! ```
//!
//! Shutdown closes the intake and lets workers drain every queued task
//! before [`RingHandoff::next_task`] reports end-of-stream.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::time::Duration;

use crate::sync::WakeNotifier;

/// Deferred dispatch closure produced by a publisher.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long a drained worker parks before re-checking for work.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// Bounded multi-consumer work queue with claim-slot backpressure.
pub struct RingHandoff {
    queue: ArrayQueue<Task>,
    /// Available slots; starts at capacity, never observed above it.
    slots: AtomicIsize,
    capacity: usize,
    open: AtomicBool,
    /// Wakes workers parked on an empty queue.
    task_ready: WakeNotifier,
    /// Wakes publishers parked on a full handoff.
    slot_free: WakeNotifier,
}

impl RingHandoff {
    /// Create a handoff with a fixed capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "handoff capacity must be > 0");
        Self {
            queue: ArrayQueue::new(capacity),
            slots: AtomicIsize::new(capacity as isize),
            capacity,
            open: AtomicBool::new(true),
            task_ready: WakeNotifier::new(),
            slot_free: WakeNotifier::new(),
        }
    }

    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count of queued (not yet started) tasks. Racy, for observability.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Try to reserve one slot.
    ///
    /// Decrements the slot counter only when it is positive; returns
    /// `false` (without parking) when the handoff is saturated. Callers
    /// own the retry/park policy.
    #[must_use]
    pub fn claim_slot(&self) -> bool {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                if available > 0 {
                    Some(available - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Return a slot after a task has fully executed and wake one parked
    /// publisher.
    pub fn release_slot(&self) {
        self.slots.fetch_add(1, Ordering::AcqRel);
        self.slot_free.notify();
    }

    /// Park until a slot might be available, up to `timeout`.
    pub fn wait_for_slot(&self, timeout: Duration) {
        self.slot_free.wait_timeout(timeout);
    }

    /// Enqueue a task under a previously claimed slot.
    ///
    /// Returns `false` when the handoff was shut down; the claimed slot is
    /// handed back and the task is dropped.
    pub fn offer(&self, task: Task) -> bool {
        if !self.is_open() {
            self.release_slot();
            return false;
        }
        if self.queue.push(task).is_err() {
            // Unreachable while every offer holds a claimed slot; recover
            // rather than assert in release builds.
            log::warn!("[RING] push rejected with a claimed slot; dropping task");
            self.release_slot();
            return false;
        }
        self.task_ready.notify();
        true
    }

    /// Worker-side dequeue: blocks while the handoff is open and empty.
    ///
    /// Returns `None` only after shutdown once every queued task has been
    /// handed out, so pending work always drains.
    pub fn next_task(&self) -> Option<Task> {
        loop {
            if let Some(task) = self.queue.pop() {
                return Some(task);
            }
            if !self.is_open() {
                // Lost race: a task may have been queued between the pop
                // and the open check.
                return self.queue.pop();
            }
            self.task_ready.wait_timeout(IDLE_PARK);
        }
    }

    /// Close the intake. Queued tasks remain and are drained by workers;
    /// parked threads are woken so they can observe the closed state.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        self.task_ready.notify();
        self.slot_free.notify();
    }
}

impl std::fmt::Debug for RingHandoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingHandoff")
            .field("capacity", &self.capacity)
            .field("queued", &self.queue.len())
            .field("slots", &self.slots.load(Ordering::Relaxed))
            .field("open", &self.is_open())
            .finish()
    }
}
