// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration - single source of truth
//!
//! This module centralizes every tunable of the dispatch engine.
//! **NEVER hardcode these values elsewhere!**
//!
//! # Levels
//!
//! - **Level 1 (Static)**: Compile-time defaults below
//! - **Level 2 (Dynamic)**: [`FirehoseConfig`] built in code or from
//!   `FIREHOSE_*` environment variables
//!
//! # Example
//!
//! ```
//! use firehose::config::FirehoseConfig;
//! use std::time::Duration;
//!
//! let config = FirehoseConfig::new()
//!     .pool_size(2)
//!     .ring_capacity(1024)
//!     .wheel_tick(Duration::from_millis(5));
//! assert_eq!(config.pool_size, 2);
//! ```

use std::time::Duration;

/// Number of worker threads draining the ring handoff.
///
/// Override with `FIREHOSE_POOL_SIZE`.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Capacity of the ring handoff (maximum outstanding dispatch tasks).
///
/// Publishers block on the backpressure gate once this many tasks are
/// in flight. Override with `FIREHOSE_RING_CAPACITY`.
pub const DEFAULT_RING_CAPACITY: usize = 65536;

/// Resolution of the timing wheel.
///
/// Timer firings are quantized to this tick. Override with
/// `FIREHOSE_WHEEL_TICK_MS`.
pub const DEFAULT_WHEEL_TICK: Duration = Duration::from_millis(10);

/// Number of buckets in the timing wheel.
///
/// Override with `FIREHOSE_WHEEL_SLOTS`.
pub const DEFAULT_WHEEL_SLOTS: usize = 512;

/// Runtime configuration for a [`Firehose`](crate::Firehose) instance.
///
/// All fields have working defaults; construction never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseConfig {
    /// Worker threads draining the ring handoff.
    pub pool_size: usize,
    /// Ring handoff capacity (power of two recommended).
    pub ring_capacity: usize,
    /// Timing wheel tick.
    pub wheel_tick: Duration,
    /// Timing wheel bucket count.
    pub wheel_slots: usize,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            wheel_tick: DEFAULT_WHEEL_TICK,
            wheel_slots: DEFAULT_WHEEL_SLOTS,
        }
    }
}

impl FirehoseConfig {
    /// Create a configuration with compile-time defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration, applying `FIREHOSE_*` environment overrides.
    ///
    /// Unparseable or missing variables fall back to the defaults; a bad
    /// value is logged and ignored rather than failing startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = read_env_usize("FIREHOSE_POOL_SIZE") {
            config.pool_size = n.max(1);
        }
        if let Some(n) = read_env_usize("FIREHOSE_RING_CAPACITY") {
            config.ring_capacity = n.max(2);
        }
        if let Some(ms) = read_env_usize("FIREHOSE_WHEEL_TICK_MS") {
            config.wheel_tick = Duration::from_millis(ms.max(1) as u64);
        }
        if let Some(n) = read_env_usize("FIREHOSE_WHEEL_SLOTS") {
            config.wheel_slots = n.max(2);
        }
        config
    }

    /// Set the worker pool size (minimum 1).
    #[must_use]
    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n.max(1);
        self
    }

    /// Set the ring handoff capacity (minimum 2).
    #[must_use]
    pub fn ring_capacity(mut self, n: usize) -> Self {
        self.ring_capacity = n.max(2);
        self
    }

    /// Set the timing wheel tick.
    #[must_use]
    pub fn wheel_tick(mut self, tick: Duration) -> Self {
        self.wheel_tick = tick;
        self
    }

    /// Set the timing wheel bucket count (minimum 2).
    #[must_use]
    pub fn wheel_slots(mut self, n: usize) -> Self {
        self.wheel_slots = n.max(2);
        self
    }
}

fn read_env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("[CONFIG] ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FirehoseConfig::new();
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.ring_capacity, DEFAULT_RING_CAPACITY);
        assert_eq!(config.wheel_tick, DEFAULT_WHEEL_TICK);
        assert_eq!(config.wheel_slots, DEFAULT_WHEEL_SLOTS);
    }

    #[test]
    fn test_builder_clamps_minimums() {
        let config = FirehoseConfig::new().pool_size(0).ring_capacity(0).wheel_slots(0);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.ring_capacity, 2);
        assert_eq!(config.wheel_slots, 2);
    }
}
