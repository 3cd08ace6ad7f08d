//! Bounded, time-windowed reading cache
//!
//! This module keeps the readings that are considered "current":
//! - Fixed-capacity history with FIFO eviction on overflow
//! - Time-window eviction against the injected clock
//! - A single cached reading that is (re-)sent on every transmit tick
//! - Cache hit/miss and delivery-outcome statistics

use super::stats::TransmissionStats;
use crate::clock::Clock;
use crate::models::Reading;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hard upper bound on the number of cached readings
pub const MAX_BUFFER_CAPACITY: usize = 50;

/// Default cache window (5 minutes)
const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Configuration for the reading cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries (clamped to `MAX_BUFFER_CAPACITY`)
    pub max_size: usize,
    /// Entries older than this relative to now are evicted
    pub cache_duration: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: MAX_BUFFER_CAPACITY,
            cache_duration: DEFAULT_CACHE_DURATION,
        }
    }
}

/// The reading designated for transmission
#[derive(Debug, Clone, Copy)]
struct CachedCurrent {
    reading: Reading,
    age_in_sends: u32,
}

/// Reading cache owned by the pipeline driver
pub struct CacheBuffer {
    entries: VecDeque<Reading>,
    max_size: usize,
    cache_duration_ms: u64,
    current: Option<CachedCurrent>,
    stats: TransmissionStats,
    clock: Arc<dyn Clock>,
}

impl CacheBuffer {
    /// Create a cache with the given configuration and clock
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let mut max_size = config.max_size.max(1);
        if max_size > MAX_BUFFER_CAPACITY {
            warn!(
                requested = config.max_size,
                capacity = MAX_BUFFER_CAPACITY,
                "Requested cache size exceeds capacity, clamping"
            );
            max_size = MAX_BUFFER_CAPACITY;
        }

        info!(
            max_size,
            cache_duration_ms = config.cache_duration.as_millis() as u64,
            "Cache buffer initialized"
        );

        Self {
            entries: VecDeque::with_capacity(max_size),
            max_size,
            cache_duration_ms: config.cache_duration.as_millis() as u64,
            current: None,
            stats: TransmissionStats::default(),
            clock,
        }
    }

    /// Admit a reading; invalid readings are dropped without being counted
    pub fn add_reading(&mut self, reading: Reading) {
        if !reading.valid {
            debug!(sequence_id = reading.sequence_id, "Dropping invalid reading");
            return;
        }

        if self.entries.len() >= self.max_size {
            if let Some(dropped) = self.entries.pop_front() {
                debug!(
                    sequence_id = dropped.sequence_id,
                    "Cache full, dropping oldest reading"
                );
            }
        }

        self.entries.push_back(reading);
        self.current = Some(CachedCurrent {
            reading,
            age_in_sends: 0,
        });

        self.evict_expired();
    }

    /// Remove entries older than the cache window. Idempotent.
    pub fn evict_expired(&mut self) {
        let now = self.clock.now_ms();
        let window = self.cache_duration_ms;
        let before = self.entries.len();

        self.entries.retain(|r| r.age_ms(now) <= window);

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted expired readings");
        }
    }

    /// Return the reading to send now and account for its freshness.
    ///
    /// The first send of a reading counts as a cache miss, every repeat send
    /// of the same reading counts as a cache hit.
    pub fn get_data_for_transmission(&mut self) -> Reading {
        let Some(current) = self.current.as_mut() else {
            return Reading::default();
        };

        if current.reading.valid {
            current.age_in_sends += 1;
            if current.age_in_sends == 1 {
                self.stats.cache_misses += 1;
            } else {
                self.stats.cache_hits += 1;
            }
        }

        current.reading
    }

    /// Record the outcome of one delivery attempt
    pub fn record_transmission_result(&mut self, success: bool) {
        self.stats.record(success);
    }

    /// Drop all history. Statistics and the cached reading survive.
    pub fn flush(&mut self) {
        let flushed = self.entries.len();
        self.entries.clear();
        info!(flushed, "Cache flushed");
    }

    /// Reset the transmission statistics
    pub fn reset_stats(&mut self) {
        self.stats = TransmissionStats::default();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Cached readings, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter()
    }

    /// The reading designated for transmission, if any
    pub fn current(&self) -> Option<&Reading> {
        self.current.as_ref().map(|c| &c.reading)
    }

    /// How many times the current reading has been handed out for sending
    pub fn age_in_sends(&self) -> u32 {
        self.current.map(|c| c.age_in_sends).unwrap_or(0)
    }

    pub fn stats(&self) -> TransmissionStats {
        self.stats
    }

    /// Age of the oldest retained entry
    pub fn oldest_entry_age_ms(&self) -> Option<u64> {
        let now = self.clock.now_ms();
        self.entries.front().map(|r| r.age_ms(now))
    }

    /// Consistent point-in-time view of the cache
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: self.entries.len(),
            capacity: self.max_size,
            cache_duration_ms: self.cache_duration_ms,
            oldest_entry_age_ms: self.oldest_entry_age_ms(),
            current_sequence_id: self.current.map(|c| c.reading.sequence_id),
            age_in_sends: self.age_in_sends(),
            stats: self.stats,
            success_rate: self.stats.success_rate(),
        }
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Number of entries in the cache
    pub entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    pub cache_duration_ms: u64,
    pub oldest_entry_age_ms: Option<u64>,
    /// Sequence id of the reading designated for transmission
    pub current_sequence_id: Option<u64>,
    pub age_in_sends: u32,
    pub stats: TransmissionStats,
    /// Percentage of successful attempts
    pub success_rate: f64,
}
