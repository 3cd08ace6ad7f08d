//! Cache freshness and delivery-outcome counters

use serde::{Deserialize, Serialize};

/// Monotonic transmission counters kept by the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionStats {
    /// Number of recorded transmission results
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Re-sends of a reading that was already sent at least once
    pub cache_hits: u64,
    /// First sends of a distinct reading
    pub cache_misses: u64,
}

impl TransmissionStats {
    /// Percentage of successful attempts (0.0 when nothing was attempted)
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total_attempts as f64 * 100.0
    }

    pub(crate) fn record(&mut self, success: bool) {
        self.total_attempts += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }
}
