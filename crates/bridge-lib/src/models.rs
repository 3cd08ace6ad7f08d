//! Core data models for the telemetry bridge
//!
//! All timestamps are milliseconds since the UNIX epoch. The `Reading`
//! constructors are the only place where other units are converted.

use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Millisecond timestamps below this value are almost certainly seconds
/// (1e11 ms is March 1973, 1e11 s is the year 5138).
pub const MIN_PLAUSIBLE_MILLIS: u64 = 100_000_000_000;

/// One timestamped sensor sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub captured_at_ms: u64,
    pub valid: bool,
    pub sequence_id: u64,
}

impl Reading {
    /// Create a valid reading stamped with a millisecond timestamp.
    ///
    /// A zero timestamp, or one that looks like seconds, is rejected: the
    /// reading is returned with `valid = false` so the cache never admits it.
    pub fn new(temperature: f32, humidity: f32, captured_at_ms: u64, sequence_id: u64) -> Self {
        let plausible = captured_at_ms >= MIN_PLAUSIBLE_MILLIS;
        if !plausible {
            warn!(
                captured_at_ms,
                sequence_id, "Reading timestamp is not in milliseconds, marking reading invalid"
            );
        }

        Self {
            temperature,
            humidity,
            captured_at_ms,
            valid: plausible,
            sequence_id,
        }
    }

    /// Create a reading from a timestamp in seconds since the epoch
    pub fn from_unix_secs(temperature: f32, humidity: f32, secs: u64, sequence_id: u64) -> Self {
        Self::new(temperature, humidity, secs.saturating_mul(1000), sequence_id)
    }

    /// Create a reading stamped with the clock's current time
    pub fn captured_now(
        temperature: f32,
        humidity: f32,
        clock: &dyn Clock,
        sequence_id: u64,
    ) -> Self {
        Self::new(temperature, humidity, clock.now_ms(), sequence_id)
    }

    /// A reading that failed acquisition or validation
    pub fn invalid(captured_at_ms: u64, sequence_id: u64) -> Self {
        Self {
            captured_at_ms,
            sequence_id,
            ..Default::default()
        }
    }

    /// Age of the reading relative to `now_ms`; future-dated readings are age 0
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.captured_at_ms)
    }
}

/// Static device identity attached to every payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub firmware_version: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_name: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_id: "bridge-default".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            latitude: 0.0,
            longitude: 0.0,
            location_name: String::new(),
        }
    }
}
