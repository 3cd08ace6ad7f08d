//! Sensor acquisition
//!
//! A `ReadingSource` yields one `Reading` per call. Raw samples are range
//! checked here; anything out of range comes back as an invalid reading and
//! is dropped later by the cache.

use crate::clock::Clock;
use crate::models::Reading;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Temperature range of DHT-class sensors, in °C
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = -40.0..=80.0;

/// Relative humidity range, in percent
pub const HUMIDITY_RANGE: std::ops::RangeInclusive<f32> = 0.0..=100.0;

/// Failed reads past which the sensor is reported offline
const OFFLINE_AFTER_FAILURES: u64 = 10;

/// A successful read older than this marks the sensor unhealthy
const STALE_READ_MS: u64 = 30_000;

/// Source of sensor readings
#[async_trait]
pub trait ReadingSource: Send {
    /// Take one sample. Failed or out-of-range samples are returned invalid.
    async fn read(&mut self) -> Reading;

    /// Acquisition counters
    fn metrics(&self) -> SensorMetrics;
}

/// Check a raw sample against the physical sensor range
pub fn validate(temperature: f32, humidity: f32) -> bool {
    TEMPERATURE_RANGE.contains(&temperature) && HUMIDITY_RANGE.contains(&humidity)
}

/// Sensor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Sensor model label, e.g. "DHT22"
    pub kind: String,
    /// Temperature jump between consecutive valid samples reported as a spike
    pub spike_threshold_temp: f32,
    /// Humidity jump between consecutive valid samples reported as a spike
    pub spike_threshold_humidity: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: "DHT22".to_string(),
            spike_threshold_temp: 5.0,
            spike_threshold_humidity: 10.0,
        }
    }
}

/// Acquisition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorMetrics {
    pub total_readings: u64,
    pub failed_readings: u64,
    pub spikes_detected: u64,
    /// 0 = never
    pub last_successful_read_ms: u64,
    pub online: bool,
}

impl SensorMetrics {
    /// Online, read recently, and failing less than half the time
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        if !self.online || self.total_readings == 0 {
            return false;
        }
        let failure_rate = self.failed_readings as f64 / self.total_readings as f64;
        now_ms.saturating_sub(self.last_successful_read_ms) < STALE_READ_MS && failure_rate < 0.5
    }
}

/// DHT-like sensor producing a slow deterministic drift.
///
/// Queued samples, when present, are returned before the drift model; tests
/// and replays use them to inject exact values.
pub struct SimulatedSensor {
    config: SensorConfig,
    clock: Arc<dyn Clock>,
    next_sequence_id: u64,
    step: u64,
    queued: VecDeque<(f32, f32)>,
    last_valid: Option<Reading>,
    metrics: SensorMetrics,
}

impl SimulatedSensor {
    pub fn new(config: SensorConfig, clock: Arc<dyn Clock>) -> Self {
        debug!(kind = %config.kind, "Simulated sensor initialized");
        Self {
            config,
            clock,
            next_sequence_id: 1,
            step: 0,
            queued: VecDeque::new(),
            last_valid: None,
            metrics: SensorMetrics::default(),
        }
    }

    /// Queue a raw sample for the next read
    pub fn push_sample(&mut self, temperature: f32, humidity: f32) {
        self.queued.push_back((temperature, humidity));
    }

    fn drift(&mut self) -> (f32, f32) {
        let phase = self.step as f32 * 0.05;
        self.step += 1;
        (22.0 + 3.0 * phase.sin(), 55.0 + 10.0 * phase.cos())
    }

    fn is_spike(&self, temperature: f32, humidity: f32) -> bool {
        match &self.last_valid {
            Some(last) => {
                (temperature - last.temperature).abs() > self.config.spike_threshold_temp
                    || (humidity - last.humidity).abs() > self.config.spike_threshold_humidity
            }
            None => false,
        }
    }
}

#[async_trait]
impl ReadingSource for SimulatedSensor {
    async fn read(&mut self) -> Reading {
        let (temperature, humidity) = match self.queued.pop_front() {
            Some(sample) => sample,
            None => self.drift(),
        };
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        self.metrics.total_readings += 1;

        if !validate(temperature, humidity) {
            self.metrics.failed_readings += 1;
            if self.metrics.failed_readings > OFFLINE_AFTER_FAILURES {
                self.metrics.online = false;
            }
            warn!(temperature, humidity, sequence_id, "Sensor sample out of range");
            return Reading::invalid(self.clock.now_ms(), sequence_id);
        }

        if self.is_spike(temperature, humidity) {
            self.metrics.spikes_detected += 1;
            warn!(temperature, humidity, sequence_id, "Spike detected");
        }

        let reading = Reading::captured_now(temperature, humidity, self.clock.as_ref(), sequence_id);
        self.metrics.last_successful_read_ms = reading.captured_at_ms;
        self.metrics.online = true;
        self.last_valid = Some(reading);

        reading
    }

    fn metrics(&self) -> SensorMetrics {
        self.metrics
    }
}
