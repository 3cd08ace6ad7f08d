//! Observability infrastructure for the telemetry bridge
//!
//! Provides:
//! - Prometheus metrics (transmit latency, cache occupancy, delivery counters, link state)
//! - Structured JSON logging with tracing

use crate::cache::TransmissionStats;
use crate::transmit::{ConnectivityState, DeliveryOutcome};
use prometheus::{register_histogram, register_int_gauge, Histogram, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<BridgeMetricsInner> = OnceLock::new();

struct BridgeMetricsInner {
    transmit_latency_seconds: Histogram,
    buffer_items: IntGauge,
    buffer_capacity: IntGauge,
    transmission_attempts: IntGauge,
    transmission_successes: IntGauge,
    transmission_failures: IntGauge,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    link_connected: IntGauge,
    signal_quality: IntGauge,
    signing_enabled: IntGauge,
}

impl BridgeMetricsInner {
    fn new() -> Self {
        Self {
            transmit_latency_seconds: register_histogram!(
                "telemetry_bridge_transmit_latency_seconds",
                "Time spent delivering a payload to the collector",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register transmit_latency_seconds"),

            buffer_items: register_int_gauge!(
                "telemetry_bridge_buffer_items",
                "Number of readings held in the cache"
            )
            .expect("Failed to register buffer_items"),

            buffer_capacity: register_int_gauge!(
                "telemetry_bridge_buffer_capacity",
                "Maximum number of readings the cache holds"
            )
            .expect("Failed to register buffer_capacity"),

            transmission_attempts: register_int_gauge!(
                "telemetry_bridge_transmission_attempts_total",
                "Total number of transmission attempts"
            )
            .expect("Failed to register transmission_attempts"),

            transmission_successes: register_int_gauge!(
                "telemetry_bridge_transmission_successes_total",
                "Total number of successful transmissions"
            )
            .expect("Failed to register transmission_successes"),

            transmission_failures: register_int_gauge!(
                "telemetry_bridge_transmission_failures_total",
                "Total number of failed transmissions"
            )
            .expect("Failed to register transmission_failures"),

            cache_hits: register_int_gauge!(
                "telemetry_bridge_cache_hits_total",
                "Sends of a reading that had already been sent"
            )
            .expect("Failed to register cache_hits"),

            cache_misses: register_int_gauge!(
                "telemetry_bridge_cache_misses_total",
                "First sends of a fresh reading"
            )
            .expect("Failed to register cache_misses"),

            link_connected: register_int_gauge!(
                "telemetry_bridge_link_connected",
                "1 when the network link is up"
            )
            .expect("Failed to register link_connected"),

            signal_quality: register_int_gauge!(
                "telemetry_bridge_signal_quality",
                "Signal quality reported by the link (0-100)"
            )
            .expect("Failed to register signal_quality"),

            signing_enabled: register_int_gauge!(
                "telemetry_bridge_signing_enabled",
                "1 when payload signing is active"
            )
            .expect("Failed to register signing_enabled"),
        }
    }
}

/// Bridge metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct BridgeMetrics {
    _private: (),
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BridgeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BridgeMetricsInner {
        GLOBAL_METRICS.get_or_init(BridgeMetricsInner::new)
    }

    pub fn observe_transmit_latency(&self, duration_secs: f64) {
        self.inner().transmit_latency_seconds.observe(duration_secs);
    }

    pub fn set_buffer(&self, items: usize, capacity: usize) {
        self.inner().buffer_items.set(items as i64);
        self.inner().buffer_capacity.set(capacity as i64);
    }

    /// Mirror the cache's delivery statistics
    pub fn set_transmission_stats(&self, stats: &TransmissionStats) {
        let inner = self.inner();
        inner.transmission_attempts.set(stats.total_attempts as i64);
        inner.transmission_successes.set(stats.successes as i64);
        inner.transmission_failures.set(stats.failures as i64);
        inner.cache_hits.set(stats.cache_hits as i64);
        inner.cache_misses.set(stats.cache_misses as i64);
    }

    pub fn set_connectivity(&self, connectivity: &ConnectivityState) {
        self.inner()
            .link_connected
            .set(i64::from(connectivity.connected));
        self.inner()
            .signal_quality
            .set(i64::from(connectivity.signal_quality));
    }

    pub fn set_signing_enabled(&self, enabled: bool) {
        self.inner().signing_enabled.set(i64::from(enabled));
    }
}

/// Structured logger for bridge events
///
/// Provides consistent JSON-formatted logging for transmissions,
/// connectivity changes and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    device_id: String,
}

impl StructuredLogger {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str, endpoint: &str) {
        info!(
            event = "bridge_started",
            device_id = %self.device_id,
            bridge_version = %version,
            endpoint = %endpoint,
            "Telemetry bridge started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "bridge_shutdown",
            device_id = %self.device_id,
            reason = %reason,
            "Telemetry bridge shutting down"
        );
    }

    /// Log the outcome of one delivery attempt
    pub fn log_transmission(&self, sequence_id: u64, age_in_sends: u32, outcome: &DeliveryOutcome) {
        let elapsed_ms = outcome.elapsed().map(|d| d.as_millis() as u64);
        if outcome.is_success() {
            info!(
                event = "transmission",
                device_id = %self.device_id,
                sequence_id = sequence_id,
                age_in_sends = age_in_sends,
                outcome = outcome.label(),
                status = ?outcome.status(),
                elapsed_ms = ?elapsed_ms,
                "Reading delivered"
            );
        } else {
            warn!(
                event = "transmission",
                device_id = %self.device_id,
                sequence_id = sequence_id,
                age_in_sends = age_in_sends,
                outcome = outcome.label(),
                status = ?outcome.status(),
                elapsed_ms = ?elapsed_ms,
                "Reading delivery failed"
            );
        }
    }

    pub fn log_connectivity_change(&self, connectivity: &ConnectivityState) {
        if connectivity.connected {
            info!(
                event = "connectivity_changed",
                device_id = %self.device_id,
                connected = true,
                signal_quality = connectivity.signal_quality,
                "Link up"
            );
        } else {
            warn!(
                event = "connectivity_changed",
                device_id = %self.device_id,
                connected = false,
                last_error = ?connectivity.last_error,
                "Link down, keeping latest reading cached"
            );
        }
    }

    pub fn log_signing_status(&self, enabled: bool, encrypt: bool) {
        if enabled {
            info!(
                event = "signing_status",
                device_id = %self.device_id,
                enabled = true,
                encrypt = encrypt,
                "Payload signing enabled"
            );
        } else {
            warn!(
                event = "signing_status",
                device_id = %self.device_id,
                enabled = false,
                "Payload signing disabled, sending unsigned payloads"
            );
        }
    }
}
