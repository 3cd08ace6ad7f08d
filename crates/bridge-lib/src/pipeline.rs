//! Telemetry pipeline driver
//!
//! Couples the cache, the payload encoder, the signer and the dispatcher.
//! Each transmit step sends the freshest known-good reading and feeds the
//! outcome back into the cache statistics:
//!
//! `add_reading -> get_data_for_transmission -> send -> record_transmission_result`
//!
//! A failed send leaves the cached reading in place, so the next transmit
//! tick sends it again.

use crate::cache::{CacheBuffer, CacheSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::health::{components, HealthRegistry};
use crate::models::Reading;
use crate::observability::{BridgeMetrics, StructuredLogger};
use crate::payload::{BufferOccupancy, PayloadEncoder};
use crate::sensor::{ReadingSource, SensorMetrics};
use crate::signing::SigningService;
use crate::transmit::{ConnectivityState, DeliveryOutcome, NetworkMetrics, TransmitDispatcher};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Scheduling of the run loop
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often the sensor is sampled (default: 3 seconds)
    pub sample_interval: Duration,
    /// How often the cached reading is sent (default: 5 seconds)
    pub transmit_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(3000),
            transmit_interval: Duration::from_millis(5000),
        }
    }
}

/// Result of one transmit step
#[derive(Debug, Clone, PartialEq)]
pub enum TransmitOutcome {
    /// No valid reading cached yet
    NothingToSend,
    /// The payload could not be built; counted as a failed attempt
    EncodingFailed(String),
    /// A delivery was attempted (or skipped because the link is down)
    Attempted {
        reading: Reading,
        age_in_sends: u32,
        outcome: DeliveryOutcome,
    },
}

impl TransmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransmitOutcome::Attempted { outcome, .. } if outcome.is_success())
    }
}

/// Point-in-time view of the whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub device_id: String,
    /// Snapshots published so far, after both sample and transmit ticks
    pub publishes: u64,
    pub updated_at_ms: u64,
    pub cache: CacheSnapshot,
    pub connectivity: ConnectivityState,
    pub network: NetworkMetrics,
    pub signing_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorMetrics>,
}

/// Latest published status; `None` until the first tick completes
pub type StatusHandle = Arc<RwLock<Option<PipelineStatus>>>;

/// Drives readings from the cache to the collector
pub struct Pipeline {
    config: PipelineConfig,
    device_id: String,
    cache: CacheBuffer,
    dispatcher: TransmitDispatcher,
    encoder: PayloadEncoder,
    signer: SigningService,
    clock: Arc<dyn Clock>,
    health: HealthRegistry,
    status: StatusHandle,
    metrics: BridgeMetrics,
    logger: StructuredLogger,
    sensor_metrics: Option<SensorMetrics>,
    was_connected: bool,
    publishes: u64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Admit a fresh reading into the cache
    pub fn sample(&mut self, reading: Reading) {
        self.cache.add_reading(reading);
    }

    /// Send the freshest cached reading once
    pub async fn transmit(&mut self) -> TransmitOutcome {
        let reading = self.cache.get_data_for_transmission();
        if !reading.valid {
            debug!("No valid reading cached, skipping transmission");
            return TransmitOutcome::NothingToSend;
        }
        let age_in_sends = self.cache.age_in_sends();

        let occupancy = BufferOccupancy {
            occupancy: self.cache.len(),
            capacity: self.cache.capacity(),
        };
        let payload =
            match self
                .encoder
                .encode(&reading, occupancy, self.clock.now_ms(), &self.signer)
            {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, sequence_id = reading.sequence_id, "Failed to encode payload");
                    self.cache.record_transmission_result(false);
                    return TransmitOutcome::EncodingFailed(e.to_string());
                }
            };

        let outcome = if self.dispatcher.ensure_connection().await {
            self.dispatcher.send(&payload).await
        } else {
            DeliveryOutcome::NotConnected
        };

        self.cache.record_transmission_result(outcome.is_success());
        if let Some(elapsed) = outcome.elapsed() {
            self.metrics.observe_transmit_latency(elapsed.as_secs_f64());
        }
        self.logger
            .log_transmission(reading.sequence_id, age_in_sends, &outcome);

        let connected = self.dispatcher.is_connected();
        if connected != self.was_connected {
            self.logger
                .log_connectivity_change(&self.dispatcher.connectivity());
            self.was_connected = connected;
        }

        TransmitOutcome::Attempted {
            reading,
            age_in_sends,
            outcome,
        }
    }

    /// One full cycle: admit `reading`, transmit, publish status
    pub async fn tick(&mut self, reading: Reading) -> TransmitOutcome {
        self.sample(reading);
        let outcome = self.transmit().await;
        self.publish().await;
        outcome
    }

    /// Record the latest acquisition counters of the reading source
    pub fn set_sensor_metrics(&mut self, metrics: SensorMetrics) {
        self.sensor_metrics = Some(metrics);
    }

    /// Build a status snapshot from the current component state
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            device_id: self.device_id.clone(),
            publishes: self.publishes,
            updated_at_ms: self.clock.now_ms(),
            cache: self.cache.snapshot(),
            connectivity: self.dispatcher.connectivity(),
            network: self.dispatcher.metrics(),
            signing_enabled: self.signer.is_enabled(),
            sensor: self.sensor_metrics,
        }
    }

    /// Publish a completed tick: status snapshot, metrics and health
    pub async fn publish(&mut self) {
        self.publishes += 1;
        let status = self.status();

        self.metrics
            .set_buffer(status.cache.entries, status.cache.capacity);
        self.metrics.set_transmission_stats(&status.cache.stats);
        self.metrics.set_connectivity(&status.connectivity);
        self.metrics.set_signing_enabled(status.signing_enabled);

        self.update_health(&status).await;

        // Whole-snapshot swap so readers never see a partial update
        *self.status.write().await = Some(status);
    }

    async fn update_health(&self, status: &PipelineStatus) {
        if status.cache.current_sequence_id.is_some() {
            self.health.set_healthy(components::CACHE).await;
        } else {
            self.health
                .set_degraded(components::CACHE, "No valid reading cached")
                .await;
        }

        if self.dispatcher.is_healthy() {
            self.health.set_healthy(components::TRANSMITTER).await;
        } else {
            let reason = status
                .connectivity
                .last_error
                .clone()
                .unwrap_or_else(|| format!("Link {:?}", status.connectivity.state));
            self.health
                .set_degraded(components::TRANSMITTER, reason)
                .await;
        }

        if status.signing_enabled {
            self.health.set_healthy(components::SIGNING).await;
        } else {
            self.health
                .set_degraded(components::SIGNING, "Payloads are sent unsigned")
                .await;
        }

        if let Some(sensor) = &status.sensor {
            if !sensor.online {
                self.health
                    .set_unhealthy(components::SENSOR, "Sensor offline")
                    .await;
            } else if sensor.is_healthy(status.updated_at_ms) {
                self.health.set_healthy(components::SENSOR).await;
            } else {
                self.health
                    .set_degraded(components::SENSOR, "Sensor reads failing or stale")
                    .await;
            }
        }
    }

    /// Sample and transmit on their own intervals until shutdown
    pub async fn run<S: ReadingSource>(
        mut self,
        mut source: S,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            sample_interval_ms = self.config.sample_interval.as_millis() as u64,
            transmit_interval_ms = self.config.transmit_interval.as_millis() as u64,
            "Starting telemetry pipeline"
        );

        let mut sample_ticker = interval(self.config.sample_interval);
        let mut transmit_ticker = interval(self.config.transmit_interval);
        sample_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        transmit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Shutting down telemetry pipeline");
                    break;
                }
                _ = sample_ticker.tick() => {
                    let reading = source.read().await;
                    self.sample(reading);
                    self.set_sensor_metrics(source.metrics());
                    self.publish().await;
                }
                _ = transmit_ticker.tick() => {
                    self.transmit().await;
                    self.publish().await;
                }
            }
        }

        self.dispatcher.disconnect().await;
    }

    pub fn cache(&self) -> &CacheBuffer {
        &self.cache
    }

    pub fn dispatcher(&self) -> &TransmitDispatcher {
        &self.dispatcher
    }

    pub fn signer(&self) -> &SigningService {
        &self.signer
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Shared handle to the latest published status
    pub fn status_handle(&self) -> StatusHandle {
        Arc::clone(&self.status)
    }
}

/// Builder for the pipeline
pub struct PipelineBuilder {
    config: PipelineConfig,
    device_id: Option<String>,
    cache: Option<CacheBuffer>,
    dispatcher: Option<TransmitDispatcher>,
    encoder: Option<PayloadEncoder>,
    signer: SigningService,
    clock: Option<Arc<dyn Clock>>,
    health: Option<HealthRegistry>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            device_id: None,
            cache: None,
            dispatcher: None,
            encoder: None,
            signer: SigningService::new(),
            clock: None,
            health: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn cache(mut self, cache: CacheBuffer) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn dispatcher(mut self, dispatcher: TransmitDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn encoder(mut self, encoder: PayloadEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Signing service; defaults to disabled
    pub fn signer(mut self, signer: SigningService) -> Self {
        self.signer = signer;
        self
    }

    /// Clock used for payload timestamps; defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Registry to report component health into
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let cache = self
            .cache
            .ok_or_else(|| anyhow::anyhow!("Cache is required"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("Dispatcher is required"))?;
        let encoder = self
            .encoder
            .ok_or_else(|| anyhow::anyhow!("Payload encoder is required"))?;
        let device_id = self.device_id.unwrap_or_else(|| "unknown".to_string());

        Ok(Pipeline {
            config: self.config,
            logger: StructuredLogger::new(device_id.clone()),
            device_id,
            cache,
            dispatcher,
            encoder,
            signer: self.signer,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            health: self.health.unwrap_or_default(),
            status: Arc::new(RwLock::new(None)),
            metrics: BridgeMetrics::new(),
            sensor_metrics: None,
            was_connected: false,
            publishes: 0,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::models::DeviceInfo;
    use crate::payload::PayloadFormat;
    use crate::transmit::{DispatcherConfig, ManualLink};

    const NOW: u64 = 1_700_000_000_000;

    fn pipeline(endpoint: &str, link: &ManualLink, clock: &ManualClock) -> Pipeline {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let dispatcher = TransmitDispatcher::new(
            DispatcherConfig {
                endpoint: endpoint.to_string(),
                request_timeout: Duration::from_millis(500),
                connection_timeout: Duration::from_millis(200),
                connect_attempts: 1,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(link.clone()),
            Arc::clone(&clock),
        )
        .unwrap();

        Pipeline::builder()
            .device_id("node-1")
            .cache(CacheBuffer::new(CacheConfig::default(), Arc::clone(&clock)))
            .dispatcher(dispatcher)
            .encoder(PayloadEncoder::new(PayloadFormat::Json, DeviceInfo::default()))
            .clock(clock)
            .build()
            .unwrap()
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.sample_interval, Duration::from_secs(3));
        assert_eq!(config.transmit_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_requires_components() {
        assert!(Pipeline::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_nothing_to_send_before_first_reading() {
        let link = ManualLink::new(true, 80);
        let clock = ManualClock::new(NOW);
        let mut pipeline = pipeline("http://127.0.0.1:9/data", &link, &clock);

        assert_eq!(pipeline.transmit().await, TransmitOutcome::NothingToSend);
        assert_eq!(pipeline.cache().stats().total_attempts, 0);
        assert_eq!(link.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_link_down_counts_failure_and_keeps_reading() {
        let link = ManualLink::new(false, 80);
        let clock = ManualClock::new(NOW);
        let mut pipeline = pipeline("http://127.0.0.1:9/data", &link, &clock);

        let outcome = pipeline.tick(Reading::new(21.0, 50.0, NOW, 1)).await;

        match outcome {
            TransmitOutcome::Attempted { outcome, age_in_sends, .. } => {
                assert_eq!(outcome, DeliveryOutcome::NotConnected);
                assert_eq!(age_in_sends, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let stats = pipeline.cache().stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(pipeline.cache().current().map(|r| r.sequence_id), Some(1));
        assert_eq!(pipeline.dispatcher().metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_successful_delivery_publishes_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/data")
            .with_status(200)
            .create_async()
            .await;

        let link = ManualLink::new(true, 80);
        let clock = ManualClock::new(NOW);
        let mut pipeline = pipeline(&format!("{}/data", server.url()), &link, &clock);
        let handle = pipeline.status_handle();
        assert!(handle.read().await.is_none());

        let outcome = pipeline.tick(Reading::new(21.0, 50.0, NOW, 1)).await;

        assert!(outcome.is_success());
        let status = handle.read().await.clone().unwrap();
        assert_eq!(status.publishes, 1);
        assert_eq!(status.cache.stats.successes, 1);
        assert!(status.connectivity.connected);
        assert_eq!(status.network.successful_requests, 1);
        assert!(!status.signing_enabled);
    }

    #[tokio::test]
    async fn test_publishes_count_every_snapshot() {
        let link = ManualLink::new(false, 80);
        let clock = ManualClock::new(NOW);
        let mut pipeline = pipeline("http://127.0.0.1:9/data", &link, &clock);

        pipeline.sample(Reading::new(21.0, 50.0, NOW, 1));
        pipeline.publish().await;
        assert_eq!(pipeline.status().publishes, 1);

        pipeline.tick(Reading::new(21.5, 50.0, NOW, 2)).await;
        assert_eq!(pipeline.status().publishes, 2);
        assert_eq!(pipeline.cache().stats().total_attempts, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let link = ManualLink::new(false, 80);
        let clock = ManualClock::new(NOW);
        let pipeline = pipeline("http://127.0.0.1:9/data", &link, &clock);
        let handle = pipeline.status_handle();
        let sensor = crate::sensor::SimulatedSensor::new(
            Default::default(),
            Arc::new(clock.clone()),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(pipeline.run(sensor, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let status = handle.read().await.clone().unwrap();
        assert!(status.cache.current_sequence_id.is_some());
        assert!(status.sensor.is_some());
        assert_eq!(link.disconnect_calls(), 1);
    }
}
