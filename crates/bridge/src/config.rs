//! Bridge configuration
//!
//! Read once at startup from an optional file (path in `BRIDGE_CONFIG`,
//! default `bridge.toml`) overlaid by `BRIDGE__SECTION__KEY` environment
//! variables. Every field has a default.

use anyhow::{Context, Result};
use bridge_lib::{
    CacheConfig, DeviceInfo, DispatcherConfig, PayloadEncoder, PayloadFormat, PipelineConfig,
    SensorConfig,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "bridge.toml";

/// Bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Port for health, metrics and status endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub device_id: String,
    pub firmware_version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            device_id: std::env::var("NODE_NAME").unwrap_or_else(|_| "bridge-default".to_string()),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub kind: String,
    pub read_interval_ms: u64,
    pub spike_threshold_temp: f32,
    pub spike_threshold_humidity: f32,
}

impl Default for SensorSection {
    fn default() -> Self {
        let sensor = SensorConfig::default();
        Self {
            kind: sensor.kind,
            read_interval_ms: 3000,
            spike_threshold_temp: sensor.spike_threshold_temp,
            spike_threshold_humidity: sensor.spike_threshold_humidity,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub server_url: String,
    pub transmission_interval_ms: u64,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Bound on a whole connect sequence
    pub connection_timeout_ms: u64,
    /// Link connect attempts per connect sequence
    pub retry_attempts: u32,
    pub batch_size: usize,
    pub payload_format: PayloadFormat,
    pub min_signal_quality: i32,
    /// Extra fields appended to every form payload
    pub metadata: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000/data".to_string(),
            transmission_interval_ms: 5000,
            timeout_ms: 15_000,
            connection_timeout_ms: 30_000,
            retry_attempts: 3,
            batch_size: 1,
            payload_format: PayloadFormat::Form,
            min_signal_quality: 0,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub max_size: usize,
    pub cache_duration_ms: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            max_size: 50,
            cache_duration_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Signing secret; signing is disabled when absent or empty
    pub secret_key: Option<String>,
    /// Encrypt json payloads before signing
    pub encrypt: bool,
    /// Access token sent as the `secret` form field
    pub collector_token: Option<String>,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            sensor: SensorSection::default(),
            location: LocationConfig::default(),
            network: NetworkConfig::default(),
            buffer: BufferSection::default(),
            security: SecurityConfig::default(),
            api_port: default_api_port(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the config file and process environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("BRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_with(Path::new(&path), None)
    }

    /// Load from `path`, overlaying `env` (or the process environment when `None`)
    pub fn load_with(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("BRIDGE")
                    .separator("__")
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        config
            .try_deserialize()
            .context("Failed to parse bridge configuration")
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.system.device_id.clone(),
            firmware_version: self.system.firmware_version.clone(),
            latitude: self.location.latitude,
            longitude: self.location.longitude,
            location_name: self.location.name.clone(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.buffer.max_size,
            cache_duration: Duration::from_millis(self.buffer.cache_duration_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            endpoint: self.network.server_url.clone(),
            request_timeout: Duration::from_millis(self.network.timeout_ms),
            connection_timeout: Duration::from_millis(self.network.connection_timeout_ms),
            connect_attempts: self.network.retry_attempts,
            batch_size: self.network.batch_size,
            min_signal_quality: self.network.min_signal_quality,
            ..DispatcherConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sample_interval: Duration::from_millis(self.sensor.read_interval_ms),
            transmit_interval: Duration::from_millis(self.network.transmission_interval_ms),
        }
    }

    pub fn sensor_config(&self) -> SensorConfig {
        SensorConfig {
            kind: self.sensor.kind.clone(),
            spike_threshold_temp: self.sensor.spike_threshold_temp,
            spike_threshold_humidity: self.sensor.spike_threshold_humidity,
        }
    }

    /// Payload encoder for the configured format, device and form fields
    pub fn payload_encoder(&self) -> PayloadEncoder {
        let mut encoder = PayloadEncoder::new(self.network.payload_format, self.device_info())
            .encrypt(self.security.encrypt);
        if let Some(token) = &self.security.collector_token {
            encoder = encoder.form_secret(token.clone());
        }
        for (key, value) in &self.network.metadata {
            encoder = encoder.metadata(key.clone(), value.clone());
        }
        encoder
    }

    /// Signing secret, when one is configured
    pub fn signing_secret(&self) -> Option<&[u8]> {
        self.security
            .secret_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(str::as_bytes)
    }
}
