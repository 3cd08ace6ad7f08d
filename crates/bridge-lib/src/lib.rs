//! Library for the buffered telemetry bridge
//!
//! This crate provides the core functionality for:
//! - Caching the freshest valid sensor reading with time and size bounds
//! - Delivering readings to a remote collector over an unreliable link
//! - Payload signing and optional encryption
//! - Health checks and observability

pub mod cache;
pub mod clock;
pub mod health;
pub mod models;
pub mod observability;
pub mod payload;
pub mod pipeline;
pub mod sensor;
pub mod signing;
pub mod transmit;

pub use cache::{CacheBuffer, CacheConfig, CacheSnapshot, TransmissionStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{BridgeMetrics, StructuredLogger};
pub use payload::{PayloadEncoder, PayloadFormat, WirePayload};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStatus, StatusHandle, TransmitOutcome};
pub use sensor::{ReadingSource, SensorConfig, SensorMetrics, SimulatedSensor};
pub use signing::{SigningError, SigningService};
pub use transmit::{
    DeliveryOutcome, DispatcherConfig, Link, TcpLink, TransmitDispatcher, TransmitError,
};
