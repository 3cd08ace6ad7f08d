//! Telemetry Bridge - buffered sensor-to-collector forwarder
//!
//! Samples a sensor, keeps the freshest valid reading cached, and forwards
//! it to a remote collector, optionally signed.

use anyhow::{Context, Result};
use bridge_lib::{
    clock::{Clock, SystemClock},
    health::HealthRegistry,
    observability::{BridgeMetrics, StructuredLogger},
    CacheBuffer, Pipeline, SigningService, SimulatedSensor, TcpLink, TransmitDispatcher,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting telemetry-bridge");

    let config = config::BridgeConfig::load()?;
    info!(
        device_id = %config.system.device_id,
        server_url = %config.network.server_url,
        payload_format = ?config.network.payload_format,
        "Bridge configured"
    );

    let logger = StructuredLogger::new(&config.system.device_id);
    let health_registry = HealthRegistry::for_pipeline().await;
    let metrics = BridgeMetrics::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // A bad key disables signing; the bridge keeps running unsigned
    let mut signer = SigningService::new();
    if let Some(secret) = config.signing_secret() {
        if let Err(e) = signer.initialize(secret) {
            warn!(error = %e, "Signing initialization failed");
        }
    }
    logger.log_signing_status(signer.is_enabled(), config.security.encrypt);

    let dispatcher_config = config.dispatcher_config();
    let link = TcpLink::for_endpoint(
        &dispatcher_config.endpoint,
        dispatcher_config.connection_timeout,
    )?;
    let dispatcher = TransmitDispatcher::new(dispatcher_config, Arc::new(link), Arc::clone(&clock))
        .context("Failed to create transmit dispatcher")?;

    let pipeline = Pipeline::builder()
        .config(config.pipeline_config())
        .device_id(config.system.device_id.clone())
        .cache(CacheBuffer::new(config.cache_config(), Arc::clone(&clock)))
        .dispatcher(dispatcher)
        .encoder(config.payload_encoder())
        .signer(signer)
        .clock(Arc::clone(&clock))
        .health(health_registry.clone())
        .build()?;

    let sensor = SimulatedSensor::new(config.sensor_config(), Arc::clone(&clock));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        pipeline.status_handle(),
    ));

    logger.log_startup(BRIDGE_VERSION, &config.network.server_url);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let pipeline_handle = tokio::spawn(pipeline.run(sensor, shutdown_rx));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => warn!(error = %e, "API server stopped"),
                Err(e) => warn!(error = %e, "API server task failed"),
                Ok(Ok(())) => {}
            }
            logger.log_shutdown("API server stopped");
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = pipeline_handle.await {
        warn!(error = %e, "Pipeline task failed");
    }
    info!("Shutting down");

    Ok(())
}
