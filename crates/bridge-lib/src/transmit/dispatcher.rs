//! HTTP delivery to the collector with link lifecycle management
//!
//! This module provides the transmit dispatcher that:
//! - Brings the link up on demand with a bounded connect sequence
//! - Delivers one payload per call, never retrying internally
//! - Separates application errors (non-2xx) from link loss
//! - Tracks request counters and a rolling average response time

use super::link::Link;
use crate::clock::Clock;
use crate::payload::WirePayload;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Errors raised while setting up the dispatcher
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("invalid endpoint URL {endpoint}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Configuration for the transmit dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Collector endpoint URL
    pub endpoint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Upper bound for a whole connect sequence
    pub connection_timeout: Duration,
    /// Link connect attempts per connect sequence
    pub connect_attempts: u32,
    /// Delay between connect attempts
    pub poll_interval: Duration,
    /// Readings per request advertised to the collector
    pub batch_size: usize,
    /// Signal quality must be above this for the link to count as healthy
    pub min_signal_quality: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/data".to_string(),
            request_timeout: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(30),
            connect_attempts: 3,
            poll_interval: Duration::from_millis(500),
            batch_size: 1,
            min_signal_quality: 0,
        }
    }
}

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub connected: bool,
    pub state: LinkState,
    /// Last successful connect, milliseconds since the UNIX epoch (0 = never)
    pub last_connected_at_ms: u64,
    pub signal_quality: i32,
    pub avg_response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Request counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
    /// Raw status of the most recent response
    pub last_status: Option<u16>,
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx response
    Delivered { status: u16, elapsed: Duration },
    /// Non-2xx response; the link stays up
    Rejected { status: u16, elapsed: Duration },
    /// No response within the request timeout; the link stays up
    TimedOut { elapsed: Duration },
    /// Transport failure; the link is marked down
    LinkLost { error: String, elapsed: Duration },
    /// Send attempted while disconnected; no request issued
    NotConnected,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    /// HTTP status, when a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryOutcome::Delivered { status, .. } | DeliveryOutcome::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Time spent on the request, when one was issued
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            DeliveryOutcome::Delivered { elapsed, .. }
            | DeliveryOutcome::Rejected { elapsed, .. }
            | DeliveryOutcome::TimedOut { elapsed }
            | DeliveryOutcome::LinkLost { elapsed, .. } => Some(*elapsed),
            DeliveryOutcome::NotConnected => None,
        }
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Rejected { .. } => "rejected",
            DeliveryOutcome::TimedOut { .. } => "timed_out",
            DeliveryOutcome::LinkLost { .. } => "link_lost",
            DeliveryOutcome::NotConnected => "not_connected",
        }
    }
}

/// Delivers payloads to the collector and owns the link state
pub struct TransmitDispatcher {
    config: DispatcherConfig,
    endpoint: Url,
    client: Client,
    link: Arc<dyn Link>,
    clock: Arc<dyn Clock>,
    state: LinkState,
    last_connected_at_ms: u64,
    signal_quality: i32,
    last_error: Option<String>,
    metrics: NetworkMetrics,
}

impl TransmitDispatcher {
    /// Create a dispatcher. Performs no network I/O.
    pub fn new(
        config: DispatcherConfig,
        link: Arc<dyn Link>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransmitError> {
        let endpoint =
            Url::parse(&config.endpoint).map_err(|source| TransmitError::InvalidEndpoint {
                endpoint: config.endpoint.clone(),
                source,
            })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TransmitError::UnsupportedScheme(endpoint.scheme().to_string()));
        }

        let client = Client::builder().timeout(config.request_timeout).build()?;

        info!(
            endpoint = %endpoint,
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            connection_timeout_ms = config.connection_timeout.as_millis() as u64,
            batch_size = config.batch_size,
            "Transmit dispatcher initialized"
        );

        Ok(Self {
            config,
            endpoint,
            client,
            link,
            clock,
            state: LinkState::Disconnected,
            last_connected_at_ms: 0,
            signal_quality: 0,
            last_error: None,
            metrics: NetworkMetrics::default(),
        })
    }

    /// Bring the link up if needed. Blocks for at most `connection_timeout`.
    pub async fn ensure_connection(&mut self) -> bool {
        if self.state == LinkState::Connected {
            return true;
        }

        self.state = LinkState::Connecting;
        debug!(endpoint = %self.endpoint, "Connecting link");

        let link = Arc::clone(&self.link);
        let attempts = self.config.connect_attempts.max(1);
        let poll_interval = self.config.poll_interval;

        let sequence = async move {
            let mut last_error = None;
            for attempt in 1..=attempts {
                match link.connect().await {
                    Ok(quality) => return Ok(quality),
                    Err(e) => {
                        debug!(attempt, error = %e, "Link connect attempt failed");
                        last_error = Some(e);
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no connect attempt made")))
        };

        match tokio::time::timeout(self.config.connection_timeout, sequence).await {
            Ok(Ok(quality)) => {
                self.state = LinkState::Connected;
                self.signal_quality = quality;
                self.last_connected_at_ms = self.clock.now_ms();
                self.last_error = None;
                info!(signal_quality = quality, "Link connected");
                true
            }
            Ok(Err(e)) => {
                self.mark_disconnected(e.to_string());
                false
            }
            Err(_) => {
                self.mark_disconnected(format!(
                    "connect timed out after {} ms",
                    self.config.connection_timeout.as_millis()
                ));
                false
            }
        }
    }

    /// Tear the link down and bring it up again. Never fatal.
    pub async fn reconnect(&mut self) -> bool {
        info!("Forcing link reconnection");
        self.disconnect().await;
        self.ensure_connection().await
    }

    /// Tear the link down
    pub async fn disconnect(&mut self) {
        self.link.disconnect().await;
        self.state = LinkState::Disconnected;
    }

    /// Deliver one payload. No internal retry.
    pub async fn send(&mut self, payload: &WirePayload) -> DeliveryOutcome {
        if self.state != LinkState::Connected {
            warn!("Send skipped, link not connected");
            return DeliveryOutcome::NotConnected;
        }

        let start = Instant::now();
        let result = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, payload.content_type)
            .body(payload.body.clone())
            .send()
            .await;
        let elapsed = start.elapsed();

        let outcome = match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    DeliveryOutcome::Delivered {
                        status: status.as_u16(),
                        elapsed,
                    }
                } else {
                    DeliveryOutcome::Rejected {
                        status: status.as_u16(),
                        elapsed,
                    }
                }
            }
            Err(e) if e.is_timeout() => DeliveryOutcome::TimedOut { elapsed },
            Err(e) => {
                let error = e.to_string();
                self.mark_disconnected(error.clone());
                DeliveryOutcome::LinkLost { error, elapsed }
            }
        };

        self.record_request(&outcome, elapsed);
        outcome
    }

    fn record_request(&mut self, outcome: &DeliveryOutcome, elapsed: Duration) {
        let m = &mut self.metrics;
        m.total_requests += 1;
        if outcome.is_success() {
            m.successful_requests += 1;
        } else {
            m.failed_requests += 1;
        }
        if let Some(status) = outcome.status() {
            m.last_status = Some(status);
        }

        let n = m.total_requests as f64;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        m.avg_response_time_ms = (m.avg_response_time_ms * (n - 1.0) + elapsed_ms) / n;

        match outcome {
            DeliveryOutcome::Delivered { status, .. } => {
                debug!(status, elapsed_ms, "Payload delivered");
            }
            DeliveryOutcome::Rejected { status, .. } => {
                warn!(status, elapsed_ms, "Collector rejected payload");
            }
            DeliveryOutcome::TimedOut { .. } => {
                warn!(elapsed_ms, "Request timed out");
            }
            DeliveryOutcome::LinkLost { error, .. } => {
                warn!(error = %error, "Link lost during send");
            }
            DeliveryOutcome::NotConnected => {}
        }
    }

    fn mark_disconnected(&mut self, error: String) {
        warn!(error = %error, "Link disconnected");
        self.state = LinkState::Disconnected;
        self.last_error = Some(error);
    }

    /// Connected, not failing every request, and with usable signal
    pub fn is_healthy(&self) -> bool {
        self.state == LinkState::Connected
            && (self.metrics.total_requests == 0 || self.metrics.successful_requests > 0)
            && self.signal_quality > self.config.min_signal_quality
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn connectivity(&self) -> ConnectivityState {
        ConnectivityState {
            connected: self.is_connected(),
            state: self.state,
            last_connected_at_ms: self.last_connected_at_ms,
            signal_quality: self.signal_quality,
            avg_response_time_ms: self.metrics.avg_response_time_ms.round() as u64,
            last_error: self.last_error.clone(),
        }
    }

    pub fn metrics(&self) -> NetworkMetrics {
        self.metrics.clone()
    }
}
