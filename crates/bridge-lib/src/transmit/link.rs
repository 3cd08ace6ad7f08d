//! Network link abstraction
//!
//! The dispatcher never talks to the network stack directly to bring a link
//! up; it goes through a `Link`, which reports a signal quality on success.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// A network link that can be brought up and torn down
#[async_trait]
pub trait Link: Send + Sync {
    /// Bring the link up and return its signal quality (0-100)
    async fn connect(&self) -> Result<i32>;

    /// Tear the link down
    async fn disconnect(&self);
}

/// Link check that opens a TCP connection to the collector host.
///
/// Signal quality is derived from the connect latency: 100 for an instant
/// connect, falling by one point per 10 ms.
pub struct TcpLink {
    host: String,
    port: u16,
    probe_timeout: Duration,
}

impl TcpLink {
    pub fn new(host: impl Into<String>, port: u16, probe_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            probe_timeout,
        }
    }

    /// Build a probe for the host and port of an endpoint URL
    pub fn for_endpoint(endpoint: &str, probe_timeout: Duration) -> Result<Self> {
        let url =
            Url::parse(endpoint).with_context(|| format!("Invalid endpoint URL: {}", endpoint))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("No host in endpoint URL"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("No port for endpoint URL"))?;

        Ok(Self::new(host, port, probe_timeout))
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn connect(&self) -> Result<i32> {
        let start = Instant::now();
        let stream = tokio::time::timeout(
            self.probe_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("TCP probe timed out"))?
        .with_context(|| format!("Failed to reach {}:{}", self.host, self.port))?;
        drop(stream);

        let latency_ms = start.elapsed().as_millis() as i32;
        let quality = (100 - latency_ms / 10).clamp(0, 100);
        debug!(host = %self.host, port = self.port, latency_ms, quality, "Link probe succeeded");

        Ok(quality)
    }

    async fn disconnect(&self) {}
}

/// Link whose availability and quality are set by hand.
/// Clones share state.
#[derive(Clone)]
pub struct ManualLink {
    up: Arc<AtomicBool>,
    quality: Arc<AtomicI32>,
    connect_calls: Arc<AtomicU32>,
    disconnect_calls: Arc<AtomicU32>,
}

impl ManualLink {
    pub fn new(up: bool, quality: i32) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
            quality: Arc::new(AtomicI32::new(quality)),
            connect_calls: Arc::new(AtomicU32::new(0)),
            disconnect_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn set_quality(&self, quality: i32) {
        self.quality.store(quality, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for ManualLink {
    async fn connect(&self) -> Result<i32> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(self.quality.load(Ordering::SeqCst))
        } else {
            Err(anyhow::anyhow!("link down"))
        }
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }
}
