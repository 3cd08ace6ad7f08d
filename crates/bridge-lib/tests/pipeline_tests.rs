//! End-to-end tests for the telemetry pipeline against a mock collector

use bridge_lib::cache::CacheConfig;
use bridge_lib::clock::{Clock, ManualClock};
use bridge_lib::health::{components, ComponentStatus, HealthRegistry};
use bridge_lib::payload::{PayloadEncoder, PayloadFormat};
use bridge_lib::pipeline::{Pipeline, TransmitOutcome};
use bridge_lib::signing::{SignedEnvelope, SigningService};
use bridge_lib::transmit::{DeliveryOutcome, DispatcherConfig, LinkState, ManualLink};
use bridge_lib::{CacheBuffer, DeviceInfo, Reading, TransmitDispatcher};
use mockito::Matcher;
use std::sync::Arc;
use std::time::Duration;

const NOW: u64 = 1_700_000_000_000;
const KEY: &[u8] = b"bridge-test-secret-0001";

struct Harness {
    pipeline: Pipeline,
    clock: ManualClock,
    link: ManualLink,
    health: HealthRegistry,
}

async fn harness(endpoint: &str, format: PayloadFormat, signer: SigningService) -> Harness {
    let clock = ManualClock::new(NOW);
    let link = ManualLink::new(true, 75);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let health = HealthRegistry::for_pipeline().await;

    let dispatcher = TransmitDispatcher::new(
        DispatcherConfig {
            endpoint: endpoint.to_string(),
            request_timeout: Duration::from_secs(2),
            connection_timeout: Duration::from_millis(500),
            connect_attempts: 2,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
        Arc::new(link.clone()),
        Arc::clone(&shared_clock),
    )
    .unwrap();

    let device = DeviceInfo {
        device_id: "greenhouse-7".to_string(),
        firmware_version: "2.0.0".to_string(),
        latitude: 52.1,
        longitude: 4.3,
        location_name: "north bay".to_string(),
    };

    let pipeline = Pipeline::builder()
        .device_id("greenhouse-7")
        .cache(CacheBuffer::new(
            CacheConfig {
                max_size: 5,
                cache_duration: Duration::from_secs(60),
            },
            Arc::clone(&shared_clock),
        ))
        .dispatcher(dispatcher)
        .encoder(PayloadEncoder::new(format, device).form_secret("collector-token"))
        .signer(signer)
        .clock(shared_clock)
        .health(health.clone())
        .build()
        .unwrap();

    Harness {
        pipeline,
        clock,
        link,
        health,
    }
}

fn closed_port_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/data", port)
}

#[tokio::test]
async fn test_fresh_then_cached_sends() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/data")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("device_id".into(), "greenhouse-7".into()),
            Matcher::UrlEncoded("secret".into(), "collector-token".into()),
            Matcher::UrlEncoded("sequence_id".into(), "1".into()),
        ]))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let mut h = harness(
        &format!("{}/data", server.url()),
        PayloadFormat::Form,
        SigningService::new(),
    )
    .await;

    let first = h.pipeline.tick(Reading::new(21.0, 48.0, NOW, 1)).await;
    let second = h.pipeline.transmit().await;

    mock.assert_async().await;
    assert!(first.is_success());
    assert!(matches!(second, TransmitOutcome::Attempted { age_in_sends: 2, .. }));

    let stats = h.pipeline.cache().stats();
    assert_eq!(stats.total_attempts, 2);
    assert_eq!(stats.successes, 2);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn test_rejected_send_is_retried_next_tick() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("POST", "/data")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let mut h = harness(
        &format!("{}/data", server.url()),
        PayloadFormat::Json,
        SigningService::new(),
    )
    .await;

    let outcome = h.pipeline.tick(Reading::new(19.5, 60.0, NOW, 1)).await;
    failing.assert_async().await;
    failing.remove_async().await;

    match outcome {
        TransmitOutcome::Attempted { outcome, .. } => {
            assert_eq!(outcome.status(), Some(503));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(h.pipeline.dispatcher().is_connected());

    let recovered = server
        .mock("POST", "/data")
        .match_body(Matcher::PartialJsonString(r#"{"sequence_id":1}"#.to_string()))
        .with_status(200)
        .create_async()
        .await;

    let outcome = h.pipeline.transmit().await;

    recovered.assert_async().await;
    assert!(outcome.is_success());
    let stats = h.pipeline.cache().stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.success_rate(), 50.0);
}

#[tokio::test]
async fn test_link_loss_keeps_reading_and_reconnects() {
    let mut h = harness(
        &closed_port_endpoint(),
        PayloadFormat::Form,
        SigningService::new(),
    )
    .await;

    let outcome = h.pipeline.tick(Reading::new(22.0, 40.0, NOW, 1)).await;

    assert!(matches!(
        outcome,
        TransmitOutcome::Attempted {
            outcome: DeliveryOutcome::LinkLost { .. },
            ..
        }
    ));
    assert_eq!(h.pipeline.dispatcher().state(), LinkState::Disconnected);
    assert_eq!(h.pipeline.cache().current().map(|r| r.sequence_id), Some(1));
    assert_eq!(
        h.health.status_of(components::TRANSMITTER).await,
        Some(ComponentStatus::Degraded)
    );

    // Next tick brings the link up again before sending
    h.pipeline.transmit().await;

    assert_eq!(h.link.connect_calls(), 2);
    let stats = h.pipeline.cache().stats();
    assert_eq!(stats.failures, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(h.pipeline.cache().age_in_sends(), 2);
}

#[tokio::test]
async fn test_link_down_skips_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/data")
        .expect(0)
        .create_async()
        .await;

    let mut h = harness(
        &format!("{}/data", server.url()),
        PayloadFormat::Form,
        SigningService::new(),
    )
    .await;
    h.link.set_up(false);

    let outcome = h.pipeline.tick(Reading::new(22.0, 40.0, NOW, 1)).await;

    mock.assert_async().await;
    assert!(matches!(
        outcome,
        TransmitOutcome::Attempted {
            outcome: DeliveryOutcome::NotConnected,
            ..
        }
    ));
    assert_eq!(h.pipeline.dispatcher().metrics().total_requests, 0);
    assert_eq!(h.pipeline.cache().stats().failures, 1);
}

#[tokio::test]
async fn test_signed_json_envelope_reaches_collector() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/data")
        .match_header("content-type", "application/json")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""signature":"[0-9a-f]{64}""#.to_string()),
            Matcher::PartialJsonString(r#"{"timestamp":1700000000250}"#.to_string()),
        ]))
        .with_status(200)
        .create_async()
        .await;

    let signer = SigningService::with_secret(KEY);
    let verifier = SigningService::with_secret(KEY);
    let mut h = harness(&format!("{}/data", server.url()), PayloadFormat::Json, signer).await;
    h.clock.advance(250);

    let outcome = h.pipeline.tick(Reading::new(23.5, 51.0, NOW, 4)).await;

    mock.assert_async().await;
    assert!(outcome.is_success());
    assert!(h.pipeline.signer().is_enabled());

    // Re-encode the same reading and check the envelope verifies
    let encoder = PayloadEncoder::new(PayloadFormat::Json, DeviceInfo::default());
    let payload = encoder
        .encode(
            &Reading::new(23.5, 51.0, NOW, 4),
            bridge_lib::payload::BufferOccupancy {
                occupancy: 1,
                capacity: 5,
            },
            h.clock.now_ms(),
            h.pipeline.signer(),
        )
        .unwrap();
    let envelope: SignedEnvelope = serde_json::from_str(&payload.body).unwrap();
    assert_eq!(envelope.timestamp, NOW + 250);
    assert!(verifier.verify(&envelope.payload, &envelope.signature));
}

#[tokio::test]
async fn test_invalid_and_stale_readings_never_sent() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/data")
        .expect(0)
        .create_async()
        .await;

    let mut h = harness(
        &format!("{}/data", server.url()),
        PayloadFormat::Form,
        SigningService::new(),
    )
    .await;

    // Seconds passed where milliseconds are expected
    let outcome = h.pipeline.tick(Reading::new(20.0, 50.0, NOW / 1000, 1)).await;
    assert_eq!(outcome, TransmitOutcome::NothingToSend);

    let outcome = h.pipeline.tick(Reading::invalid(NOW, 2)).await;
    assert_eq!(outcome, TransmitOutcome::NothingToSend);

    mock.assert_async().await;
    assert_eq!(h.pipeline.cache().stats().total_attempts, 0);
    assert_eq!(
        h.health.status_of(components::CACHE).await,
        Some(ComponentStatus::Degraded)
    );
}

#[tokio::test]
async fn test_cache_window_and_capacity() {
    let mut h = harness(
        &closed_port_endpoint(),
        PayloadFormat::Form,
        SigningService::new(),
    )
    .await;

    for seq in 1..=8 {
        h.pipeline.sample(Reading::new(20.0, 50.0, h.clock.now_ms(), seq));
        h.clock.advance(1_000);
    }
    assert_eq!(h.pipeline.cache().len(), 5);

    h.clock.advance(120_000);
    h.pipeline.sample(Reading::new(20.0, 50.0, h.clock.now_ms(), 9));

    assert_eq!(h.pipeline.cache().len(), 1);
    assert_eq!(h.pipeline.cache().current().map(|r| r.sequence_id), Some(9));
}

#[tokio::test]
async fn test_status_snapshot_after_tick() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/data")
        .with_status(200)
        .create_async()
        .await;

    let mut h = harness(
        &format!("{}/data", server.url()),
        PayloadFormat::Form,
        SigningService::new(),
    )
    .await;
    let handle = h.pipeline.status_handle();

    h.pipeline.tick(Reading::new(21.0, 48.0, NOW, 1)).await;

    let status = handle.read().await.clone().unwrap();
    assert_eq!(status.device_id, "greenhouse-7");
    assert_eq!(status.cache.entries, 1);
    assert_eq!(status.cache.capacity, 5);
    assert_eq!(status.cache.current_sequence_id, Some(1));
    assert_eq!(status.connectivity.signal_quality, 75);
    assert_eq!(status.network.total_requests, 1);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["connectivity"]["state"], "connected");
}
