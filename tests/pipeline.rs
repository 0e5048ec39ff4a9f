//! End-to-end pipeline behaviour against a mock ingest service.

use httpmock::prelude::*;
use packrat::{
    Agent, AgentConfig, CircuitState, ManualClock, Producer, SpillStore, StreamKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_config(url: String, dir: &std::path::Path) -> AgentConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = AgentConfig::with_endpoint(url, "test-key");
    config.tenant_id = "tenant-1".into();
    config.hostname = Some("it-host".into());
    config.spill_dir = dir.to_path_buf();
    config.flush_interval = Duration::from_millis(20);
    config.initial_retry_delay = Duration::from_millis(5);
    config.max_retry_delay = Duration::from_millis(50);
    config.discovery_interval = Duration::from_secs(3600);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn happy_path_ships_queued_items_in_batches() {
    let server = MockServer::start_async().await;
    let metrics = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/metrics")
                .header("api-key", "test-key")
                .header("tenant-id", "tenant-1")
                .header("content-encoding", "gzip");
            then.status(200);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(server.base_url(), dir.path());
    config.batch_size = 2;
    let mut agent = Agent::builder(config).build().unwrap();

    let buffer = agent.buffer();
    for id in ["m1", "m2", "m3"] {
        assert!(buffer.add(StreamKind::Metrics, json!({"id": id})).await);
    }

    agent.start().await.unwrap();
    settle().await;
    agent.stop().await;

    // Three items at batch_size two: exactly two deliveries.
    metrics.assert_hits_async(2).await;
    let stats = agent.stats();
    assert_eq!(stats.forwarder.items_sent, 3);
    assert_eq!(stats.forwarder.requests_made, 2);
    assert_eq!(stats.buffer.drop_count, 0);
    assert_eq!(stats.forwarder.circuit_state, CircuitState::Closed);
}

#[tokio::test]
async fn terminal_client_error_discards_the_batch() {
    let server = MockServer::start_async().await;
    let metrics = server
        .mock_async(|when, then| {
            when.method(POST).path("/metrics");
            then.status(400).body("malformed payload");
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut agent = Agent::builder(fast_config(server.base_url(), dir.path()))
        .build()
        .unwrap();

    let buffer = agent.buffer();
    buffer.add(StreamKind::Metrics, json!({"id": "bad"})).await;

    agent.start().await.unwrap();
    settle().await;
    agent.stop().await;

    // Exactly one POST: no retries, and the item is never re-queued.
    metrics.assert_hits_async(1).await;
    let stats = agent.stats();
    assert_eq!(stats.forwarder.requests_failed, 1);
    assert_eq!(stats.buffer.drop_count, 0);
    assert_eq!(stats.forwarder.circuit_state, CircuitState::Closed);
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn failover_delivers_after_the_primary_exhausts() {
    let primary = MockServer::start_async().await;
    let primary_mock = primary
        .mock_async(|when, then| {
            when.method(POST).path("/metrics");
            then.status(503);
        })
        .await;
    let secondary = MockServer::start_async().await;
    let secondary_mock = secondary
        .mock_async(|when, then| {
            when.method(POST).path("/metrics");
            then.status(200);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(primary.base_url(), dir.path());
    config.endpoints.push(packrat::EndpointConfig::new(secondary.base_url(), "test-key"));
    config.max_retries = 1;
    let mut agent = Agent::builder(config).build().unwrap();

    agent.buffer().add(StreamKind::Metrics, json!({"id": "x"})).await;

    agent.start().await.unwrap();
    settle().await;
    agent.stop().await;

    // max_retries + 1 attempts on the primary, then the failover wins.
    primary_mock.assert_hits_async(2).await;
    secondary_mock.assert_hits_async(1).await;
    assert_eq!(agent.stats().forwarder.items_sent, 1);
}

#[tokio::test]
async fn outage_recovery_ships_spilled_files_and_empties_the_directory() {
    let server = MockServer::start_async().await;
    let metrics = server
        .mock_async(|when, then| {
            when.method(POST).path("/metrics");
            then.status(200);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();

    // A previous run left three spill files behind, oldest first.
    let clock = ManualClock::new();
    clock.advance(Duration::from_secs(1_700_000_000));
    let store = SpillStore::new(dir.path(), 100 * 1024 * 1024, 0.95, Arc::new(clock.clone()));
    for id in ["a", "b", "c"] {
        store.write(StreamKind::Metrics, &[json!({"id": id})]).unwrap();
        clock.advance(Duration::from_secs(5));
    }
    assert_eq!(store.file_count(), 3);

    let mut agent = Agent::builder(fast_config(server.base_url(), dir.path()))
        .build()
        .unwrap();
    agent.start().await.unwrap();
    settle().await;
    agent.stop().await;

    // All three recovered in one startup burst and delivered together.
    metrics.assert_hits_async(1).await;
    let stats = agent.stats();
    assert_eq!(stats.forwarder.items_sent, 3);
    assert_eq!(stats.buffer.items_recovered, 3);
    assert_eq!(store.file_count(), 0, "recovered files must be deleted");
}

#[tokio::test]
async fn dead_dns_opens_the_circuit_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let mut config = fast_config("http://nope.invalid".into(), dir.path());
    config.circuit_breaker_threshold = 3;
    let mut agent = Agent::builder(config).clock(clock.clone()).build().unwrap();

    let buffer = agent.buffer();
    buffer.add(StreamKind::Metrics, json!({"id": 1})).await;

    agent.start().await.unwrap();
    settle().await;

    // The startup probes fail twice and the circuit opens pre-emptively;
    // while it is open no request is ever attempted.
    let stats = agent.stats();
    assert_eq!(stats.forwarder.circuit_state, CircuitState::Open);
    assert_eq!(stats.forwarder.requests_made, 0);
    assert!(stats.forwarder.dns_failures >= 2);
    assert_eq!(buffer.len(StreamKind::Metrics), 1, "item waits out the outage");

    // Cooldown elapses: the half-open probe attempts once, fails on DNS
    // again, and the circuit re-opens.
    clock.advance(Duration::from_secs(301));
    settle().await;

    let stats = agent.stats();
    assert!(stats.forwarder.requests_made >= 1);
    assert_eq!(stats.forwarder.circuit_state, CircuitState::Open);

    agent.stop().await;
}

#[tokio::test]
async fn producers_feed_the_pipeline_on_their_own_cadence() {
    let server = MockServer::start_async().await;
    let logs = server
        .mock_async(|when, then| {
            when.method(POST).path("/logs");
            then.status(200);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut agent = Agent::builder(fast_config(server.base_url(), dir.path()))
        .build()
        .unwrap();

    let buffer = agent.buffer();
    agent.add_producer(Producer::new("log_tailer", Duration::from_millis(10), move || {
        let buffer = Arc::clone(&buffer);
        Box::pin(async move {
            buffer.add(StreamKind::Logs, json!({"line": "tick"})).await;
            Ok(())
        })
    }));

    agent.start().await.unwrap();
    settle().await;
    agent.stop().await;

    assert!(logs.hits_async().await >= 1);
    let stats = agent.stats();
    assert!(stats.forwarder.items_sent >= 1);
    assert_eq!(stats.producer_errors, 0);
}
