//! The forwarder: one loop that turns queued telemetry into requests.
//!
//! Each cycle: honour the circuit breaker, pull a bounded number of spill
//! files back into memory while the remote looks healthy, then drain one
//! batch per stream kind in a fixed fairness order. Delivery walks the
//! endpoint list (retrying each endpoint with backoff before failing over
//! to the next) and hands failed batches back to the buffer. Client errors
//! (4xx other than 429) discard the batch instead: retransmitting a payload
//! the server called malformed helps nobody.
//!
//! Topology snapshots arrive on a dedicated channel and never touch the
//! per-kind queues; a snapshot that cannot be delivered is dropped, since
//! the next discovery cycle supersedes it.

use crate::buffer::TelemetryBuffer;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::{AgentConfig, EndpointConfig};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sleeper::Sleeper;
use crate::stream::StreamKind;
use crate::transport::{HttpTransport, SendOutcome, TransportError};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Spill files recovered per ordinary cycle.
const RECOVER_FILES_PER_CYCLE: usize = 5;
/// Larger recovery burst before the loop starts.
const RECOVER_FILES_AT_STARTUP: usize = 10;
/// Startup DNS probe attempts; this many failures open the circuit before
/// the first flush.
const STARTUP_DNS_PROBES: u32 = 2;
/// Topology snapshots allowed to wait out-of-band.
const TOPOLOGY_CHANNEL_CAPACITY: usize = 8;

/// What became of one batch.
enum BatchDisposition {
    Sent,
    /// Transient failure: hand the items back to the buffer.
    Requeue,
    /// Permanent client fault: the batch must not be retransmitted.
    Discard,
}

/// Handle for pushing topology snapshots into the forwarder out-of-band.
#[derive(Debug, Clone)]
pub struct TopologySender {
    tx: mpsc::Sender<Value>,
}

impl TopologySender {
    /// Queue a snapshot without blocking. Returns `false` (and drops the
    /// snapshot) when the forwarder is too far behind.
    pub fn send(&self, snapshot: Value) -> bool {
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "topology channel full, dropping snapshot");
                false
            }
        }
    }
}

/// Shared counters, published by the forwarder task after every cycle.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    requests_made: AtomicU64,
    requests_failed: AtomicU64,
    bytes_sent: AtomicU64,
    items_sent: AtomicU64,
    dns_failures: AtomicU64,
    circuit_opens: AtomicU64,
    failure_count: AtomicU32,
    circuit_state: AtomicU8,
    /// Milliseconds of cooldown left while open; zero otherwise.
    circuit_open_remaining_ms: AtomicU64,
}

const CIRCUIT_CLOSED: u8 = 0;
const CIRCUIT_OPEN: u8 = 1;
const CIRCUIT_HALF_OPEN: u8 = 2;

impl ForwarderStats {
    fn set_circuit_state(&self, state: CircuitState) {
        let encoded = match state {
            CircuitState::Closed => CIRCUIT_CLOSED,
            CircuitState::Open => CIRCUIT_OPEN,
            CircuitState::HalfOpen => CIRCUIT_HALF_OPEN,
        };
        self.circuit_state.store(encoded, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        let circuit_state = match self.circuit_state.load(Ordering::Relaxed) {
            CIRCUIT_OPEN => CircuitState::Open,
            CIRCUIT_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        };
        ForwarderStatsSnapshot {
            requests_made: self.requests_made.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            items_sent: self.items_sent.load(Ordering::Relaxed),
            dns_failures: self.dns_failures.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            circuit_state,
            circuit_open_remaining_ms: self.circuit_open_remaining_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStatsSnapshot {
    pub requests_made: u64,
    pub requests_failed: u64,
    pub bytes_sent: u64,
    pub items_sent: u64,
    pub dns_failures: u64,
    pub circuit_opens: u64,
    pub failure_count: u32,
    pub circuit_state: CircuitState,
    pub circuit_open_remaining_ms: u64,
}

pub struct Forwarder {
    endpoints: Vec<EndpointConfig>,
    batch_size: usize,
    flush_interval: Duration,
    buffer: Arc<TelemetryBuffer>,
    transport: HttpTransport,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    sleeper: Arc<dyn Sleeper>,
    stats: Arc<ForwarderStats>,
    topology_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
}

impl Forwarder {
    pub fn new(
        config: &AgentConfig,
        buffer: Arc<TelemetryBuffer>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        cancel: CancellationToken,
    ) -> Result<(Self, TopologySender), TransportError> {
        let transport = HttpTransport::new(&config.tenant_id)?;
        let (tx, topology_rx) = mpsc::channel(TOPOLOGY_CHANNEL_CAPACITY);
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
            clock,
        );

        let forwarder = Self {
            endpoints: config.endpoints.clone(),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            buffer,
            transport,
            retry: RetryPolicy::from_config(config),
            breaker,
            sleeper,
            stats: Arc::new(ForwarderStats::default()),
            topology_rx,
            cancel,
        };
        Ok((forwarder, TopologySender { tx }))
    }

    pub fn stats_handle(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Run until cancelled, then drain once, best-effort.
    pub async fn run(mut self) {
        self.startup().await;

        while !self.cancel.is_cancelled() {
            self.run_cycle().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.sleeper.sleep(self.flush_interval) => {}
            }
        }

        info!("forwarder stopping, draining queues");
        self.flush().await;
        self.publish_stats();
    }

    /// Probe DNS for the primary endpoint, then do one generous recovery
    /// pass. A dead resolver opens the circuit up front, but the loop still
    /// runs and will re-probe through the normal half-open path.
    async fn startup(&mut self) {
        if let Some(primary) = self.endpoints.iter().find(|endpoint| endpoint.enabled) {
            let mut failures = 0;
            for attempt in 1..=STARTUP_DNS_PROBES {
                match HttpTransport::probe_dns(primary).await {
                    Ok(()) => {
                        failures = 0;
                        break;
                    }
                    Err(message) => {
                        failures += 1;
                        self.stats.dns_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(attempt, %message, "startup dns probe failed");
                    }
                }
            }
            if failures >= STARTUP_DNS_PROBES {
                self.breaker.force_open("startup dns probes failed");
            }
        }

        if self.breaker.allows_recovery() {
            let recovered = self.buffer.recover(RECOVER_FILES_AT_STARTUP).await;
            if recovered > 0 {
                info!(recovered, "recovered spilled telemetry at startup");
            }
        }
        self.publish_stats();
    }

    async fn run_cycle(&mut self) {
        if self.breaker.poll() == CircuitState::Open {
            debug!(
                remaining_secs = self.breaker.open_remaining().unwrap_or_default().as_secs(),
                "circuit open, skipping flush cycle"
            );
            self.publish_stats();
            return;
        }

        if self.breaker.allows_recovery() {
            let recovered = self.buffer.recover(RECOVER_FILES_PER_CYCLE).await;
            if recovered > 0 {
                info!(recovered, "recovered spilled telemetry");
            }
        }

        for kind in StreamKind::FLUSH_ORDER {
            if self.cancel.is_cancelled() || self.breaker.state() == CircuitState::Open {
                break;
            }
            self.flush_kind(kind).await;
        }

        self.drain_topology().await;
        self.publish_stats();
    }

    async fn flush_kind(&mut self, kind: StreamKind) {
        let batch = self.buffer.get_batch(kind, self.batch_size);
        if batch.is_empty() {
            return;
        }
        let payloads: Vec<Value> = batch.iter().map(|item| item.payload.clone()).collect();

        match self.send_with_retry(kind, &payloads).await {
            BatchDisposition::Sent | BatchDisposition::Discard => {}
            BatchDisposition::Requeue => self.buffer.return_failed(batch),
        }
    }

    async fn drain_topology(&mut self) {
        loop {
            if self.cancel.is_cancelled() || self.breaker.state() == CircuitState::Open {
                return;
            }
            let snapshot = match self.topology_rx.try_recv() {
                Ok(snapshot) => snapshot,
                Err(_) => return,
            };
            match self.send_with_retry(StreamKind::Topology, &[snapshot]).await {
                BatchDisposition::Sent => {}
                BatchDisposition::Requeue | BatchDisposition::Discard => {
                    // Snapshots are whole-state; the next cycle replaces it.
                    warn!("failed to deliver topology snapshot, dropping");
                }
            }
        }
    }

    /// Walk the endpoint list: retry each endpoint per the policy, then
    /// fail over to the next. A client error is terminal for the whole
    /// batch, everywhere.
    async fn send_with_retry(&mut self, kind: StreamKind, payloads: &[Value]) -> BatchDisposition {
        for index in 0..self.endpoints.len() {
            let endpoint = self.endpoints[index].clone();
            if !endpoint.enabled {
                continue;
            }

            let mut attempt: u32 = 0;
            loop {
                let outcome = tokio::select! {
                    _ = self.cancel.cancelled() => return BatchDisposition::Requeue,
                    outcome = self.transport.send(&endpoint, kind, payloads) => outcome,
                };

                self.stats.requests_made.fetch_add(1, Ordering::Relaxed);
                if outcome.is_dns() {
                    self.stats.dns_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.breaker.record_outcome(&outcome);

                match &outcome {
                    SendOutcome::Success { bytes_sent, items } => {
                        self.stats.bytes_sent.fetch_add(*bytes_sent, Ordering::Relaxed);
                        self.stats.items_sent.fetch_add(*items as u64, Ordering::Relaxed);
                        debug!(kind = %kind, items, endpoint = %endpoint.url, "batch delivered");
                        return BatchDisposition::Sent;
                    }
                    SendOutcome::ClientError { status, body } => {
                        error!(
                            kind = %kind,
                            status,
                            body = %body,
                            endpoint = %endpoint.url,
                            "client error, discarding batch"
                        );
                        self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                        return BatchDisposition::Discard;
                    }
                    other => {
                        if self.breaker.state() == CircuitState::Open {
                            warn!(kind = %kind, "circuit opened mid-delivery, abandoning batch");
                            self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                            return BatchDisposition::Requeue;
                        }
                        match self.retry.decide(attempt, other) {
                            RetryDecision::RetryAfter(delay) => {
                                if matches!(other, SendOutcome::RateLimited { .. }) {
                                    warn!(
                                        kind = %kind,
                                        delay_secs = delay.as_secs_f64(),
                                        endpoint = %endpoint.url,
                                        "rate limited, backing off"
                                    );
                                } else {
                                    warn!(
                                        kind = %kind,
                                        outcome = other.label(),
                                        attempt,
                                        delay_secs = delay.as_secs_f64(),
                                        endpoint = %endpoint.url,
                                        "delivery failed, retrying"
                                    );
                                }
                                tokio::select! {
                                    _ = self.cancel.cancelled() => return BatchDisposition::Requeue,
                                    _ = self.sleeper.sleep(delay) => {}
                                }
                                attempt += 1;
                            }
                            RetryDecision::Stop => {
                                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    kind = %kind,
                                    outcome = other.label(),
                                    endpoint = %endpoint.url,
                                    "endpoint exhausted, failing over"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }
        BatchDisposition::Requeue
    }

    /// One best-effort drain of every kind: a single attempt per endpoint,
    /// no backoff. The shutdown path runs this under the caller's deadline;
    /// it can also be called before `run` for an eager drain. An open
    /// circuit still gates it: the remote is known-bad and the deadline is
    /// better spent not waiting on it.
    pub async fn flush(&mut self) {
        if self.breaker.poll() == CircuitState::Open {
            debug!("circuit open, skipping shutdown drain");
            return;
        }
        for kind in StreamKind::FLUSH_ORDER {
            loop {
                let batch = self.buffer.get_batch(kind, self.batch_size);
                if batch.is_empty() {
                    break;
                }
                let payloads: Vec<Value> =
                    batch.iter().map(|item| item.payload.clone()).collect();

                let mut delivered = false;
                for index in 0..self.endpoints.len() {
                    let endpoint = self.endpoints[index].clone();
                    if !endpoint.enabled {
                        continue;
                    }
                    let outcome = self.transport.send(&endpoint, kind, &payloads).await;
                    self.stats.requests_made.fetch_add(1, Ordering::Relaxed);
                    if let SendOutcome::Success { bytes_sent, items } = outcome {
                        self.stats.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
                        self.stats.items_sent.fetch_add(items as u64, Ordering::Relaxed);
                        delivered = true;
                        break;
                    }
                }

                if !delivered {
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    self.buffer.return_failed(batch);
                    // The remote is down; hammering it for every remaining
                    // batch only delays shutdown.
                    break;
                }
            }
        }
    }

    fn publish_stats(&self) {
        self.stats.set_circuit_state(self.breaker.state());
        self.stats
            .failure_count
            .store(self.breaker.consecutive_failures(), Ordering::Relaxed);
        self.stats.circuit_opens.store(self.breaker.opens(), Ordering::Relaxed);
        let remaining = self.breaker.open_remaining().unwrap_or_default();
        self.stats
            .circuit_open_remaining_ms
            .store(remaining.as_millis() as u64, Ordering::Relaxed);
    }
}
