//! Topology discovery: periodic whole-state snapshots.
//!
//! Discovery enumerates the host's workloads (processes, containers,
//! network connections, whatever sources the embedder wires in) and
//! assembles one snapshot per cycle. The snapshot goes straight to the
//! forwarder's out-of-band channel: topology is small and monolithic, and
//! queueing it behind a metrics backlog would starve it of exactly the
//! freshness that makes it useful.

use crate::clock::Clock;
use crate::forwarder::TopologySender;
use crate::producer::CollectError;
use crate::sleeper::Sleeper;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type DiscoverFuture = BoxFuture<'static, Result<Vec<Value>, CollectError>>;

/// One named enumeration source. The name becomes the snapshot key
/// (`"processes"`, `"containers"`, `"connections"`, ...).
#[derive(Clone)]
pub struct TopologySource {
    name: String,
    discover: Arc<dyn Fn() -> DiscoverFuture + Send + Sync>,
}

impl fmt::Debug for TopologySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologySource").field("name", &self.name).finish_non_exhaustive()
    }
}

impl TopologySource {
    pub fn new(
        name: impl Into<String>,
        discover: impl Fn() -> DiscoverFuture + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), discover: Arc::new(discover) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub(crate) struct DiscoveryController {
    sources: Vec<TopologySource>,
    interval: Duration,
    hostname: String,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    topology: TopologySender,
    cancel: CancellationToken,
}

impl DiscoveryController {
    pub(crate) fn new(
        sources: Vec<TopologySource>,
        interval: Duration,
        hostname: String,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        topology: TopologySender,
        cancel: CancellationToken,
    ) -> Self {
        Self { sources, interval, hostname, clock, sleeper, topology, cancel }
    }

    /// Run one cycle immediately (so a topology snapshot exists from the
    /// start), then repeat on the configured interval until cancelled.
    pub(crate) async fn run(self) {
        info!(
            sources = self.sources.len(),
            interval_secs = self.interval.as_secs_f64(),
            "discovery started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(snapshot) = self.build_snapshot().await {
                self.topology.send(snapshot);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.sleeper.sleep(self.interval) => {}
            }
        }

        debug!("discovery stopped");
    }

    /// Assemble one snapshot. A source that cannot enumerate degrades to an
    /// empty list; only cancellation abandons the cycle.
    async fn build_snapshot(&self) -> Option<Value> {
        let mut snapshot = serde_json::Map::new();
        snapshot.insert("host".into(), Value::String(self.hostname.clone()));
        let collected_at: DateTime<Utc> = self.clock.now_wall().into();
        snapshot.insert("collected_at".into(), Value::String(collected_at.to_rfc3339()));

        for source in &self.sources {
            let entries = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = (source.discover)() => match result {
                    Ok(entries) => entries,
                    Err(CollectError::Denied(message)) => {
                        debug!(source = source.name(), %message, "discovery skipped, permission denied");
                        Vec::new()
                    }
                    Err(CollectError::Failed(message)) => {
                        warn!(source = source.name(), %message, "discovery failed");
                        Vec::new()
                    }
                },
            };
            snapshot.insert(source.name.clone(), Value::Array(entries));
        }

        Some(Value::Object(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TelemetryBuffer;
    use crate::clock::ManualClock;
    use crate::config::AgentConfig;
    use crate::forwarder::Forwarder;
    use crate::sleeper::InstantSleeper;
    use crate::spill::SpillStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn topology_sender(dir: &std::path::Path) -> TopologySender {
        let clock = ManualClock::new();
        let config = AgentConfig::with_endpoint("http://127.0.0.1:9", "key");
        let store = Arc::new(SpillStore::new(
            dir,
            config.max_spill_bytes(),
            config.max_disk_ratio,
            Arc::new(clock.clone()),
        ));
        let buffer = Arc::new(TelemetryBuffer::new(&config, store, Arc::new(clock.clone())));
        let (_forwarder, sender) = Forwarder::new(
            &config,
            buffer,
            Arc::new(clock),
            Arc::new(InstantSleeper),
            CancellationToken::new(),
        )
        .expect("forwarder");
        sender
    }

    fn fixed_source(name: &str, entries: Vec<Value>) -> TopologySource {
        TopologySource::new(name, move || {
            let entries = entries.clone();
            Box::pin(async move { Ok(entries) })
        })
    }

    fn controller(
        dir: &std::path::Path,
        sources: Vec<TopologySource>,
        cancel: CancellationToken,
    ) -> DiscoveryController {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(1_700_000_000));
        DiscoveryController::new(
            sources,
            Duration::from_secs(60),
            "host-a".into(),
            Arc::new(clock),
            Arc::new(InstantSleeper),
            topology_sender(dir),
            cancel,
        )
    }

    #[tokio::test]
    async fn snapshot_carries_identity_and_every_source() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(
            dir.path(),
            vec![
                fixed_source("processes", vec![json!({"pid": 1, "name": "init"})]),
                fixed_source("containers", vec![]),
                TopologySource::new("connections", || {
                    Box::pin(async { Err(CollectError::Denied("/proc/net/tcp".into())) })
                }),
            ],
            CancellationToken::new(),
        );

        let snapshot = controller.build_snapshot().await.expect("snapshot");
        assert_eq!(snapshot["host"], json!("host-a"));
        assert!(snapshot["collected_at"].as_str().unwrap().starts_with("2023-"));
        assert_eq!(snapshot["processes"], json!([{"pid": 1, "name": "init"}]));
        assert_eq!(snapshot["containers"], json!([]));
        // A denied source degrades to an empty list instead of failing the
        // whole cycle.
        assert_eq!(snapshot["connections"], json!([]));
    }

    #[tokio::test]
    async fn failed_sources_do_not_poison_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(
            dir.path(),
            vec![
                TopologySource::new("containers", || {
                    Box::pin(async { Err(CollectError::Failed("docker api timeout".into())) })
                }),
                fixed_source("processes", vec![json!({"pid": 42})]),
            ],
            CancellationToken::new(),
        );

        let snapshot = controller.build_snapshot().await.expect("snapshot");
        assert_eq!(snapshot["containers"], json!([]));
        assert_eq!(snapshot["processes"], json!([{"pid": 42}]));
    }

    #[tokio::test]
    async fn runs_initial_cycle_then_respects_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cycles = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let source = {
            let cycles = Arc::clone(&cycles);
            let cancel = cancel.clone();
            TopologySource::new("processes", move || {
                let cycles = Arc::clone(&cycles);
                let cancel = cancel.clone();
                Box::pin(async move {
                    if cycles.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                        cancel.cancel();
                    }
                    Ok(vec![json!({"pid": 1})])
                })
            })
        };

        controller(dir.path(), vec![source], cancel).run().await;
        assert_eq!(cycles.load(Ordering::SeqCst), 2);
    }
}
