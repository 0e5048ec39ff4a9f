//! Agent lifecycle: owns the buffer, the producers, discovery, and the
//! forwarder, and shepherds them from startup to a bounded shutdown.
//!
//! Shutdown order matters: producers (and discovery) are cancelled first so
//! nothing new enters the buffer, then the forwarder gets a deadline to
//! drain what remains. A panic in any single task is logged and contained;
//! the operational contract is "degrade, don't die".

use crate::buffer::{BufferStats, TelemetryBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::{AgentConfig, ConfigError};
use crate::discovery::{DiscoveryController, TopologySource};
use crate::forwarder::{Forwarder, ForwarderStats, ForwarderStatsSnapshot, TopologySender};
use crate::producer::{run_producer, Producer};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::spill::{SpillStats, SpillStore};
use crate::transport::TransportError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("agent has already been started")]
    AlreadyStarted,
}

/// Merged view over every component's counters.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub buffer: BufferStats,
    pub spill: SpillStats,
    pub forwarder: ForwarderStatsSnapshot,
    pub producer_errors: u64,
}

pub struct AgentBuilder {
    config: AgentConfig,
    producers: Vec<Producer>,
    sources: Vec<TopologySource>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl AgentBuilder {
    fn new(config: AgentConfig) -> Self {
        Self {
            config,
            producers: Vec::new(),
            sources: Vec::new(),
            clock: Arc::new(SystemClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Register a periodic collector.
    pub fn producer(mut self, producer: Producer) -> Self {
        self.producers.push(producer);
        self
    }

    /// Register a topology enumeration source.
    pub fn topology_source(mut self, source: TopologySource) -> Self {
        self.sources.push(source);
        self
    }

    /// Override the clock (deterministic tests).
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper (instant tests).
    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        self.config.validate()?;

        let hostname = self
            .config
            .hostname
            .clone()
            .or_else(|| hostname::get().ok().and_then(|name| name.into_string().ok()))
            .unwrap_or_else(|| "unknown".to_string());

        let store = Arc::new(SpillStore::new(
            self.config.spill_dir.clone(),
            self.config.max_spill_bytes(),
            self.config.max_disk_ratio,
            Arc::clone(&self.clock),
        ));
        let buffer = Arc::new(TelemetryBuffer::new(
            &self.config,
            store,
            Arc::clone(&self.clock),
        ));

        let producer_cancel = CancellationToken::new();
        let forwarder_cancel = CancellationToken::new();
        let (forwarder, topology) = Forwarder::new(
            &self.config,
            Arc::clone(&buffer),
            Arc::clone(&self.clock),
            Arc::clone(&self.sleeper),
            forwarder_cancel.clone(),
        )?;
        let forwarder_stats = forwarder.stats_handle();

        Ok(Agent {
            config: self.config,
            hostname,
            buffer,
            forwarder: Some(forwarder),
            forwarder_stats,
            topology,
            producers: self.producers,
            sources: self.sources,
            clock: self.clock,
            sleeper: self.sleeper,
            producer_cancel,
            forwarder_cancel,
            producer_errors: Arc::new(AtomicU64::new(0)),
            task_handles: Vec::new(),
            forwarder_handle: None,
            stopped: false,
        })
    }
}

pub struct Agent {
    config: AgentConfig,
    hostname: String,
    buffer: Arc<TelemetryBuffer>,
    forwarder: Option<Forwarder>,
    forwarder_stats: Arc<ForwarderStats>,
    topology: TopologySender,
    producers: Vec<Producer>,
    sources: Vec<TopologySource>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    producer_cancel: CancellationToken,
    forwarder_cancel: CancellationToken,
    producer_errors: Arc<AtomicU64>,
    /// Producer + discovery tasks, cancelled and joined first at shutdown.
    task_handles: Vec<JoinHandle<()>>,
    forwarder_handle: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// The buffer handle producers write into. Collector closures capture a
    /// clone of this.
    pub fn buffer(&self) -> Arc<TelemetryBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Register a producer after construction. Collector closures usually
    /// capture [`buffer`](Self::buffer), which only exists once the agent
    /// is built. No effect once started.
    pub fn add_producer(&mut self, producer: Producer) {
        self.producers.push(producer);
    }

    /// Register a topology source after construction. No effect once
    /// started.
    pub fn add_topology_source(&mut self, source: TopologySource) {
        self.sources.push(source);
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Launch discovery, every producer, and the forwarder as independent
    /// tasks.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        let forwarder = self.forwarder.take().ok_or(AgentError::AlreadyStarted)?;

        info!(
            host = %self.hostname,
            tenant = %self.config.tenant_id,
            endpoints = self.config.endpoints.len(),
            producers = self.producers.len(),
            "agent starting"
        );

        let discovery = DiscoveryController::new(
            std::mem::take(&mut self.sources),
            self.config.discovery_interval,
            self.hostname.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.sleeper),
            self.topology.clone(),
            self.producer_cancel.clone(),
        );
        self.task_handles.push(tokio::spawn(discovery.run()));

        for producer in std::mem::take(&mut self.producers) {
            self.task_handles.push(tokio::spawn(run_producer(
                producer,
                Arc::clone(&self.sleeper),
                self.producer_cancel.clone(),
                Arc::clone(&self.producer_errors),
            )));
        }

        self.forwarder_handle = Some(tokio::spawn(forwarder.run()));
        Ok(())
    }

    /// Graceful shutdown: producers first, then a deadline-bounded
    /// forwarder drain. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("agent stopping");

        self.producer_cancel.cancel();
        for handle in self.task_handles.drain(..) {
            if let Err(err) = handle.await {
                error!(%err, "producer task panicked; continuing shutdown");
            }
        }

        self.forwarder_cancel.cancel();
        if let Some(handle) = self.forwarder_handle.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(%err, "forwarder task panicked"),
                Err(_) => {
                    warn!(
                        deadline_secs = self.config.shutdown_timeout.as_secs(),
                        "forwarder drain exceeded shutdown deadline, aborting"
                    );
                    abort.abort();
                }
            }
        }

        info!("agent stopped");
    }

    /// Start, wait for SIGINT/SIGTERM, stop.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        self.stop().await;
        Ok(())
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            buffer: self.buffer.stats(),
            spill: self.buffer.spill_stats(),
            forwarder: self.forwarder_stats.snapshot(),
            producer_errors: self.producer_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt());
    let sigterm = signal(SignalKind::terminate());
    match (sigint, sigterm) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        _ => {
            warn!("failed to install signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
