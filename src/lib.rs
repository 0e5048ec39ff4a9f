#![forbid(unsafe_code)]

//! # Packrat
//!
//! A host telemetry agent core: lossless under normal pressure, lossy only
//! at the extremes, and never dead.
//!
//! ## Features
//!
//! - **Per-stream buffering** (metrics, logs, traces, topology) with
//!   bounded in-memory queues
//! - **Disk spillover** under backpressure: the oldest items move to
//!   compressed files, the newest stay hot in memory
//! - **Batched gzip shipping** with exponential-backoff retry and ordered
//!   endpoint failover
//! - **Circuit breaking** with a separate DNS failure streak, so a dead
//!   resolver stops traffic before the timeouts pile up
//! - **Producer scheduling** with independent cadences, cooperative
//!   cancellation, and per-task failure isolation
//! - **Out-of-band topology snapshots** that never queue behind a metrics
//!   backlog
//!
//! ## Quick start
//!
//! ```no_run
//! use packrat::{Agent, AgentConfig, Producer, StreamKind};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), packrat::AgentError> {
//!     let config = AgentConfig::with_endpoint("https://ingest.example.com/api/v1", "api-key");
//!     let mut agent = Agent::builder(config).build()?;
//!
//!     // Collectors are plain closures over the buffer handle.
//!     let buffer = agent.buffer();
//!     agent.add_producer(Producer::new("host_metrics", Duration::from_secs(15), move || {
//!         let buffer = Arc::clone(&buffer);
//!         Box::pin(async move {
//!             buffer
//!                 .add(StreamKind::Metrics, json!({"name": "cpu.idle", "value": 97.2}))
//!                 .await;
//!             Ok(())
//!         })
//!     }));
//!
//!     // Runs until SIGINT/SIGTERM, then drains within the shutdown deadline.
//!     agent.run().await
//! }
//! ```

mod agent;
mod buffer;
mod circuit_breaker;
mod clock;
mod config;
mod discovery;
mod forwarder;
mod producer;
mod retry;
mod sleeper;
mod spill;
mod stream;
mod transport;

// Re-exports
pub use agent::{Agent, AgentBuilder, AgentError, AgentStats};
pub use buffer::{BufferStats, TelemetryBuffer};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, ConfigError, EndpointConfig, TOPOLOGY_QUEUE_CAPACITY};
pub use discovery::{DiscoverFuture, TopologySource};
pub use forwarder::{Forwarder, ForwarderStats, ForwarderStatsSnapshot, TopologySender};
pub use producer::{CollectError, CollectFuture, Producer};
pub use retry::{RetryDecision, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use spill::{RecoveredBatch, SpillError, SpillStats, SpillStore};
pub use stream::{Item, StreamKind, MAX_ITEM_ATTEMPTS};
pub use transport::{HttpTransport, SendOutcome, TransportError};

pub mod prelude;
