//! Agent configuration.
//!
//! One record, constructed once at startup and passed explicitly to every
//! component. Nothing in the pipeline reads the environment on its own;
//! [`AgentConfig::from_env`] is the only place environment variables are
//! consulted, and callers opt into it.

use crate::stream::StreamKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Queue capacity for the topology stream. Topology snapshots are small,
/// whole-state payloads; they never need the full stream capacity.
pub const TOPOLOGY_QUEUE_CAPACITY: usize = 1_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one endpoint must be configured")]
    NoEndpoints,
    #[error("endpoint url must not be empty")]
    EmptyEndpointUrl,
    #[error("{field} must be greater than zero")]
    ZeroField { field: &'static str },
    #[error("{field} must be within (0.0, 1.0], got {value}")]
    RatioOutOfRange { field: &'static str, value: f64 },
    #[error("jitter_factor must be within [0.0, 1.0], got {0}")]
    JitterOutOfRange(f64),
}

/// One shipping target. Endpoints are ordered; index 0 is the primary and
/// the rest are failovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base ingest URL; per-kind paths are appended to it.
    pub url: String,
    pub api_key: String,
    /// Per-request deadline.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub enabled: bool,
    /// Topology ingest URL. Defaults to `{url}/topology` when unset.
    pub topology_url: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            enabled: true,
            topology_url: None,
        }
    }
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { url: url.into(), api_key: api_key.into(), ..Self::default() }
    }

    /// Resolve the ingest URL for a stream kind.
    pub fn url_for(&self, kind: StreamKind) -> String {
        let base = self.url.trim_end_matches('/');
        match kind {
            StreamKind::Topology => self
                .topology_url
                .clone()
                .unwrap_or_else(|| format!("{base}/topology")),
            other => format!("{base}/{other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Ordered shipping targets; index 0 is primary.
    pub endpoints: Vec<EndpointConfig>,
    pub tenant_id: String,
    /// Overrides the OS hostname in identity tagging when set.
    pub hostname: Option<String>,

    /// Per-kind in-memory queue capacity (topology is fixed at
    /// [`TOPOLOGY_QUEUE_CAPACITY`]).
    pub buffer_size: usize,
    /// Maximum items per send.
    pub batch_size: usize,
    /// Pause between forwarder cycles.
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,

    /// Retries per endpoint after the initial attempt.
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub initial_retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_retry_delay: Duration,
    /// Fraction of the backoff delay added as random jitter.
    pub jitter_factor: f64,

    pub circuit_breaker_threshold: u32,
    #[serde(with = "duration_secs")]
    pub circuit_breaker_timeout: Duration,

    /// Spill directory; overflow files land here.
    pub spill_dir: PathBuf,
    pub max_spill_size_mb: u64,
    /// Use at most this fraction of the filesystem's free space.
    pub max_disk_ratio: f64,
    /// Fraction of a full queue spilled per overflow.
    pub flush_to_disk_mem_ratio: f64,

    #[serde(with = "duration_secs")]
    pub discovery_interval: Duration,
    /// Bound on the shutdown drain.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            tenant_id: String::new(),
            hostname: None,
            buffer_size: 10_000,
            batch_size: 1_000,
            flush_interval: Duration::from_secs(10),
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(300),
            spill_dir: PathBuf::from("buffer"),
            max_spill_size_mb: 100,
            max_disk_ratio: 0.95,
            flush_to_disk_mem_ratio: 0.5,
            discovery_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Single endpoint, everything else defaulted.
    pub fn with_endpoint(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { endpoints: vec![EndpointConfig::new(url, api_key)], ..Self::default() }
    }

    /// Bootstrap from `PACKRAT_*` environment variables. Unset variables
    /// keep their defaults; this is the only environment access in the
    /// crate.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("PACKRAT_ENDPOINT") {
            let api_key = std::env::var("PACKRAT_API_KEY").unwrap_or_default();
            config.endpoints = vec![EndpointConfig::new(url, api_key)];
        }
        if let Ok(tenant) = std::env::var("PACKRAT_TENANT_ID") {
            config.tenant_id = tenant;
        }
        if let Ok(dir) = std::env::var("PACKRAT_SPILL_DIR") {
            config.spill_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_parse("PACKRAT_BUFFER_SIZE") {
            config.buffer_size = size;
        }
        if let Some(secs) = env_parse("PACKRAT_FLUSH_INTERVAL") {
            config.flush_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("PACKRAT_DISCOVERY_INTERVAL") {
            config.discovery_interval = Duration::from_secs(secs);
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.endpoints.iter().any(|e| e.url.is_empty()) {
            return Err(ConfigError::EmptyEndpointUrl);
        }
        for (field, value) in [
            ("buffer_size", self.buffer_size),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroField { field });
            }
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroField { field: "flush_interval" });
        }
        for (field, value) in [
            ("max_disk_ratio", self.max_disk_ratio),
            ("flush_to_disk_mem_ratio", self.flush_to_disk_mem_ratio),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::RatioOutOfRange { field, value });
            }
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::JitterOutOfRange(self.jitter_factor));
        }
        Ok(())
    }

    pub fn max_spill_bytes(&self) -> u64 {
        self.max_spill_size_mb * 1024 * 1024
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

/// `Duration` as (possibly fractional) seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_secs_f64().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(de)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration seconds must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
