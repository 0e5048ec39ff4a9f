//! Stream kinds and buffered items.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::SystemTime;

/// An item is dropped by [`crate::TelemetryBuffer::return_failed`] once it
/// has accumulated this many failed delivery attempts.
pub const MAX_ITEM_ATTEMPTS: u32 = 5;

/// The telemetry streams the pipeline partitions by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Metrics,
    Logs,
    Traces,
    Topology,
}

impl StreamKind {
    /// Every kind, including topology.
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Metrics,
        StreamKind::Logs,
        StreamKind::Traces,
        StreamKind::Topology,
    ];

    /// The kinds the forwarder drains each cycle, in its fixed fairness
    /// order. Topology travels out-of-band and is never drained here.
    pub const FLUSH_ORDER: [StreamKind; 3] =
        [StreamKind::Metrics, StreamKind::Logs, StreamKind::Traces];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Metrics => "metrics",
            StreamKind::Logs => "logs",
            StreamKind::Traces => "traces",
            StreamKind::Topology => "topology",
        }
    }

    /// Parse the kind back out of a spill file name prefix.
    pub fn from_prefix(name: &str) -> Option<StreamKind> {
        StreamKind::ALL
            .iter()
            .copied()
            .find(|kind| name.starts_with(kind.as_str()))
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buffered telemetry record.
///
/// The payload is opaque to the pipeline; `attempts` counts failed delivery
/// round-trips and is only ever incremented when a batch comes back via
/// `return_failed`.
#[derive(Debug, Clone)]
pub struct Item {
    pub kind: StreamKind,
    pub payload: Value,
    pub enqueued_at: SystemTime,
    pub attempts: u32,
}

impl Item {
    pub fn new(kind: StreamKind, payload: Value, enqueued_at: SystemTime) -> Self {
        Self { kind, payload, enqueued_at, attempts: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in StreamKind::ALL {
            assert_eq!(StreamKind::from_prefix(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn prefix_parse_matches_file_names() {
        assert_eq!(
            StreamKind::from_prefix("metrics_2024_01_01__00_00_00_1704067200.000000.json.gz"),
            Some(StreamKind::Metrics)
        );
        assert_eq!(StreamKind::from_prefix("unknown_2024.json.gz"), None);
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&StreamKind::Logs).unwrap(), "\"logs\"");
    }

    #[test]
    fn new_item_starts_with_zero_attempts() {
        let item = Item::new(
            StreamKind::Metrics,
            serde_json::json!({"name": "cpu"}),
            SystemTime::UNIX_EPOCH,
        );
        assert_eq!(item.attempts, 0);
        assert_eq!(item.kind, StreamKind::Metrics);
    }
}
