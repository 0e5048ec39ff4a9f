//! Multi-stream buffer: bounded in-memory queues with disk spillover.
//!
//! One mutex serialises all queue state; the hot paths (producer append,
//! forwarder dequeue) touch it only briefly. When a queue is full, `add`
//! drains the *oldest* half out of memory and writes it to the spill store
//! with the lock released; a per-kind spill-in-progress flag keeps a second
//! overflow from racing the first. The newest items stay hot in memory, so
//! live views remain current while the backlog rides out the pressure on
//! disk.
//!
//! Ordering contract: per kind, in-memory delivery preserves arrival order.
//! Recovered payloads re-enter at the *tail*, so the memory/disk boundary
//! re-orders old and new telemetry; per-item timestamps are authoritative.

use crate::clock::Clock;
use crate::config::{AgentConfig, TOPOLOGY_QUEUE_CAPACITY};
use crate::spill::{SpillStats, SpillStore};
use crate::stream::{Item, StreamKind, MAX_ITEM_ATTEMPTS};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Hard cap on items per spill file, regardless of queue size.
const MAX_ITEMS_PER_SPILL: usize = 1_000;

/// Counter snapshot. The ledger balances at all times:
/// `total_added = total_flushed + drop_count + dropped_to_disk
/// + in_memory + (items_spilled - items_recovered - dropped_to_disk)`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub total_added: u64,
    pub total_flushed: u64,
    pub spill_count: u64,
    pub drop_count: u64,
    /// Items that reached disk and were then lost when their spill file
    /// was evicted under disk pressure.
    pub dropped_to_disk: u64,
    pub items_spilled: u64,
    pub items_recovered: u64,
    pub queue_lengths: BTreeMap<String, usize>,
}

#[derive(Debug)]
struct StreamQueue {
    items: VecDeque<Item>,
    capacity: usize,
}

impl StreamQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity }
    }

    fn has_room(&self) -> bool {
        self.items.len() < self.capacity
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_added: u64,
    total_flushed: u64,
    spill_count: u64,
    drop_count: u64,
    items_spilled: u64,
    items_recovered: u64,
}

#[derive(Debug)]
struct Inner {
    metrics: StreamQueue,
    logs: StreamQueue,
    traces: StreamQueue,
    topology: StreamQueue,
    /// Kinds with a spill write currently running outside the lock.
    spilling: [bool; 4],
    counters: Counters,
}

impl Inner {
    fn queue(&self, kind: StreamKind) -> &StreamQueue {
        match kind {
            StreamKind::Metrics => &self.metrics,
            StreamKind::Logs => &self.logs,
            StreamKind::Traces => &self.traces,
            StreamKind::Topology => &self.topology,
        }
    }

    fn queue_mut(&mut self, kind: StreamKind) -> &mut StreamQueue {
        match kind {
            StreamKind::Metrics => &mut self.metrics,
            StreamKind::Logs => &mut self.logs,
            StreamKind::Traces => &mut self.traces,
            StreamKind::Topology => &mut self.topology,
        }
    }

    fn spilling(&self, kind: StreamKind) -> bool {
        self.spilling[spill_slot(kind)]
    }

    fn set_spilling(&mut self, kind: StreamKind, value: bool) {
        self.spilling[spill_slot(kind)] = value;
    }
}

fn spill_slot(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Metrics => 0,
        StreamKind::Logs => 1,
        StreamKind::Traces => 2,
        StreamKind::Topology => 3,
    }
}

#[derive(Debug)]
pub struct TelemetryBuffer {
    inner: Mutex<Inner>,
    store: Arc<SpillStore>,
    clock: Arc<dyn Clock>,
    spill_fraction: f64,
}

impl TelemetryBuffer {
    pub fn new(config: &AgentConfig, store: Arc<SpillStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                metrics: StreamQueue::with_capacity(config.buffer_size),
                logs: StreamQueue::with_capacity(config.buffer_size),
                traces: StreamQueue::with_capacity(config.buffer_size),
                topology: StreamQueue::with_capacity(TOPOLOGY_QUEUE_CAPACITY),
                spilling: [false; 4],
                counters: Counters::default(),
            }),
            store,
            clock,
            spill_fraction: config.flush_to_disk_mem_ratio,
        }
    }

    /// Append one payload. A full queue triggers exactly one spill attempt;
    /// if the spill fails the payload is dropped and counted.
    pub async fn add(&self, kind: StreamKind, payload: Value) -> bool {
        let item = Item::new(kind, payload, self.clock.now_wall());

        let drained = {
            let mut inner = self.lock();
            if inner.queue(kind).has_room() {
                inner.queue_mut(kind).items.push_back(item);
                inner.counters.total_added += 1;
                return true;
            }
            if inner.spilling(kind) {
                // Another overflow is already writing; one spill at a time.
                inner.counters.drop_count += 1;
                return false;
            }
            let quota = self.spill_quota(inner.queue(kind).capacity);
            if quota == 0 {
                inner.counters.drop_count += 1;
                return false;
            }
            let drained: Vec<Item> = inner.queue_mut(kind).items.drain(..quota).collect();
            inner.set_spilling(kind, true);
            drained
        };

        // The gzip + write runs off the lock (and off the executor).
        let store = Arc::clone(&self.store);
        let spilled = tokio::task::spawn_blocking(move || {
            let payloads: Vec<Value> = drained.iter().map(|item| item.payload.clone()).collect();
            (store.write(kind, &payloads), drained)
        })
        .await;

        let mut inner = self.lock();
        inner.set_spilling(kind, false);
        match spilled {
            Ok((Ok(_path), drained)) => {
                inner.counters.spill_count += 1;
                inner.counters.items_spilled += drained.len() as u64;
                if inner.queue(kind).has_room() {
                    inner.queue_mut(kind).items.push_back(item);
                    inner.counters.total_added += 1;
                    true
                } else {
                    inner.counters.drop_count += 1;
                    false
                }
            }
            Ok((Err(err), drained)) => {
                warn!(kind = %kind, error = %err, "spill failed, keeping items in memory");
                // Put the drained items back at the head; anything that no
                // longer fits gives way from the tail (the newest arrivals).
                for item in drained.into_iter().rev() {
                    inner.queue_mut(kind).items.push_front(item);
                }
                let excess = {
                    let queue = inner.queue_mut(kind);
                    let excess = queue.items.len().saturating_sub(queue.capacity);
                    queue.items.truncate(queue.items.len() - excess);
                    excess
                };
                inner.counters.drop_count += excess as u64 + 1;
                false
            }
            Err(err) => {
                warn!(kind = %kind, error = %err, "spill task aborted");
                inner.counters.drop_count += 1;
                false
            }
        }
    }

    /// Append many payloads, returning how many were accepted.
    pub async fn add_batch(&self, kind: StreamKind, payloads: Vec<Value>) -> usize {
        let mut accepted = 0;
        for payload in payloads {
            if self.add(kind, payload).await {
                accepted += 1;
            }
        }
        accepted
    }

    /// Dequeue up to `max` items from the head of one queue.
    pub fn get_batch(&self, kind: StreamKind, max: usize) -> Vec<Item> {
        let mut inner = self.lock();
        let batch: Vec<Item> = {
            let queue = inner.queue_mut(kind);
            let take = max.min(queue.items.len());
            queue.items.drain(..take).collect()
        };
        inner.counters.total_flushed += batch.len() as u64;
        batch
    }

    /// Re-queue a failed batch at the head, preserving order. Each item's
    /// attempt counter advances; items hitting the cap are dropped here.
    pub fn return_failed(&self, items: Vec<Item>) {
        let mut inner = self.lock();
        let returned = items.len() as u64;
        let mut dropped = 0u64;

        for mut item in items.into_iter().rev() {
            item.attempts += 1;
            if item.attempts >= MAX_ITEM_ATTEMPTS {
                debug!(kind = %item.kind, attempts = item.attempts, "dropping undeliverable item");
                dropped += 1;
                continue;
            }
            let queue = inner.queue_mut(item.kind);
            if queue.has_room() {
                queue.items.push_front(item);
            } else {
                dropped += 1;
            }
        }

        // These items were counted as flushed on the way out; they are back
        // (or gone), so the conservation ledger takes them off again.
        inner.counters.total_flushed = inner.counters.total_flushed.saturating_sub(returned);
        inner.counters.drop_count += dropped;
    }

    /// Pull up to `max_files` spill files back into memory. A file is
    /// re-ingested whole or not at all: the first file that does not fit
    /// stays on disk untouched and recovery stops, so recovery can never
    /// push a queue past its capacity.
    pub async fn recover(&self, max_files: usize) -> usize {
        let store = Arc::clone(&self.store);
        let batches = match tokio::task::spawn_blocking(move || store.recover(max_files)).await {
            Ok(Ok(batches)) => batches,
            Ok(Err(err)) => {
                warn!(error = %err, "spill recovery failed");
                return 0;
            }
            Err(err) => {
                warn!(error = %err, "spill recovery task aborted");
                return 0;
            }
        };

        let mut recovered = 0;
        for batch in batches {
            let accepted = {
                let mut inner = self.lock();
                let now = self.clock.now_wall();
                let queue = inner.queue_mut(batch.kind);
                let room = queue.capacity - queue.items.len();
                if batch.payloads.len() > room {
                    false
                } else {
                    for payload in &batch.payloads {
                        queue.items.push_back(Item::new(batch.kind, payload.clone(), now));
                    }
                    inner.counters.items_recovered += batch.payloads.len() as u64;
                    true
                }
            };
            if !accepted {
                debug!(kind = %batch.kind, items = batch.payloads.len(), "queue full, leaving spill file on disk");
                break;
            }

            recovered += batch.payloads.len();
            let store = Arc::clone(&self.store);
            if let Err(err) =
                tokio::task::spawn_blocking(move || store.remove(&batch)).await.unwrap_or(Ok(()))
            {
                warn!(error = %err, "failed to delete recovered spill file");
            }
        }
        recovered
    }

    pub fn len(&self, kind: StreamKind) -> usize {
        self.lock().queue(kind).items.len()
    }

    /// Total items currently in memory across all kinds.
    pub fn total_len(&self) -> usize {
        let inner = self.lock();
        StreamKind::ALL.iter().map(|kind| inner.queue(*kind).items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            total_added: inner.counters.total_added,
            total_flushed: inner.counters.total_flushed,
            spill_count: inner.counters.spill_count,
            drop_count: inner.counters.drop_count,
            dropped_to_disk: self.store.evicted_items(),
            items_spilled: inner.counters.items_spilled,
            items_recovered: inner.counters.items_recovered,
            queue_lengths: StreamKind::ALL
                .iter()
                .map(|kind| (kind.as_str().to_string(), inner.queue(*kind).items.len()))
                .collect(),
        }
    }

    pub fn spill_stats(&self) -> SpillStats {
        self.store.stats()
    }

    fn spill_quota(&self, capacity: usize) -> usize {
        ((capacity as f64 * self.spill_fraction) as usize).min(MAX_ITEMS_PER_SPILL)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
