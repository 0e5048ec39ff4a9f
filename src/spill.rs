//! On-disk overflow for the telemetry buffer.
//!
//! Each spill is one gzip-compressed JSON array of payloads, named so that
//! lexicographic order matches creation order:
//!
//! ```text
//! {kind}_YYYY_MM_DD__HH_MM_SS_{unix_seconds}.{micros}.json.gz
//! ```
//!
//! Writes are atomic (temp file + rename) and never leave the directory
//! over its byte budget: the budget is `min(max_bytes, free_space ×
//! max_disk_ratio)`, and old files are evicted down to 80 % of it before a
//! new file lands. Evictions are counted at both file and item level, so
//! telemetry lost to disk pressure is visible in stats. Recovery hands files back newest-first, so the freshest
//! telemetry returns to memory first after an outage. Corrupt or
//! foreign-named files are deleted on sight and counted, never reported as
//! data.
//!
//! The store assumes a single writer and a single reader; the buffer
//! serialises access to it.

use crate::clock::Clock;
use crate::stream::StreamKind;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

const SPILL_SUFFIX: &str = ".json.gz";
/// Eviction drains the directory to this fraction of the budget so one
/// overflow burst does not trigger an eviction per write.
const EVICTION_TARGET: f64 = 0.8;

#[derive(Debug, Error)]
pub enum SpillError {
    #[error("spill i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("spill encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("spill budget exhausted: need {needed} bytes, budget is {budget}")]
    BudgetExhausted { needed: u64, budget: u64 },
}

/// One recovered file's contents, plus the handle needed to delete it once
/// the caller has accepted the payloads.
#[derive(Debug)]
pub struct RecoveredBatch {
    pub kind: StreamKind,
    pub payloads: Vec<Value>,
    pub(crate) path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpillStats {
    pub files: u64,
    pub bytes_on_disk: u64,
    pub evicted_files: u64,
    /// Items inside evicted files: telemetry lost to disk pressure.
    pub evicted_items: u64,
    pub corrupt_files: u64,
}

#[derive(Debug)]
pub struct SpillStore {
    dir: PathBuf,
    max_bytes: u64,
    max_disk_ratio: f64,
    clock: Arc<dyn Clock>,
    evicted_files: AtomicU64,
    evicted_items: AtomicU64,
    corrupt_files: AtomicU64,
}

impl SpillStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        max_disk_ratio: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            max_disk_ratio,
            clock,
            evicted_files: AtomicU64::new(0),
            evicted_items: AtomicU64::new(0),
            corrupt_files: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one compressed spill file, evicting oldest files first if the
    /// byte budget demands it.
    pub fn write(&self, kind: StreamKind, payloads: &[Value]) -> Result<PathBuf, SpillError> {
        if payloads.is_empty() {
            return Err(SpillError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "refusing to spill an empty batch",
            )));
        }
        self.ensure_dir()?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serde_json::to_vec(payloads)?)?;
        let compressed = encoder.finish()?;
        let needed = compressed.len() as u64;

        let budget = self.budget();
        let current = self.bytes_on_disk();
        if current + needed > budget {
            self.evict_until(needed, budget)?;
        }
        let current = self.bytes_on_disk();
        if current + needed > budget {
            return Err(SpillError::BudgetExhausted { needed, budget });
        }

        let path = self.unique_path(kind);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &compressed)?;
        fs::rename(&tmp, &path)?;

        debug!(kind = %kind, items = payloads.len(), bytes = needed, file = %path.display(), "spill file written");
        Ok(path)
    }

    /// Read up to `max_files` spill files, newest first. Files stay on disk
    /// until [`remove`](Self::remove); corrupt files are deleted here and
    /// counted.
    pub fn recover(&self, max_files: usize) -> Result<Vec<RecoveredBatch>, SpillError> {
        if !self.dir.exists() || max_files == 0 {
            return Ok(Vec::new());
        }

        let mut files = self.list()?;
        // Newest first: LIFO recovery keeps dashboards current after an
        // outage; the oldest data follows later.
        files.sort_by(|a, b| (&b.1, &b.0).cmp(&(&a.1, &a.0)));

        let mut batches = Vec::new();
        for (path, _mtime, _len) in files.into_iter().take(max_files) {
            match self.read_file(&path) {
                Ok((kind, payloads)) => {
                    batches.push(RecoveredBatch { kind, payloads, path });
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "dropping unreadable spill file");
                    self.corrupt_files.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = fs::remove_file(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!(file = %path.display(), error = %err, "failed to delete corrupt spill file");
                        }
                    }
                }
            }
        }
        Ok(batches)
    }

    /// Delete a recovered file after its contents have been accepted.
    pub fn remove(&self, batch: &RecoveredBatch) -> Result<(), SpillError> {
        match fs::remove_file(&batch.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn file_count(&self) -> u64 {
        self.list().map(|files| files.len() as u64).unwrap_or(0)
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.list()
            .map(|files| files.iter().map(|(_, _, len)| len).sum())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> SpillStats {
        let files = self.list().unwrap_or_default();
        SpillStats {
            files: files.len() as u64,
            bytes_on_disk: files.iter().map(|(_, _, len)| len).sum(),
            evicted_files: self.evicted_files.load(Ordering::Relaxed),
            evicted_items: self.evicted_items.load(Ordering::Relaxed),
            corrupt_files: self.corrupt_files.load(Ordering::Relaxed),
        }
    }

    /// Items lost to disk-pressure eviction so far.
    pub fn evicted_items(&self) -> u64 {
        self.evicted_items.load(Ordering::Relaxed)
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o755));
        }
        Ok(())
    }

    /// Byte budget: the configured cap, further bounded by what the
    /// filesystem can spare. Falls back to the cap when statfs fails.
    fn budget(&self) -> u64 {
        match fs2::available_space(&self.dir) {
            Ok(free) => self.max_bytes.min((free as f64 * self.max_disk_ratio) as u64),
            Err(err) => {
                debug!(error = %err, "could not read free space, using configured cap");
                self.max_bytes
            }
        }
    }

    fn evict_until(&self, needed: u64, budget: u64) -> Result<(), SpillError> {
        let mut files = self.list()?;
        // Oldest first: pressure reclaims the stalest data.
        files.sort_by(|a, b| (&a.1, &a.0).cmp(&(&b.1, &b.0)));

        let target = (budget as f64 * EVICTION_TARGET) as u64;
        let mut remaining: u64 = files.iter().map(|(_, _, len)| len).sum();
        let mut evicted = 0u64;
        let mut items_lost = 0u64;

        for (path, _mtime, len) in files {
            if remaining + needed <= target {
                break;
            }
            // Count the contents before deleting so the loss shows up in
            // item-level stats, not just a file count.
            let contents = self
                .read_file(&path)
                .map(|(_, payloads)| payloads.len() as u64)
                .unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    remaining = remaining.saturating_sub(len);
                    evicted += 1;
                    items_lost += contents;
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "failed to evict spill file");
                }
            }
        }

        if evicted > 0 {
            self.evicted_files.fetch_add(evicted, Ordering::Relaxed);
            self.evicted_items.fetch_add(items_lost, Ordering::Relaxed);
            warn!(
                evicted,
                items_lost,
                remaining_bytes = remaining,
                "evicted spill files to reclaim disk"
            );
        }
        Ok(())
    }

    fn list(&self) -> std::io::Result<Vec<(PathBuf, SystemTime, u64)>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_spill = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(SPILL_SUFFIX));
            if !is_spill {
                continue;
            }
            let meta = entry.metadata()?;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, mtime, meta.len()));
        }
        Ok(files)
    }

    fn read_file(&self, path: &Path) -> Result<(StreamKind, Vec<Value>), SpillError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let kind = StreamKind::from_prefix(name).ok_or_else(|| {
            SpillError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognised spill file name {name}"),
            ))
        })?;

        let mut decoder = GzDecoder::new(fs::File::open(path)?);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        let payloads: Vec<Value> = serde_json::from_slice(&raw)?;
        Ok((kind, payloads))
    }

    fn unique_path(&self, kind: StreamKind) -> PathBuf {
        let wall = self.clock.now_wall();
        let stamp: DateTime<Utc> = wall.into();
        let unix = wall
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();

        let mut micros = unix.subsec_micros();
        loop {
            let name = format!(
                "{}_{}_{}.{:06}{}",
                kind,
                stamp.format("%Y_%m_%d__%H_%M_%S"),
                unix.as_secs(),
                micros,
                SPILL_SUFFIX,
            );
            let path = self.dir.join(name);
            if !path.exists() {
                return path;
            }
            micros = micros.wrapping_add(1);
        }
    }
}
