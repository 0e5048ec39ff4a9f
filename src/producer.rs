//! Producer tasks: periodic collectors feeding the buffer.
//!
//! A producer is a plain descriptor: name, cadence, and a closure that
//! performs one collection cycle. The closure captures the buffer handle
//! and whatever collaborator state it needs; the pipeline never inspects
//! it. Failures are isolated: a producer can error every single cycle and
//! still never take the task down.

use crate::sleeper::Sleeper;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How one collection cycle can fail.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Missing privileges (Docker socket, `/proc`, system log dirs).
    /// Routine on hardened hosts; logged at debug, never counted.
    #[error("permission denied: {0}")]
    Denied(String),
    /// Anything else. Counted and logged, never fatal.
    #[error("collection failed: {0}")]
    Failed(String),
}

impl From<std::io::Error> for CollectError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            CollectError::Denied(err.to_string())
        } else {
            CollectError::Failed(err.to_string())
        }
    }
}

pub type CollectFuture = BoxFuture<'static, Result<(), CollectError>>;

/// Descriptor for one periodic collector.
#[derive(Clone)]
pub struct Producer {
    name: String,
    interval: Duration,
    collect: Arc<dyn Fn() -> CollectFuture + Send + Sync>,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Producer {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        collect: impl Fn() -> CollectFuture + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), interval, collect: Arc::new(collect) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Drive one producer until cancellation. Cancellation during the sleep is
/// immediate; a cycle that was already running finishes, but no new cycle
/// starts afterwards.
pub(crate) async fn run_producer(
    producer: Producer,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    error_count: Arc<AtomicU64>,
) {
    info!(
        producer = %producer.name,
        interval_secs = producer.interval.as_secs_f64(),
        "producer started"
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = (producer.collect)() => result,
        };
        match result {
            Ok(()) => {}
            Err(CollectError::Denied(message)) => {
                debug!(producer = %producer.name, %message, "collection skipped, permission denied");
            }
            Err(CollectError::Failed(message)) => {
                error_count.fetch_add(1, Ordering::Relaxed);
                warn!(producer = %producer.name, %message, "collection failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleeper.sleep(producer.interval) => {}
        }
    }

    debug!(producer = %producer.name, "producer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TokioSleeper};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn producer_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let producer = {
            let runs = Arc::clone(&runs);
            let cancel = cancel.clone();
            Producer::new("ticker", Duration::from_millis(1), move || {
                let runs = Arc::clone(&runs);
                let cancel = cancel.clone();
                Box::pin(async move {
                    if runs.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                        cancel.cancel();
                    }
                    Ok(())
                })
            })
        };

        run_producer(
            producer,
            Arc::new(InstantSleeper),
            cancel,
            Arc::new(AtomicU64::new(0)),
        )
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_are_counted_but_not_fatal() {
        let runs = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let producer = {
            let runs = Arc::clone(&runs);
            let cancel = cancel.clone();
            Producer::new("flaky", Duration::from_millis(1), move || {
                let runs = Arc::clone(&runs);
                let cancel = cancel.clone();
                Box::pin(async move {
                    let n = runs.fetch_add(1, Ordering::SeqCst);
                    if n + 1 >= 4 {
                        cancel.cancel();
                    }
                    Err(CollectError::Failed(format!("boom {n}")))
                })
            })
        };

        run_producer(producer, Arc::new(InstantSleeper), cancel, Arc::clone(&errors)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 4, "task must outlive its errors");
        assert_eq!(errors.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permission_denials_are_not_counted() {
        let errors = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let producer = {
            let cancel = cancel.clone();
            Producer::new("restricted", Duration::from_millis(1), move || {
                let cancel = cancel.clone();
                Box::pin(async move {
                    cancel.cancel();
                    Err(CollectError::Denied("/proc/net/tcp".into()))
                })
            })
        };

        run_producer(producer, Arc::new(InstantSleeper), cancel, Arc::clone(&errors)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_during_sleep_emits_no_final_sample() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let producer = {
            let runs = Arc::clone(&runs);
            Producer::new("slow", Duration::from_secs(600), move || {
                let runs = Arc::clone(&runs);
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        let handle = tokio::spawn(run_producer(
            producer,
            Arc::new(TokioSleeper),
            cancel.clone(),
            Arc::new(AtomicU64::new(0)),
        ));

        // Let the first cycle land, then cancel mid-sleep.
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn io_permission_errors_map_to_denied() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "docker.sock");
        assert!(matches!(CollectError::from(err), CollectError::Denied(_)));

        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(matches!(CollectError::from(err), CollectError::Failed(_)));
    }
}
