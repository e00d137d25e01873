use std::sync::Arc;
use std::time::Duration;

use prometheus::IntGauge;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Backend;
use super::Revision;
use super::StorageResult;

/// Revisions kept behind the head so that briefly disconnected watchers can
/// resume without a relist.
pub const RETAINED_REVISIONS: Revision = 1000;

/// Periodically discards history older than [`RETAINED_REVISIONS`].
///
/// Each pass advances the compacted revision by at most `batch_size`, so a
/// large backlog is worked off over several intervals instead of one long
/// write transaction.
pub struct Compactor {
    backend: Arc<dyn Backend>,
    interval: Duration,
    batch_size: i64,
    revision_gauge: Option<IntGauge>,
    compacted_gauge: Option<IntGauge>,
}

impl Compactor {
    pub fn new(backend: Arc<dyn Backend>, interval: Duration, batch_size: i64) -> Self {
        Self {
            backend,
            interval,
            batch_size: batch_size.max(1),
            revision_gauge: None,
            compacted_gauge: None,
        }
    }

    /// Reports the head and compacted revisions after every pass.
    pub fn with_gauges(mut self, revision: IntGauge, compacted: IntGauge) -> Self {
        self.revision_gauge = Some(revision);
        self.compacted_gauge = Some(compacted);
        self
    }

    /// Runs one compaction pass, returning the compacted revision afterwards.
    pub async fn compact_once(&self) -> StorageResult<Revision> {
        let current = self.backend.current_revision().await?;
        let compacted = self.backend.compacted_revision().await?;
        let target = compacted
            .saturating_add(self.batch_size)
            .min(current.saturating_sub(RETAINED_REVISIONS));

        let compacted = if target > compacted {
            let effective = self.backend.compact(target).await?;
            debug!(from = compacted, to = effective, current, "compacted storage history");
            effective
        } else {
            compacted
        };

        if let Some(gauge) = &self.revision_gauge {
            gauge.set(current);
        }
        if let Some(gauge) = &self.compacted_gauge {
            gauge.set(compacted);
        }
        Ok(compacted)
    }

    pub async fn run(self, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        info!(interval = ?self.interval, batch_size = self.batch_size, "starting compactor");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.compact_once().await {
                        warn!(error = ?e, "compaction pass failed");
                    }
                }
            }
        }
        info!("compactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::storage::MemoryBackend;

    async fn backend_with_revisions(count: usize) -> Arc<dyn Backend> {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend
            .create("/k", b"0".to_vec())
            .await
            .expect("create");
        for i in 1..count {
            let current = backend.current_revision().await.expect("revision");
            backend
                .update("/k", current, i.to_string().into_bytes())
                .await
                .expect("update");
        }
        backend
    }

    #[tokio::test]
    async fn keeps_recent_history() {
        let backend = backend_with_revisions(500).await;
        let compactor = Compactor::new(backend.clone(), Duration::from_secs(60), 1000);

        let compacted = compactor.compact_once().await.expect("compact");

        assert_eq!(compacted, 0, "nothing is old enough to discard");
    }

    #[tokio::test]
    async fn advances_in_batches() {
        // Arrange
        let backend = backend_with_revisions(1300).await;
        let compactor = Compactor::new(backend.clone(), Duration::from_secs(60), 200);
        let revision = IntGauge::new("rev", "rev").expect("gauge");
        let compacted_gauge = IntGauge::new("compacted", "compacted").expect("gauge");
        let compactor = compactor.with_gauges(revision.clone(), compacted_gauge.clone());

        // Act
        let first = compactor.compact_once().await.expect("first pass");
        let second = compactor.compact_once().await.expect("second pass");

        // Assert
        assert_eq!(first, 200);
        assert_eq!(second, 300, "bounded by the retained window");
        assert_eq!(revision.get(), 1300);
        assert_eq!(compacted_gauge.get(), 300);
    }

    #[tokio::test]
    async fn oversized_batch_stops_at_retained_window() {
        let backend = backend_with_revisions(1300).await;
        let compactor = Compactor::new(backend.clone(), Duration::from_secs(60), i64::MAX);

        let compacted = compactor.compact_once().await.expect("compact");

        assert_eq!(compacted, 300);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let backend = backend_with_revisions(1).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            Compactor::new(backend, Duration::from_millis(10), 10).run(token.clone()),
        );

        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("compactor exits promptly")
            .expect("task does not panic");
    }
}
