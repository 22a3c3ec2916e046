//! Fetch coordinator
//!
//! One cycle partitions the target volume into pages, fetches them
//! concurrently and forwards every fetched batch to the publisher.
//!
//! Fan-in discipline:
//! - every fetch task owns a clone of the channel sender, and the coordinator
//!   drops its own clone once all tasks are spawned, so the channel closes
//!   exactly when the last producer finishes;
//! - a single drain task forwards batches until `recv` returns `None`;
//! - the cycle only completes after all fetch tasks and then the drain task
//!   have been joined.

use recsync_common::{Batch, PageRequest};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::source::RecordSource;
use crate::config::SyncConfig;
use crate::queue::QueuePublisher;

/// Cycle parameters, fixed at construction.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub batch_size: u32,
    pub total_rows: u64,
    /// Pause each fetch task takes after its page, to throttle the source.
    pub fetch_delay: Duration,
    pub max_concurrent_fetches: usize,
}

impl From<&SyncConfig> for FetchSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            total_rows: config.total_rows,
            fetch_delay: config.fetch_delay(),
            max_concurrent_fetches: config.max_concurrent_fetches,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub pages_requested: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub batches_published: usize,
    pub batches_dropped: usize,
    pub records_fetched: usize,
}

enum PageOutcome {
    Fetched(usize),
    Failed,
}

pub struct FetchCoordinator {
    source: Arc<dyn RecordSource>,
    publisher: QueuePublisher,
    settings: FetchSettings,
}

impl FetchCoordinator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        publisher: QueuePublisher,
        settings: FetchSettings,
    ) -> Self {
        Self {
            source,
            publisher,
            settings,
        }
    }

    /// Run one fetch cycle to completion.
    ///
    /// Never fails: a page that cannot be fetched is logged and left out, a
    /// batch that cannot be published is logged and dropped.
    pub async fn run_cycle(&self, cycle_id: u64) -> CycleReport {
        let pages = PageRequest::partition(self.settings.total_rows, self.settings.batch_size);
        let concurrency = self.settings.max_concurrent_fetches.max(1);
        let mut report = CycleReport {
            cycle_id,
            pages_requested: pages.len(),
            ..CycleReport::default()
        };

        debug!(cycle_id, pages = pages.len(), concurrency, "Starting fetch cycle");

        let (tx, rx) = mpsc::channel::<Batch>(concurrency);
        let forwarder = tokio::spawn(drain(self.publisher.clone(), rx));

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut fetches = JoinSet::new();
        for page in pages {
            let source = Arc::clone(&self.source);
            let permits = Arc::clone(&permits);
            let tx = tx.clone();
            let delay = self.settings.fetch_delay;

            fetches.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return PageOutcome::Failed;
                };

                let outcome = match source.fetch(page).await {
                    Ok(batch) => {
                        let records = batch.len();
                        if tx.send(batch).await.is_err() {
                            warn!(cycle_id, %page, "Forwarder gone, batch lost");
                        }
                        PageOutcome::Fetched(records)
                    },
                    Err(e) => {
                        error!(cycle_id, %page, error = %e, "API Error");
                        PageOutcome::Failed
                    },
                };

                tokio::time::sleep(delay).await;
                outcome
            });
        }
        // Only the fetch tasks hold senders now.
        drop(tx);

        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(PageOutcome::Fetched(records)) => {
                    report.pages_fetched += 1;
                    report.records_fetched += records;
                },
                Ok(PageOutcome::Failed) => report.pages_failed += 1,
                Err(e) => {
                    error!(cycle_id, error = %e, "Page fetch task failed");
                    report.pages_failed += 1;
                },
            }
        }

        match forwarder.await {
            Ok((published, dropped)) => {
                report.batches_published = published;
                report.batches_dropped = dropped;
            },
            Err(e) => error!(cycle_id, error = %e, "Batch forwarder failed"),
        }

        report
    }
}

/// Forward batches to the publisher until every sender is gone.
async fn drain(publisher: QueuePublisher, mut rx: mpsc::Receiver<Batch>) -> (usize, usize) {
    let mut published = 0;
    let mut dropped = 0;
    while let Some(batch) = rx.recv().await {
        if publisher.publish_or_drop(&batch).await {
            published += 1;
        } else {
            dropped += 1;
        }
    }
    (published, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::queue::{MemoryBroker, QueueHandle};
    use async_trait::async_trait;
    use recsync_common::Record;

    /// Returns `size` records per page, ids offset by page.
    struct Paged;

    #[async_trait]
    impl RecordSource for Paged {
        async fn fetch(&self, page: PageRequest) -> Result<Batch, SourceError> {
            let base = i64::from(page.page) * i64::from(page.size);
            Ok((0..i64::from(page.size))
                .map(|i| Record::new(base + i, "n", "e", "p"))
                .collect::<Vec<_>>()
                .into())
        }
    }

    fn settings(batch_size: u32, total_rows: u64) -> FetchSettings {
        FetchSettings {
            batch_size,
            total_rows,
            fetch_delay: Duration::ZERO,
            max_concurrent_fetches: 4,
        }
    }

    #[tokio::test]
    async fn test_cycle_publishes_one_batch_per_page() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = QueuePublisher::new(QueueHandle::new(broker.clone(), "q"));
        let coordinator = FetchCoordinator::new(Arc::new(Paged), publisher, settings(2, 5));

        let report = coordinator.run_cycle(1).await;

        assert_eq!(report.pages_requested, 3);
        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.batches_published, 3);
        assert_eq!(report.records_fetched, 6);
        assert_eq!(broker.ready_payloads("q").len(), 3);
    }

    #[tokio::test]
    async fn test_empty_volume_completes_without_fetching() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = QueuePublisher::new(QueueHandle::new(broker.clone(), "q"));
        let coordinator = FetchCoordinator::new(Arc::new(Paged), publisher, settings(10, 0));

        let report = coordinator.run_cycle(7).await;

        assert_eq!(
            report,
            CycleReport {
                cycle_id: 7,
                ..CycleReport::default()
            }
        );
    }

    #[tokio::test]
    async fn test_publish_failures_are_counted_as_dropped() {
        let broker = Arc::new(MemoryBroker::disconnected());
        let publisher = QueuePublisher::new(QueueHandle::new(broker.clone(), "q"));
        let coordinator = FetchCoordinator::new(Arc::new(Paged), publisher, settings(2, 4));

        let report = coordinator.run_cycle(1).await;

        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.batches_published, 0);
        assert_eq!(report.batches_dropped, 2);
    }
}
