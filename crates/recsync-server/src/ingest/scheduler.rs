//! Sync scheduler
//!
//! Fires a fetch cycle every `interval`, whether or not earlier cycles have
//! finished. Cycles may overlap; nothing serializes them. The first cycle
//! fires one interval after start, and ticks missed while the runtime was busy
//! are skipped rather than replayed in a burst.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::coordinator::{CycleReport, FetchCoordinator};

/// Periodic driver for a [`FetchCoordinator`]
pub struct SyncScheduler {
    interval: Duration,
    coordinator: Arc<FetchCoordinator>,
    reports: Option<mpsc::UnboundedSender<CycleReport>>,
}

impl SyncScheduler {
    pub fn new(interval: Duration, coordinator: Arc<FetchCoordinator>) -> Self {
        Self {
            interval,
            coordinator,
            reports: None,
        }
    }

    /// Send every finished cycle's report to `sink`.
    pub fn with_report_sink(mut self, sink: mpsc::UnboundedSender<CycleReport>) -> Self {
        self.reports = Some(sink);
        self
    }

    /// Start the scheduler in background
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Tick until `shutdown` is cancelled.
    ///
    /// Cycles still running at shutdown are detached and left to finish on
    /// their own.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Sync scheduler started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycles = JoinSet::new();
        let mut cycle_id = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    cycle_id += 1;
                    cycles.spawn(run_cycle(
                        Arc::clone(&self.coordinator),
                        cycle_id,
                        self.reports.clone(),
                    ));
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Sync cycle task failed");
                    }
                }
            }
        }

        info!(in_flight = cycles.len(), "Sync scheduler stopped");
        cycles.detach_all();
    }
}

async fn run_cycle(
    coordinator: Arc<FetchCoordinator>,
    cycle_id: u64,
    reports: Option<mpsc::UnboundedSender<CycleReport>>,
) {
    info!(cycle_id, "Fetching data from API...");
    let started = Instant::now();

    let report = coordinator.run_cycle(cycle_id).await;

    info!(
        cycle_id,
        pages_fetched = report.pages_fetched,
        pages_failed = report.pages_failed,
        batches_published = report.batches_published,
        batches_dropped = report.batches_dropped,
        records = report.records_fetched,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Sync completed!"
    );

    if let Some(reports) = reports {
        let _ = reports.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::ingest::coordinator::FetchSettings;
    use crate::ingest::source::RecordSource;
    use crate::queue::{MemoryBroker, QueueHandle, QueuePublisher};
    use async_trait::async_trait;
    use recsync_common::{Batch, PageRequest, Record};

    struct OneRecord;

    #[async_trait]
    impl RecordSource for OneRecord {
        async fn fetch(&self, page: PageRequest) -> Result<Batch, SourceError> {
            Ok(Batch::new(vec![Record::new(i64::from(page.page), "n", "e", "p")]))
        }
    }

    fn coordinator() -> Arc<FetchCoordinator> {
        let broker = Arc::new(MemoryBroker::new());
        Arc::new(FetchCoordinator::new(
            Arc::new(OneRecord),
            QueuePublisher::new(QueueHandle::new(broker, "q")),
            FetchSettings {
                batch_size: 1,
                total_rows: 2,
                fetch_delay: Duration::ZERO,
                max_concurrent_fetches: 2,
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_fires_after_one_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let handle = SyncScheduler::new(Duration::from_secs(10), coordinator())
            .with_report_sink(tx)
            .start(shutdown.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.cycle_id, 1);
        assert_eq!(first.batches_published, 2);
        assert!(started.elapsed() >= Duration::from_secs(10));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.cycle_id, 2);
        assert!(started.elapsed() >= Duration::from_secs(20));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_tick_runs_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = SyncScheduler::new(Duration::from_secs(10), coordinator())
            .with_report_sink(tx)
            .start(shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();

        assert!(rx.recv().await.is_none());
    }
}
