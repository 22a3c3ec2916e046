//! Worker runtime
//!
//! Binds a [`BatchWriter`] to a queue consumer. For every delivery:
//! 1. decode the payload into a batch, rejecting the delivery if that fails;
//! 2. write the batch;
//! 3. ack, whatever the write reported.
//!
//! Row and commit failures are already logged by the writer and are not a
//! reason for redelivery.

use async_trait::async_trait;
use recsync_common::Batch;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::writer::BatchWriter;
use crate::queue::{ConsumerConfig, ConsumerHandle, Delivery, DeliveryHandler, QueueConsumer, QueueHandle};

/// Consumer identity unique per process start: `data_worker-{host}-{unix_ts}`.
pub fn consumer_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("data_worker-{}-{}", host, chrono::Utc::now().timestamp())
}

/// Delivery handler that decodes, writes and acks.
pub struct BatchConsumer {
    writer: Arc<dyn BatchWriter>,
}

impl BatchConsumer {
    pub fn new(writer: Arc<dyn BatchWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl DeliveryHandler for BatchConsumer {
    async fn handle(&self, delivery: Delivery) {
        let batch = match Batch::from_payload(delivery.payload()) {
            Ok(batch) => batch,
            Err(e) => {
                error!(delivery_id = delivery.id(), error = %e, "Queue Unmarshal Error");
                let id = delivery.id();
                if let Err(e) = delivery.reject().await {
                    warn!(delivery_id = id, error = %e, "Failed to reject delivery");
                }
                return;
            },
        };

        let report = self.writer.write(&batch).await;
        debug!(
            delivery_id = delivery.id(),
            inserted = report.inserted,
            duplicates = report.duplicates,
            failed = report.failed,
            committed = report.committed,
            "Batch processed"
        );

        let id = delivery.id();
        if let Err(e) = delivery.ack().await {
            warn!(delivery_id = id, error = %e, "Failed to ack delivery");
        }
    }
}

/// Owns the consumer identity and starts the consume loop.
pub struct WorkerRuntime {
    queue: QueueHandle,
    writer: Arc<dyn BatchWriter>,
    config: ConsumerConfig,
    consumer_name: String,
}

impl WorkerRuntime {
    pub fn new(queue: QueueHandle, writer: Arc<dyn BatchWriter>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            writer,
            config,
            consumer_name: consumer_identity(),
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Register and consume in background until `shutdown` is cancelled.
    ///
    /// Registration is retried on a fixed backoff until the broker answers.
    pub fn start(self, shutdown: CancellationToken) -> ConsumerHandle {
        let handler = Arc::new(BatchConsumer::new(self.writer));
        QueueConsumer::new(self.queue, self.consumer_name, self.config).start(handler, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_identity_format() {
        let name = consumer_identity();
        assert!(name.starts_with("data_worker-"));

        let ts = name.rsplit('-').next().unwrap();
        assert!(ts.parse::<i64>().unwrap() > 1_600_000_000);
    }
}
