//! Batch publisher

use recsync_common::Batch;
use tracing::{debug, error};

use super::QueueHandle;
use crate::error::QueueResult;

/// Publishes whole batches to one queue.
#[derive(Clone, Debug)]
pub struct QueuePublisher {
    queue: QueueHandle,
}

impl QueuePublisher {
    pub fn new(queue: QueueHandle) -> Self {
        Self { queue }
    }

    /// Serialize the batch and publish it as a single message.
    ///
    /// Serialization completes before the broker is touched, so a failure
    /// never leaves part of a batch on the queue.
    pub async fn publish(&self, batch: &Batch) -> QueueResult<i64> {
        let payload = batch.to_payload()?;
        let bytes = payload.len();
        let id = self
            .queue
            .broker()
            .publish(self.queue.name(), payload)
            .await?;

        debug!(
            queue = self.queue.name(),
            delivery_id = id,
            records = batch.len(),
            bytes,
            "Batch published"
        );

        Ok(id)
    }

    /// Publish, or log and drop the batch. Never retries.
    ///
    /// Returns whether the batch reached the broker.
    pub async fn publish_or_drop(&self, batch: &Batch) -> bool {
        match self.publish(batch).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    queue = self.queue.name(),
                    records = batch.len(),
                    error = %e,
                    "Queue publish error, dropping batch"
                );
                false
            },
        }
    }
}
