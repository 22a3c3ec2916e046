//! Durable at-least-once hand-off between fetching and persistence
//!
//! # Architecture
//!
//! - **Broker**: the storage contract for named queues. A message is `ready`
//!   until a consumer reserves it, `unacked` while that consumer holds it, and
//!   is removed on ack or moved to the queue's `rejected` list on reject.
//! - **QueueHandle**: an owned handle to one named queue on one broker. There
//!   is no process-global connection; every component receives a handle.
//! - **QueuePublisher**: serializes a whole batch, then publishes it as one
//!   message.
//! - **QueueConsumer**: registers a consumer identity, polls with a prefetch
//!   limit and hands deliveries to a [`DeliveryHandler`] one at a time.
//!
//! Two brokers are provided: [`PgBroker`] (durable, Postgres tables) and
//! [`MemoryBroker`] (in-process).
//!
//! Unacknowledged deliveries return to `ready` when their consumer stops, when
//! a dropped [`Delivery`] is requeued, or when a later consumer cleans up
//! registrations whose heartbeat went stale.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueResult;

pub mod consumer;
pub mod memory;
pub mod postgres;
pub mod publisher;

pub use consumer::{
    ConsumerConfig, ConsumerHandle, ConsumerState, ConsumerStatus, Delivery, DeliveryHandler,
    QueueConsumer,
};
pub use memory::MemoryBroker;
pub use postgres::PgBroker;
pub use publisher::QueuePublisher;

/// A message reserved for one consumer, before it is wrapped in a [`Delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedMessage {
    pub id: i64,
    pub payload: Vec<u8>,
}

/// Message counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub unacked: u64,
    pub rejected: u64,
    pub consumers: u64,
}

/// Storage contract for named queues.
///
/// Every operation is scoped to a queue name. Operations that settle a
/// delivery also take the consumer name, so a consumer whose delivery was
/// reclaimed and handed to someone else cannot settle it any more.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Cheap connectivity check
    async fn ping(&self) -> QueueResult<()>;

    /// Register (or re-register) a consumer and stamp its heartbeat.
    async fn register_consumer(&self, queue: &str, consumer: &str) -> QueueResult<()>;

    async fn heartbeat(&self, queue: &str, consumer: &str) -> QueueResult<()>;

    async fn unregister_consumer(&self, queue: &str, consumer: &str) -> QueueResult<()>;

    /// Append one message to the ready list. Returns the delivery id.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<i64>;

    /// Move up to `max` ready messages, oldest first, to the consumer's
    /// unacked set.
    async fn reserve(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
    ) -> QueueResult<Vec<ReservedMessage>>;

    /// Remove an unacked message for good.
    async fn ack(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()>;

    /// Move an unacked message to the rejected list.
    async fn reject(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()>;

    /// Put one unacked message back on the ready list.
    async fn requeue(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()>;

    /// Put every message unacked by `consumer` back on the ready list.
    async fn return_unacked(&self, queue: &str, consumer: &str) -> QueueResult<u64>;

    /// Move up to `max` rejected messages back to the ready list.
    async fn return_rejected(&self, queue: &str, max: usize) -> QueueResult<u64>;

    /// Drop consumers whose last heartbeat is older than `stale_after` and
    /// return their unacked messages. Returns the number of messages returned.
    async fn clean_stale_consumers(&self, queue: &str, stale_after: Duration)
        -> QueueResult<u64>;

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats>;
}

/// Owned handle to one named queue.
#[derive(Clone)]
pub struct QueueHandle {
    broker: Arc<dyn Broker>,
    name: Arc<str>,
}

impl QueueHandle {
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<Arc<str>>) -> Self {
        Self {
            broker,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.broker.stats(&self.name).await
    }

    /// Give rejected messages another chance.
    pub async fn return_rejected(&self, max: usize) -> QueueResult<u64> {
        self.broker.return_rejected(&self.name, max).await
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name).finish()
    }
}
