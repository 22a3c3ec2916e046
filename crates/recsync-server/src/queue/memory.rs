//! In-process broker
//!
//! Same semantics as the Postgres broker, minus durability. Used by the test
//! suite and by `BROKER_KIND=memory` for local runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::{Broker, QueueStats, ReservedMessage};
use crate::error::{QueueError, QueueResult};

#[derive(Debug)]
struct Unacked {
    consumer: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    ready: VecDeque<(i64, Vec<u8>)>,
    unacked: BTreeMap<i64, Unacked>,
    rejected: VecDeque<(i64, Vec<u8>)>,
    consumers: HashMap<String, Instant>,
}

impl QueueState {
    fn settle(&mut self, consumer: &str, delivery_id: i64) -> QueueResult<Vec<u8>> {
        match self.unacked.get(&delivery_id) {
            Some(entry) if entry.consumer == consumer => self
                .unacked
                .remove(&delivery_id)
                .map(|entry| entry.payload)
                .ok_or(QueueError::UnknownDelivery(delivery_id)),
            _ => Err(QueueError::UnknownDelivery(delivery_id)),
        }
    }

    /// Return the given unacked ids to the front of the ready list, oldest
    /// first, so redeliveries go out before newer messages.
    fn return_to_ready(&mut self, ids: Vec<i64>) -> u64 {
        let mut returned = 0;
        for id in ids.into_iter().rev() {
            if let Some(entry) = self.unacked.remove(&id) {
                self.ready.push_front((id, entry.payload));
                returned += 1;
            }
        }
        returned
    }

    fn unacked_by(&self, consumer: &str) -> Vec<i64> {
        self.unacked
            .iter()
            .filter(|(_, entry)| entry.consumer == consumer)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Broker that keeps every queue in process memory.
#[derive(Debug)]
pub struct MemoryBroker {
    connected: AtomicBool,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// A broker that refuses every call until [`set_connected`](Self::set_connected).
    pub fn disconnected() -> Self {
        let broker = Self::new();
        broker.set_connected(false);
        broker
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Payloads currently on the ready list, oldest first.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .get(queue)
            .map(|state| state.ready.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages currently unacked by one consumer.
    pub fn unacked_count(&self, queue: &str, consumer: &str) -> usize {
        self.lock()
            .get(queue)
            .map(|state| state.unacked_by(consumer).len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still holds usable state.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> QueueResult<T> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(QueueError::NotConnected);
        }
        let mut queues = self.lock();
        let state = queues.entry(queue.to_string()).or_default();
        Ok(f(state))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> QueueResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }

    async fn register_consumer(&self, queue: &str, consumer: &str) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            state.consumers.insert(consumer.to_string(), Instant::now());
        })
    }

    async fn heartbeat(&self, queue: &str, consumer: &str) -> QueueResult<()> {
        self.register_consumer(queue, consumer).await
    }

    async fn unregister_consumer(&self, queue: &str, consumer: &str) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            state.consumers.remove(consumer);
        })
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<i64> {
        self.with_queue(queue, |state| {
            state.next_id += 1;
            let id = state.next_id;
            state.ready.push_back((id, payload));
            id
        })
    }

    async fn reserve(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
    ) -> QueueResult<Vec<ReservedMessage>> {
        self.with_queue(queue, |state| {
            let take = max.min(state.ready.len());
            let mut reserved = Vec::with_capacity(take);
            for (id, payload) in state.ready.drain(..take) {
                reserved.push(ReservedMessage {
                    id,
                    payload: payload.clone(),
                });
                state.unacked.insert(
                    id,
                    Unacked {
                        consumer: consumer.to_string(),
                        payload,
                    },
                );
            }
            reserved
        })
    }

    async fn ack(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()> {
        self.with_queue(queue, |state| state.settle(consumer, delivery_id).map(|_| ()))?
    }

    async fn reject(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            let payload = state.settle(consumer, delivery_id)?;
            state.rejected.push_back((delivery_id, payload));
            Ok(())
        })?
    }

    async fn requeue(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            let payload = state.settle(consumer, delivery_id)?;
            state.ready.push_front((delivery_id, payload));
            Ok(())
        })?
    }

    async fn return_unacked(&self, queue: &str, consumer: &str) -> QueueResult<u64> {
        self.with_queue(queue, |state| {
            let ids = state.unacked_by(consumer);
            state.return_to_ready(ids)
        })
    }

    async fn return_rejected(&self, queue: &str, max: usize) -> QueueResult<u64> {
        self.with_queue(queue, |state| {
            let take = max.min(state.rejected.len());
            let returned: Vec<_> = state.rejected.drain(..take).collect();
            let count = returned.len() as u64;
            state.ready.extend(returned);
            count
        })
    }

    async fn clean_stale_consumers(
        &self,
        queue: &str,
        stale_after: Duration,
    ) -> QueueResult<u64> {
        self.with_queue(queue, |state| {
            let now = Instant::now();
            state
                .consumers
                .retain(|_, heartbeat| now.duration_since(*heartbeat) <= stale_after);

            // Anything held by a consumer that is no longer registered is orphaned.
            let orphaned: Vec<i64> = state
                .unacked
                .iter()
                .filter(|(_, entry)| !state.consumers.contains_key(&entry.consumer))
                .map(|(id, _)| *id)
                .collect();
            state.return_to_ready(orphaned)
        })
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.with_queue(queue, |state| QueueStats {
            ready: state.ready.len() as u64,
            unacked: state.unacked.len() as u64,
            rejected: state.rejected.len() as u64,
            consumers: state.consumers.len() as u64,
        })
    }
}
