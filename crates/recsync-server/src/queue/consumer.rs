//! Queue consumer runtime
//!
//! A consumer registers its identity with the broker, then polls for ready
//! messages while holding at most `prefetch_limit` of them at once. Each
//! reserved message becomes a [`Delivery`] carrying one prefetch permit; the
//! permit is released when the delivery is acked, rejected or dropped, and the
//! next poll only reserves as many messages as there are free permits.
//!
//! Deliveries are handed to the [`DeliveryHandler`] one at a time, in
//! reservation order.
//!
//! # States
//!
//! ```text
//! Disconnected -> Registering -> Consuming -> Stopped
//!       ^              |             |
//!       +--------------+-------------+  (broker unreachable)
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{QueueHandle, ReservedMessage};
use crate::config::BrokerConfig;
use crate::error::QueueResult;

/// Consumer tuning
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum number of unacknowledged deliveries held at once.
    pub prefetch_limit: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Wait between failed registration attempts.
    pub registration_backoff: Duration,
    /// When set, consumers silent for this long are removed and their
    /// deliveries returned to the queue. Checked every half of this period
    /// while consuming.
    pub stale_consumer_after: Option<Duration>,
}

impl ConsumerConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            prefetch_limit: config.prefetch_limit,
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            registration_backoff: config.registration_backoff(),
            stale_consumer_after: (config.stale_consumer_secs > 0)
                .then(|| config.stale_consumer_after()),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::from_broker_config(&crate::config::Config::default().broker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Registering,
    Consuming,
    Stopped,
}

/// Receives deliveries one at a time.
///
/// The handler owns the delivery and must settle it; a delivery dropped
/// without ack or reject goes back to the ready list.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// One reserved message, held until acked or rejected.
pub struct Delivery {
    id: i64,
    payload: Vec<u8>,
    queue: QueueHandle,
    consumer: Arc<str>,
    permit: Option<OwnedSemaphorePermit>,
    abandoned: Arc<AtomicBool>,
    settled: bool,
}

impl Delivery {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Remove the message from the queue for good.
    ///
    /// On error the delivery is still unsettled and is requeued when dropped.
    pub async fn ack(mut self) -> QueueResult<()> {
        let result = self
            .queue
            .broker()
            .ack(self.queue.name(), &self.consumer, self.id)
            .await;
        self.settled = result.is_ok();
        result
    }

    /// Move the message to the queue's rejected list.
    pub async fn reject(mut self) -> QueueResult<()> {
        let result = self
            .queue
            .broker()
            .reject(self.queue.name(), &self.consumer, self.id)
            .await;
        self.settled = result.is_ok();
        result
    }

    /// Free the permit without touching the broker. The message stays
    /// unacked until the consumer returns it in bulk.
    fn release(mut self) {
        self.settled = true;
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("queue", &self.queue.name())
            .field("bytes", &self.payload.len())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.settled || self.abandoned.load(Ordering::SeqCst) {
            return;
        }

        // Hold the permit until the message is back on the ready list.
        let permit = self.permit.take();
        let queue = self.queue.clone();
        let consumer = Arc::clone(&self.consumer);
        let id = self.id;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = queue.broker().requeue(queue.name(), &consumer, id).await {
                        debug!(delivery_id = id, error = %e, "Requeue of dropped delivery failed");
                    }
                    drop(permit);
                });
            },
            Err(_) => {
                warn!(delivery_id = id, "Delivery dropped outside a runtime, left unacked");
            },
        }
    }
}

/// Builder for a running consumer.
pub struct QueueConsumer {
    queue: QueueHandle,
    name: Arc<str>,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub fn new(queue: QueueHandle, name: impl Into<Arc<str>>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            name: name.into(),
            config,
        }
    }

    /// Spawn the consumer. It stops when `shutdown` is cancelled or the
    /// returned handle is stopped.
    pub fn start(
        self,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: CancellationToken,
    ) -> ConsumerHandle {
        let prefetch = self.config.prefetch_limit.max(1);
        let permits = Arc::new(Semaphore::new(prefetch));
        let (state_tx, state_rx) = watch::channel(ConsumerState::Disconnected);
        let token = shutdown.child_token();
        let abandoned = Arc::new(AtomicBool::new(false));

        let runner = Runner {
            queue: self.queue,
            name: Arc::clone(&self.name),
            config: self.config,
            prefetch,
            permits: Arc::clone(&permits),
            abandoned: Arc::clone(&abandoned),
            state: state_tx,
        };
        let task = tokio::spawn(runner.run(handler, token.clone()));

        ConsumerHandle {
            status: ConsumerStatus {
                name: self.name,
                state: state_rx,
                permits,
                prefetch,
            },
            token,
            abandoned,
            task,
        }
    }
}

/// Read-only view of a running consumer.
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    name: Arc<str>,
    state: watch::Receiver<ConsumerState>,
    permits: Arc<Semaphore>,
    prefetch: usize,
}

impl ConsumerStatus {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Deliveries reserved and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.prefetch - self.permits.available_permits()
    }

    pub fn prefetch_limit(&self) -> usize {
        self.prefetch
    }
}

/// Owner handle of a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    status: ConsumerStatus,
    token: CancellationToken,
    abandoned: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        self.status.name()
    }

    pub fn state(&self) -> ConsumerState {
        self.status.state()
    }

    pub fn in_flight(&self) -> usize {
        self.status.in_flight()
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    /// Resolves once the consumer reaches `target`. Returns false if the
    /// consumer exited without ever reaching it.
    pub async fn wait_for_state(&self, target: ConsumerState) -> bool {
        let mut state = self.status.state.clone();
        let reached = state.wait_for(|s| *s == target).await.is_ok();
        reached
    }

    /// Finish the current delivery, return everything unacked to the queue
    /// and unregister.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(consumer = self.status.name(), error = %e, "Consumer task failed");
        }
    }

    /// Stop immediately without returning deliveries or unregistering,
    /// the way a killed process would. Its deliveries stay unacked until
    /// another consumer cleans up the stale registration.
    pub async fn abort(self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.task.abort();
        let _ = self.task.await;
    }
}

struct Runner {
    queue: QueueHandle,
    name: Arc<str>,
    config: ConsumerConfig,
    prefetch: usize,
    permits: Arc<Semaphore>,
    abandoned: Arc<AtomicBool>,
    state: watch::Sender<ConsumerState>,
}

impl Runner {
    fn set_state(&self, next: ConsumerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(consumer = %self.name, from = ?*current, to = ?next, "Consumer state change");
            *current = next;
            true
        });
    }

    async fn run(self, handler: Arc<dyn DeliveryHandler>, token: CancellationToken) {
        if !self.register(&token).await {
            self.set_state(ConsumerState::Stopped);
            return;
        }
        self.set_state(ConsumerState::Consuming);
        info!(
            consumer = %self.name,
            queue = self.queue.name(),
            prefetch = self.prefetch,
            "Worker started and consuming messages..."
        );

        let (tx, rx) = mpsc::channel(self.prefetch);
        // Aborting this task drops the set and aborts the dispatcher with it.
        let mut dispatcher = JoinSet::new();
        dispatcher.spawn(dispatch(handler, rx, token.clone()));

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = self.config.stale_consumer_after.map(|after| {
            let mut sweep = tokio::time::interval((after / 2).max(Duration::from_millis(1)));
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            sweep
        });

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = heartbeat.tick() => {
                    let result = self
                        .queue
                        .broker()
                        .heartbeat(self.queue.name(), &self.name)
                        .await;
                    self.observe(result);
                }
                _ = next_tick(&mut sweep) => self.clean_stale_consumers().await,
                _ = poll.tick() => {
                    let result = self.poll(&tx).await;
                    self.observe(result);
                }
            }
        }

        drop(tx);
        while let Some(joined) = dispatcher.join_next().await {
            if let Err(e) = joined {
                warn!(consumer = %self.name, error = %e, "Delivery handler task failed");
            }
        }
        self.shutdown().await;
    }

    /// Register until it succeeds. Returns false if cancelled first.
    async fn register(&self, token: &CancellationToken) -> bool {
        loop {
            self.set_state(ConsumerState::Registering);
            match self
                .queue
                .broker()
                .register_consumer(self.queue.name(), &self.name)
                .await
            {
                Ok(()) => {
                    info!(consumer = %self.name, queue = self.queue.name(), "Consumer registered");
                    return true;
                },
                Err(e) => {
                    self.set_state(ConsumerState::Disconnected);
                    warn!(
                        consumer = %self.name,
                        error = %e,
                        retry_in = ?self.config.registration_backoff,
                        "Consumer registration failed, retrying"
                    );
                },
            }

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.config.registration_backoff) => {}
            }
        }
    }

    async fn clean_stale_consumers(&self) {
        let Some(stale_after) = self.config.stale_consumer_after else {
            return;
        };
        match self
            .queue
            .broker()
            .clean_stale_consumers(self.queue.name(), stale_after)
            .await
        {
            Ok(0) => {},
            Ok(returned) => {
                info!(queue = self.queue.name(), returned, "Returned deliveries of stale consumers")
            },
            Err(e) => warn!(queue = self.queue.name(), error = %e, "Stale consumer cleanup failed"),
        }
    }

    /// Reserve as many messages as there are free permits.
    async fn poll(&self, tx: &mpsc::Sender<Delivery>) -> QueueResult<()> {
        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(());
        }

        let reserved = self
            .queue
            .broker()
            .reserve(self.queue.name(), &self.name, free)
            .await?;

        for ReservedMessage { id, payload } in reserved {
            let permit = Arc::clone(&self.permits).try_acquire_owned().ok();
            let delivery = Delivery {
                id,
                payload,
                queue: self.queue.clone(),
                consumer: Arc::clone(&self.name),
                permit,
                abandoned: Arc::clone(&self.abandoned),
                settled: false,
            };
            // The channel holds `prefetch` items, so this only waits if the
            // dispatcher is gone; the returned delivery then requeues on drop.
            if tx.send(delivery).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn observe(&self, result: QueueResult<()>) {
        match result {
            Ok(()) => self.set_state(ConsumerState::Consuming),
            Err(e) if e.is_connection() => {
                if *self.state.borrow() != ConsumerState::Disconnected {
                    warn!(consumer = %self.name, error = %e, "Lost connection to broker");
                }
                self.set_state(ConsumerState::Disconnected);
            },
            Err(e) => warn!(consumer = %self.name, error = %e, "Broker call failed"),
        }
    }

    async fn shutdown(&self) {
        let broker = self.queue.broker();
        match broker.return_unacked(self.queue.name(), &self.name).await {
            Ok(0) => {},
            Ok(returned) => info!(consumer = %self.name, returned, "Returned unacked deliveries"),
            Err(e) => warn!(consumer = %self.name, error = %e, "Failed to return unacked deliveries"),
        }
        if let Err(e) = broker.unregister_consumer(self.queue.name(), &self.name).await {
            warn!(consumer = %self.name, error = %e, "Failed to unregister consumer");
        }
        self.set_state(ConsumerState::Stopped);
        info!(consumer = %self.name, "Consumer stopped");
    }
}

/// Ticks `interval`, or never resolves when there is none.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        },
        None => std::future::pending().await,
    }
}

async fn dispatch(
    handler: Arc<dyn DeliveryHandler>,
    mut rx: mpsc::Receiver<Delivery>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            delivery = rx.recv() => match delivery {
                Some(delivery) => handler.handle(delivery).await,
                None => break,
            },
        }
    }

    // Buffered deliveries are returned in bulk on shutdown.
    rx.close();
    while let Some(delivery) = rx.recv().await {
        delivery.release();
    }
}
