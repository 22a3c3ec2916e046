//! Postgres-backed broker
//!
//! Messages live in `queue_messages`, consumer registrations and heartbeats in
//! `queue_consumers`. Reservation claims rows with `FOR UPDATE SKIP LOCKED`, so
//! any number of consumers can poll the same queue without blocking each other.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{Broker, QueueStats, ReservedMessage};
use crate::error::{QueueError, QueueResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_messages (
        id           BIGSERIAL PRIMARY KEY,
        queue        TEXT NOT NULL,
        payload      BYTEA NOT NULL,
        status       TEXT NOT NULL DEFAULT 'ready',
        consumer     TEXT,
        published_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        reserved_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_messages_queue_status_idx
        ON queue_messages (queue, status, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_consumers (
        queue        TEXT NOT NULL,
        consumer     TEXT NOT NULL,
        heartbeat_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (queue, consumer)
    )
    "#,
];

/// Broker that stores queues in Postgres tables.
#[derive(Debug)]
pub struct PgBroker {
    pool: PgPool,
    schema: OnceCell<()>,
}

impl PgBroker {
    /// The pool may be lazy; nothing is contacted until the first call.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> QueueResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("queue tables ready");
        Ok(())
    }

    async fn ready(&self) -> QueueResult<&PgPool> {
        self.schema.get_or_try_init(|| self.ensure_schema()).await?;
        Ok(&self.pool)
    }

    async fn settle(
        &self,
        sql: &str,
        queue: &str,
        consumer: &str,
        delivery_id: i64,
    ) -> QueueResult<()> {
        let pool = self.ready().await?;
        let result = sqlx::query(sql)
            .bind(delivery_id)
            .bind(queue)
            .bind(consumer)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery_id));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn register_consumer(&self, queue: &str, consumer: &str) -> QueueResult<()> {
        let pool = self.ready().await?;
        sqlx::query(
            r#"
            INSERT INTO queue_consumers (queue, consumer, heartbeat_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (queue, consumer) DO UPDATE SET heartbeat_at = NOW()
            "#,
        )
        .bind(queue)
        .bind(consumer)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, queue: &str, consumer: &str) -> QueueResult<()> {
        self.register_consumer(queue, consumer).await
    }

    async fn unregister_consumer(&self, queue: &str, consumer: &str) -> QueueResult<()> {
        let pool = self.ready().await?;
        sqlx::query("DELETE FROM queue_consumers WHERE queue = $1 AND consumer = $2")
            .bind(queue)
            .bind(consumer)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<i64> {
        let pool = self.ready().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO queue_messages (queue, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(queue)
        .bind(payload)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    async fn reserve(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
    ) -> QueueResult<Vec<ReservedMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let pool = self.ready().await?;
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET status = 'unacked', consumer = $2, reserved_at = NOW()
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND status = 'ready'
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload
            "#,
        )
        .bind(queue)
        .bind(consumer)
        .bind(max as i64)
        .fetch_all(pool)
        .await?;

        // RETURNING order is unspecified.
        let mut reserved: Vec<ReservedMessage> = rows
            .into_iter()
            .map(|(id, payload)| ReservedMessage { id, payload })
            .collect();
        reserved.sort_by_key(|m| m.id);
        Ok(reserved)
    }

    async fn ack(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()> {
        self.settle(
            r#"
            DELETE FROM queue_messages
            WHERE id = $1 AND queue = $2 AND consumer = $3 AND status = 'unacked'
            "#,
            queue,
            consumer,
            delivery_id,
        )
        .await
    }

    async fn reject(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()> {
        self.settle(
            r#"
            UPDATE queue_messages
            SET status = 'rejected', consumer = NULL, reserved_at = NULL
            WHERE id = $1 AND queue = $2 AND consumer = $3 AND status = 'unacked'
            "#,
            queue,
            consumer,
            delivery_id,
        )
        .await
    }

    async fn requeue(&self, queue: &str, consumer: &str, delivery_id: i64) -> QueueResult<()> {
        self.settle(
            r#"
            UPDATE queue_messages
            SET status = 'ready', consumer = NULL, reserved_at = NULL
            WHERE id = $1 AND queue = $2 AND consumer = $3 AND status = 'unacked'
            "#,
            queue,
            consumer,
            delivery_id,
        )
        .await
    }

    async fn return_unacked(&self, queue: &str, consumer: &str) -> QueueResult<u64> {
        let pool = self.ready().await?;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'ready', consumer = NULL, reserved_at = NULL
            WHERE queue = $1 AND consumer = $2 AND status = 'unacked'
            "#,
        )
        .bind(queue)
        .bind(consumer)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn return_rejected(&self, queue: &str, max: usize) -> QueueResult<u64> {
        let pool = self.ready().await?;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'ready'
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND status = 'rejected'
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(queue)
        .bind(max as i64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clean_stale_consumers(
        &self,
        queue: &str,
        stale_after: Duration,
    ) -> QueueResult<u64> {
        let pool = self.ready().await?;
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM queue_consumers
            WHERE queue = $1 AND heartbeat_at < NOW() - ($2::float8 * INTERVAL '1 second')
            "#,
        )
        .bind(queue)
        .bind(stale_after.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        // Deliveries whose holder is no longer registered go back to ready.
        let result = sqlx::query(
            r#"
            UPDATE queue_messages m
            SET status = 'ready', consumer = NULL, reserved_at = NULL
            WHERE m.queue = $1
              AND m.status = 'unacked'
              AND NOT EXISTS (
                  SELECT 1 FROM queue_consumers c
                  WHERE c.queue = m.queue AND c.consumer = m.consumer
              )
            "#,
        )
        .bind(queue)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let pool = self.ready().await?;
        let (ready, unacked, rejected): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ready'),
                COUNT(*) FILTER (WHERE status = 'unacked'),
                COUNT(*) FILTER (WHERE status = 'rejected')
            FROM queue_messages
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(pool)
        .await?;

        let consumers: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_consumers WHERE queue = $1")
                .bind(queue)
                .fetch_one(pool)
                .await?;

        Ok(QueueStats {
            ready: ready as u64,
            unacked: unacked as u64,
            rejected: rejected as u64,
            consumers: consumers as u64,
        })
    }
}
