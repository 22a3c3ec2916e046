//! Batch writer
//!
//! Persists one batch per transaction. Every record is inserted inside its own
//! savepoint with insert-or-ignore semantics on `id`, so a duplicate is
//! absorbed silently and a bad row is rolled back alone without taking the
//! rest of the batch with it.
//!
//! Writing never returns an error. Row failures and commit failures are
//! logged and reflected in the [`WriteReport`].

use async_trait::async_trait;
use recsync_common::{Batch, Record};
use serde::Serialize;
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

pub const INSERT_RECORD_SQL: &str =
    "INSERT INTO records (id, name, email, phone) VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING";

/// Outcome of writing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub inserted: usize,
    /// Records whose id was already stored (or appeared earlier in the batch).
    pub duplicates: usize,
    pub failed: usize,
    /// False when the transaction did not commit; nothing from the batch is
    /// stored in that case.
    pub committed: bool,
}

impl WriteReport {
    fn lost(batch: &Batch) -> Self {
        Self {
            failed: batch.len(),
            committed: false,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write(&self, batch: &Batch) -> WriteReport;
}

/// Postgres implementation of [`BatchWriter`]
#[derive(Debug, Clone)]
pub struct PgBatchWriter {
    pool: PgPool,
    transaction_timeout: Duration,
}

impl PgBatchWriter {
    pub fn new(pool: PgPool, transaction_timeout: Duration) -> Self {
        Self {
            pool,
            transaction_timeout,
        }
    }

    async fn write_in_transaction(&self, batch: &Batch) -> Result<WriteReport, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut report = WriteReport::default();

        for record in batch {
            match insert_record(&mut tx, record).await? {
                RowOutcome::Inserted => report.inserted += 1,
                RowOutcome::Duplicate => report.duplicates += 1,
                RowOutcome::Failed => report.failed += 1,
            }
        }

        tx.commit().await?;
        report.committed = true;
        Ok(report)
    }
}

enum RowOutcome {
    Inserted,
    Duplicate,
    Failed,
}

/// Insert one record inside a savepoint.
///
/// A statement error is logged and only rolls back the savepoint; an error
/// managing the savepoint itself aborts the batch.
async fn insert_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &Record,
) -> Result<RowOutcome, sqlx::Error> {
    let mut savepoint = tx.begin().await?;

    let result = sqlx::query(INSERT_RECORD_SQL)
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.phone)
        .execute(&mut *savepoint)
        .await;

    match result {
        Ok(done) => {
            savepoint.commit().await?;
            Ok(if done.rows_affected() == 0 {
                RowOutcome::Duplicate
            } else {
                RowOutcome::Inserted
            })
        },
        Err(e) => {
            warn!(record_id = record.id, error = %e, "Record insert failed, skipping");
            savepoint.rollback().await?;
            Ok(RowOutcome::Failed)
        },
    }
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    async fn write(&self, batch: &Batch) -> WriteReport {
        if batch.is_empty() {
            return WriteReport {
                committed: true,
                ..WriteReport::default()
            };
        }

        match tokio::time::timeout(self.transaction_timeout, self.write_in_transaction(batch)).await
        {
            Ok(Ok(report)) => {
                info!(
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    failed = report.failed,
                    "Transaction commit success!"
                );
                report
            },
            Ok(Err(e)) => {
                error!(records = batch.len(), error = %e, "Batch transaction failed, batch lost");
                WriteReport::lost(batch)
            },
            Err(_) => {
                error!(
                    records = batch.len(),
                    timeout = ?self.transaction_timeout,
                    "Batch transaction timed out, batch lost"
                );
                WriteReport::lost(batch)
            },
        }
    }
}

/// In-memory record table with the same row semantics as [`PgBatchWriter`].
///
/// Rows containing a NUL byte fail, the way Postgres rejects them in text
/// columns. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    rows: Arc<Mutex<BTreeMap<i64, Record>>>,
    write_delay: Duration,
    fail_commits: Arc<AtomicBool>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every write.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Make every following commit fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Stored rows ordered by id.
    pub fn rows(&self) -> Vec<Record> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Record>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn has_nul(record: &Record) -> bool {
    [&record.name, &record.email, &record.phone]
        .iter()
        .any(|field| field.contains('\0'))
}

#[async_trait]
impl BatchWriter for MemoryRecordStore {
    async fn write(&self, batch: &Batch) -> WriteReport {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }

        let mut rows = self.lock();
        let mut staged = BTreeMap::new();
        let mut report = WriteReport::default();

        for record in batch {
            if has_nul(record) {
                warn!(record_id = record.id, "Record insert failed, skipping");
                report.failed += 1;
            } else if rows.contains_key(&record.id) || staged.contains_key(&record.id) {
                report.duplicates += 1;
            } else {
                staged.insert(record.id, record.clone());
                report.inserted += 1;
            }
        }

        if self.fail_commits.load(Ordering::SeqCst) {
            error!(records = batch.len(), "Batch transaction failed, batch lost");
            return WriteReport::lost(batch);
        }

        rows.append(&mut staged);
        report.committed = true;
        report
    }
}
