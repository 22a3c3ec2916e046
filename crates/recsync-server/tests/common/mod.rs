//! Common test utilities for recsync integration tests
//!
//! - [`ScriptedSource`]: a [`RecordSource`] with failing pages, per-page
//!   delays and concurrency tracking
//! - [`TestPostgres`]: a PostgreSQL container with the records table and the
//!   queue tables created
//! - small helpers for decoding queued batches and waiting on conditions

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use recsync_common::{Batch, PageRequest, Record};
use recsync_server::error::SourceError;
use recsync_server::ingest::RecordSource;
use recsync_server::queue::PgBroker;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

// ============================================================================
// Scripted source
// ============================================================================

/// Deterministic source: page `p` of size `s` holds ids `p*s .. p*s+s`.
#[derive(Default)]
pub struct ScriptedSource {
    failing: HashSet<u32>,
    delays: HashMap<u32, Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    requested: Mutex<Vec<PageRequest>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_pages(mut self, pages: impl IntoIterator<Item = u32>) -> Self {
        self.failing.extend(pages);
        self
    }

    pub fn with_delay(mut self, page: u32, delay: Duration) -> Self {
        self.delays.insert(page, delay);
        self
    }

    /// Highest number of fetches observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Every page requested so far, sorted.
    pub fn requested_pages(&self) -> Vec<PageRequest> {
        let mut pages = self.requested.lock().unwrap().clone();
        pages.sort_by_key(|p| p.page);
        pages
    }

    pub fn records_for(page: PageRequest) -> Vec<Record> {
        let base = i64::from(page.page) * i64::from(page.size);
        (0..i64::from(page.size))
            .map(|i| {
                let id = base + i;
                Record::new(id, format!("name-{id}"), format!("{id}@example.com"), "555-0100")
            })
            .collect()
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch(&self, page: PageRequest) -> Result<Batch, SourceError> {
        self.requested.lock().unwrap().push(page);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&page.page) {
            tokio::time::sleep(*delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&page.page) {
            return Err(SourceError::Decode(format!("scripted failure for {page}")));
        }
        Ok(Batch::new(Self::records_for(page)))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn decode_all(payloads: &[Vec<u8>]) -> Vec<Batch> {
    payloads
        .iter()
        .map(|p| Batch::from_payload(p).unwrap())
        .collect()
}

/// Poll `check` until it returns true, failing the test after `limit`.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container with the records and queue tables in place
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        recsync_server::db::ensure_schema(&pool).await?;
        PgBroker::new(pool.clone()).ensure_schema().await?;

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,recsync_server=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

/// Check if Docker is available
pub fn is_docker_available() -> bool {
    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Skip test if Docker is not available
#[macro_export]
macro_rules! skip_if_no_docker {
    () => {
        if !$crate::common::is_docker_available() {
            eprintln!("Skipping test: Docker is not available");
            return;
        }
    };
}
