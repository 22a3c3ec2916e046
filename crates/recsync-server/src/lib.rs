//! Recsync Server Library
//!
//! Periodic record ingestion: pulls paginated records from a source API,
//! hands them over a durable at-least-once queue and persists them into
//! Postgres with idempotent inserts.
//!
//! # Overview
//!
//! - **ingest**: scheduler, fetch coordinator, source client, batch writer and
//!   the worker runtime that ties the consumer to the writer
//! - **queue**: broker contract, Postgres and in-memory brokers, publisher and
//!   consumer runtime
//! - **db**: connection pool and records table bootstrap
//! - **api**: `/health` and `/stats` status endpoint
//! - **config**: environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use recsync_server::{
//!     config::Config,
//!     ingest::{FetchCoordinator, FetchSettings, HttpSource, SyncScheduler},
//!     queue::{MemoryBroker, QueueHandle, QueuePublisher},
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let queue = QueueHandle::new(Arc::new(MemoryBroker::new()), "data_queue");
//!     let source = HttpSource::new(&config.sync.api_url, config.sync.request_timeout())?;
//!     let coordinator = FetchCoordinator::new(
//!         Arc::new(source),
//!         QueuePublisher::new(queue),
//!         FetchSettings::from(&config.sync),
//!     );
//!     SyncScheduler::new(config.sync.interval(), Arc::new(coordinator))
//!         .start(CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod queue;

// Re-export commonly used types
pub use error::{AppError, QueueError, SourceError};
