//! Record ingestion pipeline
//!
//! # Architecture
//!
//! ```text
//! SyncScheduler -> FetchCoordinator -> (channel) -> QueuePublisher -> Broker
//!                                                                      |
//!                  storage <- BatchWriter <- WorkerRuntime (consumer) <-+
//! ```
//!
//! - **source**: one page of records from the source API
//! - **coordinator**: fan-out of page fetches per cycle, fan-in to the publisher
//! - **scheduler**: fires a cycle every interval, cycles may overlap
//! - **writer**: idempotent batch persistence
//! - **worker**: decode, write and ack loop bound to one consumer identity
//!
//! Nothing here is fatal to the process. Failed pages, publishes, rows and
//! commits are logged and the affected data is dropped.

pub mod coordinator;
pub mod scheduler;
pub mod source;
pub mod worker;
pub mod writer;

pub use coordinator::{CycleReport, FetchCoordinator, FetchSettings};
pub use scheduler::SyncScheduler;
pub use source::{HttpSource, RecordSource};
pub use worker::{consumer_identity, BatchConsumer, WorkerRuntime};
pub use writer::{BatchWriter, MemoryRecordStore, PgBatchWriter, WriteReport};
