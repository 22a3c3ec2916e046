//! recsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup and error handling for the recsync workspace.
//!
//! # Overview
//!
//! - **Types**: [`Record`](types::Record), [`Batch`](types::Batch) and
//!   [`PageRequest`](types::PageRequest), the units moved through the pipeline
//! - **Error Handling**: [`RecsyncError`] and the [`Result`] alias
//! - **Logging**: tracing-subscriber initialization driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use recsync_common::types::{Batch, Record};
//!
//! fn encode() -> recsync_common::Result<Vec<u8>> {
//!     let batch = Batch::new(vec![Record::new(1, "Ada", "ada@example.com", "555-0100")]);
//!     batch.to_payload()
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{RecsyncError, Result};
pub use types::{Batch, PageRequest, Record};
