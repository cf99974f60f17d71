//! ndload ingestion engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streams newline-delimited JSON into one or more database destinations.
//!
//! # Pipeline
//!
//! - **stream**: decodes NDJSON lines and groups records into batches
//! - **filter**: optional external process reshaping raw input into NDJSON
//! - **transform**: shapes each batch per destination storage strategy
//! - **adapter**: backend contract, registry, PostgreSQL and SQLite backends
//! - **lifecycle**: validates destinations and prepares their tables
//! - **dispatch**: fans batches out concurrently and joins every operation
//!
//! # Example
//!
//! ```no_run
//! use ndload_common::LoaderConfig;
//! use ndload_ingest::{
//!     ingest_stream, ndjson_records, prepare_destinations, AdapterRegistry, DispatchOptions,
//! };
//! use std::num::NonZeroUsize;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::load("ndload.yml")?;
//!     let registry = AdapterRegistry::with_defaults();
//!     let destinations = prepare_destinations(&registry, config.namespace("analytics")?).await?;
//!
//!     let input = tokio::io::BufReader::new(tokio::io::stdin());
//!     let batch_size = NonZeroUsize::new(config.batch_size).unwrap_or(NonZeroUsize::MIN);
//!     let records = ndjson_records(input);
//!     let options = DispatchOptions::default();
//!     let summary = ingest_stream(records, batch_size, destinations, options).await?;
//!     println!("{} rows written", summary.total_rows());
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod layout;
pub mod lifecycle;
pub mod stream;
pub mod transform;

// Re-export commonly used types
pub use adapter::{AdapterFactory, AdapterRegistry, DatabaseAdapter};
pub use dispatch::{ingest_stream, DispatchOptions, Dispatcher, RunSummary};
pub use error::{Dimension, IngestError, IngestResult, Stage};
pub use filter::filtered_records;
pub use lifecycle::{ensure_target, prepare_destinations, validate_destination, ReadyDestination};
pub use stream::{ndjson_records, Chunker};
pub use transform::{prepare_batch, Batch, FieldValue, PreparedField, PreparedRecord, RawRecord};
