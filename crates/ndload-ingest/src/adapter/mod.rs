//! Database adapter interface
//!
//! Every backend implements [`DatabaseAdapter`] for the table lifecycle,
//! index lifecycle, batch preparation and record ingestion. An adapter value
//! owns the connection pool of exactly one destination; it is created by an
//! [`AdapterFactory`] looked up in the [`AdapterRegistry`].

pub mod postgres;
pub mod registry;
pub mod runs;
pub mod sqlite;

use crate::error::IngestResult;
use crate::transform::{prepare_batch, PreparedRecord, RawRecord};
use async_trait::async_trait;
use ndload_common::{DestinationConfig, IngestionStrategy, StorageStrategy};
use std::sync::Arc;

pub use postgres::{PostgresAdapter, PostgresFactory};
pub use registry::AdapterRegistry;
pub use sqlite::{SqliteAdapter, SqliteFactory};

/// Backend operations for one connected destination
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Backend identifier, used in logs
    fn backend(&self) -> &str;

    async fn table_exists(&self, config: &DestinationConfig) -> IngestResult<bool>;

    /// Create the target with the layout dictated by the storage strategy
    async fn make_table(&self, config: &DestinationConfig) -> IngestResult<()>;

    /// Empty the target without dropping it
    async fn truncate_table(&self, config: &DestinationConfig) -> IngestResult<()>;

    /// Restart the record number generator at its initial value
    async fn reset_sequence(&self, config: &DestinationConfig) -> IngestResult<()>;

    /// Name of a unique index covering exactly the primary key columns, if any
    async fn check_primary_index(&self, config: &DestinationConfig) -> IngestResult<Option<String>>;

    /// Create the primary key index; no-op when no key columns are configured
    async fn make_index(&self, config: &DestinationConfig) -> IngestResult<()>;

    /// Shape a raw batch for this destination
    fn prepare_record_batch(
        &self,
        batch: &[RawRecord],
        config: &DestinationConfig,
    ) -> IngestResult<Vec<PreparedRecord>> {
        prepare_batch(batch, config, chrono::Utc::now())
    }

    /// Prepare and write one batch, returning the number of rows written
    async fn ingest_records(
        &self,
        batch: &[RawRecord],
        config: &DestinationConfig,
    ) -> IngestResult<usize>;
}

/// Creates connected adapters for one backend
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Identifiers this factory answers to, lowercase
    fn backends(&self) -> &[&'static str];

    fn supports_storage(&self, _storage: StorageStrategy) -> bool {
        true
    }

    fn supports_ingestion(&self, _ingestion: IngestionStrategy) -> bool {
        true
    }

    /// Open the destination's connection pool
    async fn connect(&self, config: &DestinationConfig) -> IngestResult<Arc<dyn DatabaseAdapter>>;
}
