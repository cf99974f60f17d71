//! Ingestion error types
//!
//! Every variant that concerns a destination carries enough context (destination,
//! table, strategy, stage) to diagnose a failure without re-running the load.

use ndload_common::{
    DestinationConfig, DestinationId, IngestionStrategy, NdloadError, StorageStrategy,
};
use thiserror::Error;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Adapter operation during which a backend call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    TableExists,
    MakeTable,
    TruncateTable,
    ResetSequence,
    CheckPrimaryIndex,
    MakeIndex,
    Ingest,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::TableExists => "table_exists",
            Stage::MakeTable => "make_table",
            Stage::TruncateTable => "truncate_table",
            Stage::ResetSequence => "reset_sequence",
            Stage::CheckPrimaryIndex => "check_primary_index",
            Stage::MakeIndex => "make_index",
            Stage::Ingest => "ingest_records",
        };
        f.write_str(name)
    }
}

/// Which part of a destination configuration no adapter handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Backend,
    StorageStrategy,
    IngestionStrategy,
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::Backend => f.write_str("backend"),
            Dimension::StorageStrategy => f.write_str("storage strategy"),
            Dimension::IngestionStrategy => f.write_str("ingestion strategy"),
        }
    }
}

/// Main error type for the ingestion engine
#[derive(Error, Debug)]
pub enum IngestError {
    /// Invalid or incompatible destination settings, raised before any batch
    #[error("Configuration error for destination '{destination}': {message}")]
    Config {
        destination: DestinationId,
        message: String,
    },

    /// Loader configuration could not be read
    #[error(transparent)]
    Common(#[from] NdloadError),

    /// No registered adapter handles this backend or strategy
    #[error("Unsupported {dimension} '{value}' for destination '{destination}' (adapter '{backend}')")]
    UnsupportedAdapter {
        destination: DestinationId,
        backend: String,
        dimension: Dimension,
        value: String,
    },

    /// Malformed input line; fatal to the whole stream
    #[error("Failed to decode input line {line}: {message}")]
    Decode { line: usize, message: String },

    #[error("Failed to read input: {0}")]
    Input(#[from] std::io::Error),

    /// The external reshaping filter could not run or exited unsuccessfully
    #[error("Reshaping filter '{program}' failed: {message}")]
    Filter { program: String, message: String },

    #[error("Database error for destination '{destination}' (table '{table}', storage {storage}, ingestion {ingestion}) during {stage}: {source}")]
    Database {
        destination: DestinationId,
        table: String,
        storage: StorageStrategy,
        ingestion: IngestionStrategy,
        stage: Stage,
        #[source]
        source: sqlx::Error,
    },

    /// One tracked (batch, destination) operation failed
    #[error("Batch {batch} failed for destination '{destination}': {source}")]
    Operation {
        destination: DestinationId,
        batch: usize,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Ingestion task did not complete: {0}")]
    Join(String),

    /// Every failure observed when the tracked operations were joined
    #[error("{} ingestion operation(s) failed: {}", .0.len(), summarize(.0))]
    Aggregate(Vec<IngestError>),
}

fn summarize(errors: &[IngestError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl IngestError {
    /// Create a configuration error for a destination
    pub fn config(destination: &DestinationId, message: impl Into<String>) -> Self {
        Self::Config {
            destination: destination.clone(),
            message: message.into(),
        }
    }

    /// Build a `map_err` adapter that attaches destination context to a sqlx error
    pub fn database(
        config: &DestinationConfig,
        stage: Stage) -> impl FnOnce(sqlx::Error,
    ) -> Self + '_ {
        move |source| Self::Database {
            destination: config.id.clone(),
            table: config.table.clone(),
            storage: config.storage,
            ingestion: config.ingestion,
            stage,
            source,
        }
    }

    /// Failures contained in this error, flattening aggregates
    pub fn failures(&self) -> Vec<&IngestError> {
        match self {
            Self::Aggregate(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}
