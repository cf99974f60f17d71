//! Target lifecycle
//!
//! Runs once per destination before the first batch: validate the
//! configuration, connect, then bring the target table into the state the
//! ingestion strategy expects.
//!
//! ```text
//! table_exists?
//!   yes: refresh -> truncate
//!        merge   -> make_index unless a primary index already exists
//!        simple storage + refresh -> reset_sequence
//!   no:  make_table, merge -> make_index
//! ```

use crate::adapter::{AdapterRegistry, DatabaseAdapter};
use crate::error::{IngestError, IngestResult};
use crate::layout::RESERVED_COLUMNS;
use ndload_common::{DestinationConfig, IngestionStrategy};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A destination whose target is ready to accept batches
#[derive(Clone)]
pub struct ReadyDestination {
    pub config: Arc<DestinationConfig>,
    pub adapter: Arc<dyn DatabaseAdapter>,
}

impl std::fmt::Debug for ReadyDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyDestination")
            .field("destination", &self.config.id)
            .field("backend", &self.adapter.backend())
            .finish()
    }
}

/// Check strategy compatibility and the column descriptors of a destination
pub fn validate_destination(config: &DestinationConfig) -> IngestResult<()> {
    let fail = |message: String| Err(IngestError::config(&config.id, message));

    if config.table.trim().is_empty() {
        return fail("table name must not be empty".to_string());
    }

    if config.is_simple_storage() && config.ingestion == IngestionStrategy::Merge {
        return fail(format!(
            "storage strategy '{}' cannot be combined with ingestion strategy '{}' (table '{}')",
            config.storage, config.ingestion, config.table
        ));
    }

    if config.ingestion == IngestionStrategy::Merge && !config.has_primary_key() {
        return fail(format!(
            "ingestion strategy 'merge' requires at least one primary key column (table '{}')",
            config.table
        ));
    }

    if !config.is_simple_storage() && (config.columns.is_empty() || !config.has_primary_key()) {
        return fail(format!(
            "storage strategy '{}' requires a column list with at least one primary key column (table '{}')",
            config.storage, config.table
        ));
    }

    let mut seen = HashSet::new();
    for column in &config.columns {
        if column.name.trim().is_empty() {
            return fail("column names must not be empty".to_string());
        }
        if !seen.insert(column.name.as_str()) {
            return fail(format!("column '{}' is declared more than once", column.name));
        }
        if !config.is_simple_storage() && RESERVED_COLUMNS.contains(&column.name.as_str()) {
            return fail(format!(
                "column '{}' collides with a system column of storage strategy '{}'",
                column.name, config.storage
            ));
        }
        if let Some(ref data_type) = column.data_type {
            let allowed = |c: char| c.is_ascii_alphanumeric() || " _(),[]".contains(c);
            if data_type.trim().is_empty() || !data_type.chars().all(allowed) {
                return fail(format!(
                    "column '{}' has an invalid type '{}'",
                    column.name, data_type
                ));
            }
        }
    }

    Ok(())
}

/// Bring an existing or missing target into the ready state
#[instrument(skip_all, fields(destination = %config.id, table = %config.table))]
pub async fn ensure_target(
    adapter: &dyn DatabaseAdapter,
    config: &DestinationConfig,
) -> IngestResult<()> {
    if adapter.table_exists(config).await? {
        debug!("Target table exists");

        if config.ingestion == IngestionStrategy::Refresh {
            adapter.truncate_table(config).await?;
        }

        if config.ingestion == IngestionStrategy::Merge {
            match adapter.check_primary_index(config).await? {
                Some(index) => debug!(index = %index, "Primary key index present"),
                None => adapter.make_index(config).await?,
            }
        }

        if config.is_simple_storage() && config.ingestion == IngestionStrategy::Refresh {
            adapter.reset_sequence(config).await?;
        }
    } else {
        adapter.make_table(config).await?;

        if config.ingestion == IngestionStrategy::Merge {
            adapter.make_index(config).await?;
        }
    }

    Ok(())
}

/// Validate every destination, then connect and prepare them one by one.
///
/// All configuration errors surface before the first connection is opened;
/// the first adapter or setup failure aborts the remaining destinations.
pub async fn prepare_destinations(
    registry: &AdapterRegistry,
    configs: Vec<DestinationConfig>,
) -> IngestResult<Vec<ReadyDestination>> {
    for config in &configs {
        validate_destination(config)?;
        registry.resolve(config)?;
    }

    let mut ready = Vec::with_capacity(configs.len());
    for config in configs {
        let adapter = registry.connect(&config).await?;
        ensure_target(adapter.as_ref(), &config).await?;

        info!(
            destination = %config.id,
            backend = adapter.backend(),
            table = %config.table,
            storage = %config.storage,
            ingestion = %config.ingestion,
            "Destination ready"
        );

        ready.push(ReadyDestination {
            config: Arc::new(config),
            adapter,
        });
    }

    Ok(ready)
}
