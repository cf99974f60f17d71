//! SQLite backend
//!
//! The destination `schema` names an attached database (`main` unless set).
//! SQLite has no native UUID, JSON or array types, so identifiers,
//! structured values and csv arrays are stored as text.

use super::runs::{conflict_clause, insert_columns, insert_runs, merge_keys};
use super::{AdapterFactory, DatabaseAdapter};
use crate::error::{IngestError, IngestResult, Stage};
use crate::layout::{
    identifier_column, index_name, primary_key_list, quote_ident, LOAD_TIMESTAMP_COLUMN,
    OVERFLOW_COLUMN, PAYLOAD_COLUMN, RECORD_NUMBER_COLUMN,
};
use crate::transform::{PreparedRecord, RawRecord};
use async_trait::async_trait;
use ndload_common::{DestinationConfig, StorageStrategy};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const DEFAULT_SCHEMA: &str = "main";

/// SQLITE_MAX_VARIABLE_NUMBER of current SQLite releases
const MAX_BIND_PARAMS: usize = 32_766;

const DEFAULT_MAX_CONNECTIONS: u32 = 1;

/// Connects `sqlite` destinations
pub struct SqliteFactory;

#[async_trait]
impl AdapterFactory for SqliteFactory {
    fn backends(&self) -> &[&'static str] {
        &["sqlite"]
    }

    async fn connect(&self, config: &DestinationConfig) -> IngestResult<Arc<dyn DatabaseAdapter>> {
        let options = SqliteConnectOptions::from_str(&config.connection)
            .map_err(IngestError::database(config, Stage::Connect))?
            .create_if_missing(true);

        let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(IngestError::database(config, Stage::Connect))?;

        info!(destination = %config.id, max_connections, "SQLite connection pool created");

        Ok(Arc::new(SqliteAdapter::new(pool)))
    }
}

/// SQLite adapter owning one destination's pool
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn schema(config: &DestinationConfig) -> String {
    quote_ident(config.effective_schema(DEFAULT_SCHEMA))
}

fn qualified_table(config: &DestinationConfig) -> String {
    crate::layout::qualified_table(config, DEFAULT_SCHEMA)
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn table_exists(&self, config: &DestinationConfig) -> IngestResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
            schema(config)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(&config.table)
            .fetch_one(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::TableExists))?;

        Ok(count > 0)
    }

    #[instrument(skip_all, fields(destination = %config.id, table = %config.table))]
    async fn make_table(&self, config: &DestinationConfig) -> IngestResult<()> {
        sqlx::query(&create_table_sql(config))
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::MakeTable))?;

        info!(storage = %config.storage, "Created table");
        Ok(())
    }

    async fn truncate_table(&self, config: &DestinationConfig) -> IngestResult<()> {
        sqlx::query(&format!("DELETE FROM {}", qualified_table(config)))
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::TruncateTable))?;

        info!(destination = %config.id, table = %config.table, "Truncated table");
        Ok(())
    }

    async fn reset_sequence(&self, config: &DestinationConfig) -> IngestResult<()> {
        let sql = format!("DELETE FROM {}.sqlite_sequence WHERE name = ?", schema(config));
        sqlx::query(&sql)
            .bind(&config.table)
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::ResetSequence))?;

        debug!(destination = %config.id, "Reset record number sequence");
        Ok(())
    }

    async fn check_primary_index(
        &self,
        config: &DestinationConfig,
    ) -> IngestResult<Option<String>> {
        let wanted: BTreeSet<&str> = config.primary_keys().into_iter().collect();
        if wanted.is_empty() {
            return Ok(None);
        }

        let to_error = IngestError::database(config, Stage::CheckPrimaryIndex);
        let result: Result<Option<String>, sqlx::Error> = async {
            let list_sql = format!(
                "PRAGMA {}.index_list({})",
                schema(config),
                quote_ident(&config.table)
            );
            let indexes = sqlx::query(&list_sql).fetch_all(&self.pool).await?;

            for index in indexes {
                let unique: i64 = index.try_get("unique")?;
                if unique == 0 {
                    continue;
                }
                let name: String = index.try_get("name")?;

                let info_sql = format!(
                    "PRAGMA {}.index_info({})",
                    schema(config),
                    quote_ident(&name)
                );
                let columns: Vec<Option<String>> = sqlx::query(&info_sql)
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(|row| row.try_get("name"))
                    .collect::<Result<_, _>>()?;

                let covered: BTreeSet<&str> =
                    columns.iter().flatten().map(String::as_str).collect();
                if covered == wanted && columns.len() == wanted.len() {
                    return Ok(Some(name));
                }
            }

            Ok(None)
        }
        .await;

        result.map_err(to_error)
    }

    async fn make_index(&self, config: &DestinationConfig) -> IngestResult<()> {
        if !config.has_primary_key() {
            return Ok(());
        }

        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {}.{} ON {} ({})",
            schema(config),
            quote_ident(&index_name(config)),
            quote_ident(&config.table),
            primary_key_list(config)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::MakeIndex))?;

        info!(destination = %config.id, index = %index_name(config), "Created primary key index");
        Ok(())
    }

    #[instrument(skip_all, fields(destination = %config.id, records = batch.len()))]
    async fn ingest_records(
        &self,
        batch: &[RawRecord],
        config: &DestinationConfig,
    ) -> IngestResult<usize> {
        let records = self.prepare_record_batch(batch, config)?;
        if records.is_empty() {
            return Ok(0);
        }

        let keys = merge_keys(config);
        let key_columns: Vec<&str> = keys.iter().map(|c| c.name.as_str()).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(IngestError::database(config, Stage::Ingest))?;

        let mut written = 0usize;
        for run in insert_runs(&records, &keys, MAX_BIND_PARAMS, 2) {
            let mut builder = insert_statement(config, run, &key_columns);
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(IngestError::database(config, Stage::Ingest))?;
            written += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(IngestError::database(config, Stage::Ingest))?;

        debug!(rows = written, "Batch written");
        Ok(written)
    }
}

/// DDL for the destination's layout
pub fn create_table_sql(config: &DestinationConfig) -> String {
    let mut columns = vec![
        format!("{} TEXT NOT NULL UNIQUE", quote_ident(identifier_column(config.storage))),
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(RECORD_NUMBER_COLUMN)),
    ];

    if config.storage.is_simple() {
        columns.push(format!("{} TEXT", quote_ident(PAYLOAD_COLUMN)));
        columns.push(format!("{} TEXT NOT NULL", quote_ident(LOAD_TIMESTAMP_COLUMN)));
    } else {
        for column in &config.columns {
            columns.push(format!(
                "{} {}",
                quote_ident(&column.name),
                column.data_type.as_deref().map(str::trim).unwrap_or("TEXT")
            ));
        }
        columns.push(format!("{} TEXT NOT NULL", quote_ident(LOAD_TIMESTAMP_COLUMN)));
        if config.storage == StorageStrategy::ExplicitJsonOverflow {
            columns.push(format!("{} TEXT", quote_ident(OVERFLOW_COLUMN)));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        qualified_table(config),
        columns.join(",\n    ")
    )
}

fn insert_statement(
    config: &DestinationConfig,
    run: &[PreparedRecord],
    key_columns: &[&str],
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(String::new());
    let Some(head) = run.first() else {
        return builder;
    };

    builder.push(format!(
        "INSERT INTO {} ({}) ",
        qualified_table(config),
        insert_columns(config.storage, head)
    ));

    builder.push_values(run.iter(), |mut row, record| {
        row.push_bind(record.id.to_string());
        for field in &record.fields {
            row.push_bind(field.value.to_text());
        }
        row.push_bind(record.load_timestamp.to_rfc3339());
    });

    builder.push(conflict_clause(head, key_columns));
    builder
}
