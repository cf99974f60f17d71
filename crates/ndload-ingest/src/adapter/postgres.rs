//! PostgreSQL backend

use super::runs::{conflict_clause, insert_columns, insert_runs, merge_keys};
use super::{AdapterFactory, DatabaseAdapter};
use crate::error::{IngestError, IngestResult, Stage};
use crate::layout::{
    identifier_column, index_name, primary_key_list, qualified_table, quote_ident,
    LOAD_TIMESTAMP_COLUMN, OVERFLOW_COLUMN, PAYLOAD_COLUMN, RECORD_NUMBER_COLUMN,
};
use crate::transform::{FieldValue, PreparedRecord, RawRecord};
use async_trait::async_trait;
use ndload_common::{DestinationConfig, StorageStrategy};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const DEFAULT_SCHEMA: &str = "public";

/// Bind parameters allowed in one statement
const MAX_BIND_PARAMS: usize = 65_535;

const DEFAULT_MAX_CONNECTIONS: u32 = 4;

const ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Connects `postgres` / `postgresql` destinations
pub struct PostgresFactory;

#[async_trait]
impl AdapterFactory for PostgresFactory {
    fn backends(&self) -> &[&'static str] {
        &["postgres", "postgresql"]
    }

    async fn connect(&self, config: &DestinationConfig) -> IngestResult<Arc<dyn DatabaseAdapter>> {
        let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect(&config.connection)
            .await
            .map_err(IngestError::database(config, Stage::Connect))?;

        info!(
            destination = %config.id,
            max_connections,
            "PostgreSQL connection pool created"
        );

        Ok(Arc::new(PostgresAdapter::new(pool)))
    }
}

/// PostgreSQL adapter owning one destination's pool
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn backend(&self) -> &str {
        "postgres"
    }

    async fn table_exists(&self, config: &DestinationConfig) -> IngestResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(config.effective_schema(DEFAULT_SCHEMA))
        .bind(&config.table)
        .fetch_one(&self.pool)
        .await
        .map_err(IngestError::database(config, Stage::TableExists))
    }

    #[instrument(skip_all, fields(destination = %config.id, table = %config.table))]
    async fn make_table(&self, config: &DestinationConfig) -> IngestResult<()> {
        let schema_sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(config.effective_schema(DEFAULT_SCHEMA))
        );
        sqlx::query(&schema_sql)
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::MakeTable))?;

        sqlx::query(&create_table_sql(config))
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::MakeTable))?;

        info!(storage = %config.storage, "Created table");
        Ok(())
    }

    async fn truncate_table(&self, config: &DestinationConfig) -> IngestResult<()> {
        let sql = format!("TRUNCATE TABLE {}", qualified_table(config, DEFAULT_SCHEMA));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(IngestError::database(config, Stage::TruncateTable))?;

        info!(destination = %config.id, table = %config.table, "Truncated table");
        Ok(())
    }

    async fn reset_sequence(&self, config: &DestinationConfig) -> IngestResult<()> {
        sqlx::query("SELECT setval(pg_get_serial_sequence($1, $2), 1, false)")
            .bind(qualified_table(config, DEFAULT_SCHEMA))
            .bind(RECORD_NUMBER_COLUMN)
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

        let indexes: Vec<(String, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT i.relname::text, array_agg(a.attname::text)
            FROM pg_index x
            JOIN pg_class t ON t.oid = x.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_class i ON i.oid = x.indexrelid
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(x.indkey)
            WHERE n.nspname = $1 AND t.relname = $2 AND x.indisunique
            GROUP BY i.relname
            "#,
        )
        .bind(config.effective_schema(DEFAULT_SCHEMA))
        .bind(&config.table)
        .fetch_all(&self.pool)
        .await
        .map_err(IngestError::database(config, Stage::CheckPrimaryIndex))?;

        Ok(indexes.into_iter().find_map(|(name, columns)| {
            let covered: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
            (covered == wanted).then_some(name)
        }))
    }

    async fn make_index(&self, config: &DestinationConfig) -> IngestResult<()> {
        if !config.has_primary_key() {
            return Ok(());
        }

        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&index_name(config)),
            qualified_table(config, DEFAULT_SCHEMA),
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

fn payload_type(storage: StorageStrategy) -> &'static str {
    match storage {
        StorageStrategy::Json => "JSONB",
        StorageStrategy::CsvArray => "TEXT[]",
        _ => "TEXT",
    }
}

/// DDL for the destination's layout
pub fn create_table_sql(config: &DestinationConfig) -> String {
    let mut columns = Vec::new();

    if config.storage.is_simple() {
        let identifier = quote_ident(identifier_column(config.storage));
        columns.push(format!("{} UUID PRIMARY KEY", identifier));
        columns.push(format!("{} BIGSERIAL NOT NULL", quote_ident(RECORD_NUMBER_COLUMN)));
        columns.push(format!(
            "{} {}",
            quote_ident(PAYLOAD_COLUMN),
            payload_type(config.storage)
        ));
        columns.push(format!(
            "{} TIMESTAMPTZ NOT NULL DEFAULT now()",
            quote_ident(LOAD_TIMESTAMP_COLUMN)
        ));
    } else {
        let identifier = quote_ident(identifier_column(config.storage));
        columns.push(format!("{} UUID NOT NULL UNIQUE", identifier));
        columns.push(format!("{} BIGSERIAL NOT NULL", quote_ident(RECORD_NUMBER_COLUMN)));
        for column in &config.columns {
            columns.push(format!(
                "{} {}",
                quote_ident(&column.name),
                column.data_type.as_deref().map(str::trim).unwrap_or("TEXT")
            ));
        }
        columns.push(format!(
            "{} TIMESTAMPTZ NOT NULL DEFAULT now()",
            quote_ident(LOAD_TIMESTAMP_COLUMN)
        ));
        if config.storage == StorageStrategy::ExplicitJsonOverflow {
            columns.push(format!("{} JSONB", quote_ident(OVERFLOW_COLUMN)));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        qualified_table(config, DEFAULT_SCHEMA),
        columns.join(",\n    ")
    )
}

/// Multi-row INSERT for one run of records sharing a column set
fn insert_statement(
    config: &DestinationConfig,
    run: &[PreparedRecord],
    key_columns: &[&str],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(String::new());
    let Some(head) = run.first() else {
        return builder;
    };

    builder.push(format!(
        "INSERT INTO {} ({}) ",
        qualified_table(config, DEFAULT_SCHEMA),
        insert_columns(config.storage, head)
    ));

    // Descriptor columns are bound as text and cast to their declared type.
    let casts: Vec<Option<String>> = head
        .fields
        .iter()
        .map(|field| {
            config
                .columns
                .iter()
                .find(|c| c.name == field.column)
                .map(|c| c.data_type.as_deref().map(str::trim).unwrap_or("text").to_string())
        })
        .collect();

    builder.push_values(run.iter(), |mut row, record| {
        row.push_bind(record.id);
        for (field, cast) in record.fields.iter().zip(&casts) {
            push_field(&mut row, &field.value, cast.as_deref());
        }
        row.push_bind(record.load_timestamp);
    });

    builder.push(conflict_clause(head, key_columns));
    builder
}

fn push_field(
    row: &mut Separated<'_, 'static, Postgres, &'static str>,
    value: &FieldValue,
    cast: Option<&str>,
) {
    match (cast, value) {
        (Some(data_type), value) => {
            row.push_bind(value.to_text());
            row.push_unseparated(format!("::{}", data_type));
        },
        (None, FieldValue::Null) => {
            row.push_bind(None::<String>);
        },
        (None, FieldValue::Json(value)) => {
            row.push_bind(Json(value.clone()));
        },
        (None, FieldValue::Text(text)) => {
            row.push_bind(text.clone());
        },
        (None, FieldValue::TextArray(items)) => {
            row.push_bind(items.clone());
        },
    }
}
