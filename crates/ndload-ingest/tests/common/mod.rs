//! Shared helpers for ndload-ingest integration tests
//!
//! - [`MockFactory`] / [`MockAdapter`]: in-memory backend that records every
//!   adapter call, simulates table and index state, and can fail or slow down
//!   selected batches
//! - [`TestPostgres`]: PostgreSQL container for the Docker-backed tests
//! - small builders for destinations and record streams
//!
//! Records steer the mock through reserved fields: `delay_ms` on the first
//! record of a batch delays that batch's write, and `fail_on: "<destination>"`
//! anywhere in a batch makes the write to that destination fail.
#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use ndload_common::{DestinationConfig, DestinationId, IngestionStrategy, StorageStrategy};
use ndload_ingest::{
    AdapterFactory, AdapterRegistry, DatabaseAdapter, IngestError, IngestResult, PreparedRecord,
    RawRecord, Stage,
};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

pub const MOCK_BACKEND: &str = "mock";

/// Install a test subscriber once; later calls are ignored
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ndload_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Builders
// ============================================================================

pub fn destination(
    name: &str,
    storage: StorageStrategy,
    ingestion: IngestionStrategy,
) -> DestinationConfig {
    DestinationConfig::new(
        DestinationId::new("test", name),
        MOCK_BACKEND,
        format!("mock://{}", name),
        name,
        storage,
        ingestion,
    )
}

pub fn records(values: Vec<Value>) -> Vec<RawRecord> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => map,
            other => panic!("test record is not an object: {other}"),
        })
        .collect()
}

pub fn record_stream(values: Vec<Value>) -> impl Stream<Item = IngestResult<RawRecord>> + Send {
    futures::stream::iter(records(values).into_iter().map(Ok))
}

// ============================================================================
// Mock backend
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    TableExists,
    MakeTable,
    TruncateTable,
    ResetSequence,
    CheckPrimaryIndex,
    MakeIndex,
    Ingest { records: usize },
}

#[derive(Debug, Default)]
pub struct MockState {
    pub table_exists: bool,
    pub primary_index: Option<String>,
    pub calls: Vec<Call>,
    pub rows: Vec<PreparedRecord>,
    /// Value of `n` on the first record of every successfully written batch
    pub completed_batches: Vec<i64>,
}

/// Concurrency gauge shared by every adapter of one factory
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct MockAdapter {
    state: Mutex<MockState>,
    in_flight: Arc<InFlight>,
}

impl MockAdapter {
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn ingest_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Ingest { .. }))
            .count()
    }

    pub fn rows(&self) -> Vec<PreparedRecord> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn completed_batches(&self) -> Vec<i64> {
        self.state.lock().unwrap().completed_batches.clone()
    }

    pub fn table_exists_now(&self) -> bool {
        self.state.lock().unwrap().table_exists
    }

    pub fn primary_index(&self) -> Option<String> {
        self.state.lock().unwrap().primary_index.clone()
    }

    fn log(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl DatabaseAdapter for MockAdapter {
    fn backend(&self) -> &str {
        MOCK_BACKEND
    }

    async fn table_exists(&self, _config: &DestinationConfig) -> IngestResult<bool> {
        self.log(Call::TableExists);
        Ok(self.table_exists_now())
    }

    async fn make_table(&self, _config: &DestinationConfig) -> IngestResult<()> {
        self.log(Call::MakeTable);
        self.state.lock().unwrap().table_exists = true;
        Ok(())
    }

    async fn truncate_table(&self, _config: &DestinationConfig) -> IngestResult<()> {
        self.log(Call::TruncateTable);
        self.state.lock().unwrap().rows.clear();
        Ok(())
    }

    async fn reset_sequence(&self, _config: &DestinationConfig) -> IngestResult<()> {
        self.log(Call::ResetSequence);
        Ok(())
    }

    async fn check_primary_index(
        &self,
        _config: &DestinationConfig,
    ) -> IngestResult<Option<String>> {
        self.log(Call::CheckPrimaryIndex);
        Ok(self.primary_index())
    }

    async fn make_index(&self, config: &DestinationConfig) -> IngestResult<()> {
        self.log(Call::MakeIndex);
        if config.has_primary_key() {
            self.state.lock().unwrap().primary_index = Some(format!("{}_pk_idx", config.table));
        }
        Ok(())
    }

    async fn ingest_records(
        &self,
        batch: &[RawRecord],
        config: &DestinationConfig,
    ) -> IngestResult<usize> {
        let prepared = self.prepare_record_batch(batch, config)?;

        let delay = batch
            .first()
            .and_then(|r| r.get("delay_ms"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        self.in_flight.enter();
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.in_flight.exit();

        let fail = batch
            .iter()
            .any(|r| r.get("fail_on").and_then(Value::as_str) == Some(config.id.name.as_str()));

        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Ingest { records: prepared.len() });

        if fail {
            return Err(IngestError::database(config, Stage::Ingest)(sqlx::Error::Protocol(
                "simulated write failure".to_string(),
            )));
        }

        if let Some(n) = batch.first().and_then(|r| r.get("n")).and_then(Value::as_i64) {
            state.completed_batches.push(n);
        }
        let written = prepared.len();
        state.rows.extend(prepared);
        Ok(written)
    }
}

/// Hands out one [`MockAdapter`] per destination name, reused across connects
#[derive(Clone, Default)]
pub struct MockFactory {
    adapters: Arc<Mutex<HashMap<String, Arc<MockAdapter>>>>,
    existing: Arc<Mutex<HashMap<String, Option<String>>>>,
    connects: Arc<AtomicUsize>,
    in_flight: Arc<InFlight>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the destination's table already exists, optionally with an index
    pub fn with_existing_table(self, destination: &str, index: Option<&str>) -> Self {
        self.existing
            .lock()
            .unwrap()
            .insert(destination.to_string(), index.map(str::to_string));
        self
    }

    pub fn registry(&self) -> AdapterRegistry {
        let mut registry = AdapterRegistry::with_defaults();
        registry.register(Arc::new(self.clone()));
        registry
    }

    pub fn adapter(&self, destination: &str) -> Arc<MockAdapter> {
        self.adapters
            .lock()
            .unwrap()
            .get(destination)
            .cloned()
            .unwrap_or_else(|| panic!("no adapter connected for '{destination}'"))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak()
    }
}

#[async_trait]
impl AdapterFactory for MockFactory {
    fn backends(&self) -> &[&'static str] {
        &[MOCK_BACKEND]
    }

    async fn connect(&self, config: &DestinationConfig) -> IngestResult<Arc<dyn DatabaseAdapter>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let existing = self.existing.lock().unwrap().get(&config.id.name).cloned();
        let adapter: Arc<MockAdapter> = self
            .adapters
            .lock()
            .unwrap()
            .entry(config.id.name.clone())
            .or_insert_with(|| {
                let state = MockState {
                    table_exists: existing.is_some(),
                    primary_index: existing.flatten(),
                    ..MockState::default()
                };
                Arc::new(MockAdapter {
                    state: Mutex::new(state),
                    in_flight: Arc::clone(&self.in_flight),
                })
            })
            .clone();

        Ok(adapter as Arc<dyn DatabaseAdapter>)
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with a connected pool
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
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

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}
