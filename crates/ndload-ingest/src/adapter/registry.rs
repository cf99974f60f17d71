//! Backend lookup by adapter identifier

use super::{AdapterFactory, DatabaseAdapter, PostgresFactory, SqliteFactory};
use crate::error::{Dimension, IngestError, IngestResult};
use ndload_common::DestinationConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps adapter identifiers to the factories that connect them
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the PostgreSQL and SQLite backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresFactory));
        registry.register(Arc::new(SqliteFactory));
        registry
    }

    /// Register a factory under every identifier it reports, replacing earlier ones
    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) -> &mut Self {
        for backend in factory.backends() {
            self.factories
                .insert(backend.to_ascii_lowercase(), Arc::clone(&factory));
        }
        self
    }

    /// Registered identifiers, sorted
    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Find the factory for a destination and check it supports both strategies
    pub fn resolve(&self, config: &DestinationConfig) -> IngestResult<Arc<dyn AdapterFactory>> {
        let backend = config.adapter.trim().to_ascii_lowercase();

        let factory = self.factories.get(&backend).ok_or_else(|| IngestError::UnsupportedAdapter {
            destination: config.id.clone(),
            backend: config.adapter.clone(),
            dimension: Dimension::Backend,
            value: config.adapter.clone(),
        })?;

        if !factory.supports_storage(config.storage) {
            return Err(IngestError::UnsupportedAdapter {
                destination: config.id.clone(),
                backend,
                dimension: Dimension::StorageStrategy,
                value: config.storage.to_string(),
            });
        }

        if !factory.supports_ingestion(config.ingestion) {
            return Err(IngestError::UnsupportedAdapter {
                destination: config.id.clone(),
                backend,
                dimension: Dimension::IngestionStrategy,
                value: config.ingestion.to_string(),
            });
        }

        Ok(Arc::clone(factory))
    }

    /// Resolve and connect in one step
    pub async fn connect(
        &self,
        config: &DestinationConfig,
    ) -> IngestResult<Arc<dyn DatabaseAdapter>> {
        self.resolve(config)?.connect(config).await
    }
}
