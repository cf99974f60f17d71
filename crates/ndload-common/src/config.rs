//! Loader configuration (ndload.yml)
//!
//! The configuration names one or more target namespaces, each a map of
//! destination name to destination settings. Connection strings are
//! interpolated from the environment when the file is loaded.

use crate::error::{NdloadError, Result};
use crate::interpolate::interpolate_env;
use crate::types::{DestinationConfig, DestinationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Top-level loader configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on concurrently running write operations
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Write batches to each destination strictly in arrival order
    #[serde(default)]
    pub ordered: bool,

    /// Namespace -> destination name -> destination
    pub targets: BTreeMap<String, BTreeMap<String, DestinationConfig>>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl LoaderConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NdloadError::config(format!(
                "Configuration file '{}' does not exist",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;

        tracing::debug!(
            path = %path.display(),
            namespaces = config.targets.len(),
            "Loaded loader configuration"
        );

        Ok(config)
    }

    /// Parse configuration from YAML text, resolving placeholders
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: LoaderConfig = serde_yaml::from_str(content)?;

        for (namespace, destinations) in config.targets.iter_mut() {
            for (name, destination) in destinations.iter_mut() {
                destination.id = DestinationId::new(namespace.clone(), name.clone());
                destination.connection =
                    interpolate_env(&destination.connection).map_err(|e| match e {
                        NdloadError::MissingVariable(var) => NdloadError::config(format!(
                            "destination '{}.{}': environment variable '{}' used in the connection string is not set",
                            namespace, name, var
                        )),
                        other => other,
                    })?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on a particular destination
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(NdloadError::config("batch_size must be greater than 0"));
        }

        if self.max_in_flight == Some(0) {
            return Err(NdloadError::config("max_in_flight must be greater than 0"));
        }

        if self.targets.is_empty() {
            return Err(NdloadError::config("no target namespaces configured"));
        }

        for (namespace, destinations) in &self.targets {
            if destinations.is_empty() {
                return Err(NdloadError::config(format!(
                    "target namespace '{}' has no destinations",
                    namespace
                )));
            }
        }

        Ok(())
    }

    /// Destinations of one target namespace, ordered by name
    pub fn namespace(&self, namespace: &str) -> Result<Vec<DestinationConfig>> {
        match self.targets.get(namespace) {
            Some(destinations) => Ok(destinations.values().cloned().collect()),
            None => {
                let known: Vec<&str> = self.targets.keys().map(String::as_str).collect();
                Err(NdloadError::config(format!(
                    "unknown target namespace '{}' (configured: {})",
                    namespace,
                    known.join(", ")
                )))
            },
        }
    }
}
