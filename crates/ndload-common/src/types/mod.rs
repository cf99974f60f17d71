//! Common types used across ndload

use serde::{Deserialize, Serialize};

/// How an incoming JSON record's shape maps onto the destination's columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageStrategy {
    /// Whole record in one structured payload column
    Json,
    /// Whole record serialised to text in one payload column
    Text,
    /// Serialised record split on commas into an array payload column
    CsvArray,
    /// Records projected onto the configured columns
    Explicit,
    /// Projection plus a structured column holding every unprojected field
    ExplicitJsonOverflow,
}

impl StorageStrategy {
    /// Strategies with the fixed four-column layout
    pub fn is_simple(self) -> bool {
        matches!(self, Self::Json | Self::Text | Self::CsvArray)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::CsvArray => "csv-array",
            Self::Explicit => "explicit",
            Self::ExplicitJsonOverflow => "explicit-json-overflow",
        }
    }
}

impl std::fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a batch of prepared records is applied to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionStrategy {
    /// Plain insert
    Insert,
    /// Same as `Insert`
    Append,
    /// Truncate once at setup, then insert
    Refresh,
    /// Upsert on the primary key columns
    Merge,
}

impl IngestionStrategy {
    pub fn is_upsert(self) -> bool {
        matches!(self, Self::Merge)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Append => "append",
            Self::Refresh => "refresh",
            Self::Merge => "merge",
        }
    }
}

impl std::fmt::Display for IngestionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured column of an explicit layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,

    /// Part of the primary key used for `merge` and constraint checks
    #[serde(default)]
    pub pk: bool,

    /// Declared SQL type; `None` means the backend's text type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pk: false,
            data_type: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.pk = true;
        self
    }

    pub fn with_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    /// Whether values of this column are written as literal JSON
    pub fn is_structured(&self) -> bool {
        self.data_type
            .as_deref()
            .map(|t| matches!(t.trim().to_ascii_lowercase().as_str(), "json" | "jsonb"))
            .unwrap_or(false)
    }
}

/// Identifies one destination inside a target namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId {
    pub namespace: String,
    pub name: String,
}

impl DestinationId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DestinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// One configured destination.
///
/// Parsed once at startup and never mutated by the engine. The `id` is filled
/// in by the loader from the position of the entry in the `targets` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(skip)]
    pub id: DestinationId,

    /// Backend identifier, e.g. `postgres` or `sqlite`
    pub adapter: String,

    /// Connection string, placeholders already resolved after loading
    pub connection: String,

    #[serde(default)]
    pub schema: Option<String>,

    pub table: String,

    pub storage: StorageStrategy,

    pub ingestion: IngestionStrategy,

    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,

    /// Drop records with a null or missing primary key before writing
    #[serde(default)]
    pub enforce_constraint: bool,

    /// Remove fields holding an empty string before projection
    #[serde(default)]
    pub strip_empty_strings: bool,

    /// Connection pool size for this destination
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl DestinationConfig {
    /// Minimal configuration, mostly useful in tests and embedding code
    pub fn new(
        id: DestinationId,
        adapter: impl Into<String>,
        connection: impl Into<String>,
        table: impl Into<String>,
        storage: StorageStrategy,
        ingestion: IngestionStrategy,
    ) -> Self {
        Self {
            id,
            adapter: adapter.into(),
            connection: connection.into(),
            schema: None,
            table: table.into(),
            storage,
            ingestion,
            columns: Vec::new(),
            enforce_constraint: false,
            strip_empty_strings: false,
            max_connections: None,
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnDescriptor>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn enforcing_constraint(mut self, enforce: bool) -> Self {
        self.enforce_constraint = enforce;
        self
    }

    pub fn stripping_empty_strings(mut self, strip: bool) -> Self {
        self.strip_empty_strings = strip;
        self
    }

    /// Names of the primary key columns in declaration order
    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.pk)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.pk)
    }

    pub fn is_simple_storage(&self) -> bool {
        self.storage.is_simple()
    }

    /// Whether the named descriptor column takes literal JSON
    pub fn is_structured_column(&self, name: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.name == name && c.is_structured())
    }

    /// Schema to use, falling back to the backend default
    pub fn effective_schema<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().filter(|s| !s.is_empty()).unwrap_or(default)
    }
}
