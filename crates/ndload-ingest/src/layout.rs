//! Physical table layout shared by every backend

use ndload_common::{DestinationConfig, StorageStrategy};

/// Opaque record identifier of the simple layouts (primary key)
pub const ID_COLUMN: &str = "id";

/// Opaque record identifier of the explicit layouts (unique)
pub const RECORD_ID_COLUMN: &str = "record_id";

pub const RECORD_NUMBER_COLUMN: &str = "record_number";

pub const LOAD_TIMESTAMP_COLUMN: &str = "load_timestamp";

pub const PAYLOAD_COLUMN: &str = "payload";

pub const OVERFLOW_COLUMN: &str = "overflow";

/// Column names a descriptor may not use in the explicit layouts
pub const RESERVED_COLUMNS: [&str; 4] = [
    RECORD_ID_COLUMN,
    RECORD_NUMBER_COLUMN,
    LOAD_TIMESTAMP_COLUMN,
    OVERFLOW_COLUMN,
];

/// Name of the record identifier column for a storage strategy
pub fn identifier_column(storage: StorageStrategy) -> &'static str {
    if storage.is_simple() {
        ID_COLUMN
    } else {
        RECORD_ID_COLUMN
    }
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"` for the destination
pub fn qualified_table(config: &DestinationConfig, default_schema: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(config.effective_schema(default_schema)),
        quote_ident(&config.table)
    )
}

/// Name of the unique index created over the primary key columns
pub fn index_name(config: &DestinationConfig) -> String {
    format!("{}_pk_idx", config.table)
}

/// Quoted, comma-separated primary key column list
pub fn primary_key_list(config: &DestinationConfig) -> String {
    config
        .primary_keys()
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}
