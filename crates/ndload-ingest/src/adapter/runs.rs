//! Grouping of prepared records into multi-row statements

use crate::layout::{identifier_column, quote_ident, LOAD_TIMESTAMP_COLUMN};
use crate::transform::{FieldValue, PreparedRecord};
use ndload_common::{ColumnDescriptor, DestinationConfig, StorageStrategy};
use std::collections::HashSet;

/// Key columns an upsert conflicts on; empty unless the destination merges
pub fn merge_keys(config: &DestinationConfig) -> Vec<&ColumnDescriptor> {
    if !config.ingestion.is_upsert() {
        return Vec::new();
    }
    config.columns.iter().filter(|c| c.pk).collect()
}

/// Split records into consecutive runs that can each be written by one
/// multi-row `INSERT`.
///
/// A run shares one column set, stays under `max_params` bind parameters
/// (each row binds `system_params` extra values), and, when `keys` is
/// non-empty, never contains the same key twice. Keys are compared the way a
/// typed column compares them, so `1` and `1.0` in a numeric key collide.
/// Records whose key has a missing or null part never conflict.
pub fn insert_runs<'a>(
    records: &'a [PreparedRecord],
    keys: &[&ColumnDescriptor],
    max_params: usize,
    system_params: usize,
) -> Vec<&'a [PreparedRecord]> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut seen: HashSet<Vec<String>> = HashSet::new();

    for (i, record) in records.iter().enumerate() {
        if i > start {
            let head = &records[start];
            let per_row = head.fields.len() + system_params;
            let max_rows = (max_params / per_row.max(1)).max(1);

            let reshaped = !head.column_names().eq(record.column_names());
            let full = i - start >= max_rows;
            let repeated = record_key(record, keys).is_some_and(|key| seen.contains(&key));

            if reshaped || full || repeated {
                runs.push(&records[start..i]);
                start = i;
                seen.clear();
            }
        }

        if let Some(key) = record_key(record, keys) {
            seen.insert(key);
        }
    }

    if start < records.len() {
        runs.push(&records[start..]);
    }

    runs
}

/// Quoted column list of a run: record identifier, data columns, load timestamp
pub fn insert_columns(storage: StorageStrategy, head: &PreparedRecord) -> String {
    std::iter::once(identifier_column(storage))
        .chain(head.column_names())
        .chain(std::iter::once(LOAD_TIMESTAMP_COLUMN))
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upsert clause for a run, empty when there are no key columns.
///
/// Every written non-key column is overwritten together with the load
/// timestamp; a run that writes nothing but key columns keeps the stored row.
pub fn conflict_clause(head: &PreparedRecord, key_columns: &[&str]) -> String {
    if key_columns.is_empty() {
        return String::new();
    }

    let target = key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updated: Vec<&str> = head
        .column_names()
        .filter(|column| !key_columns.contains(column))
        .collect();

    if updated.is_empty() {
        return format!(" ON CONFLICT ({}) DO NOTHING", target);
    }

    let assignments = updated
        .into_iter()
        .chain(std::iter::once(LOAD_TIMESTAMP_COLUMN))
        .map(|column| format!("{0} = excluded.{0}", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(" ON CONFLICT ({}) DO UPDATE SET {}", target, assignments)
}

fn record_key(record: &PreparedRecord, keys: &[&ColumnDescriptor]) -> Option<Vec<String>> {
    if keys.is_empty() {
        return None;
    }

    keys.iter()
        .map(|column| {
            record
                .get(&column.name)
                .and_then(|value| key_part(value, column.data_type.as_deref()))
        })
        .collect()
}

/// Comparable form of one key value under the column's declared type.
///
/// Two values that the database may consider equal must map to the same
/// string. Mapping unequal values together only costs an extra statement.
fn key_part(value: &FieldValue, data_type: Option<&str>) -> Option<String> {
    let text = value.to_text()?;
    let Some(data_type) = data_type.map(|t| t.trim().to_ascii_lowercase()) else {
        return Some(text);
    };

    if is_numeric_type(&data_type) {
        return Some(match text.trim().parse::<f64>() {
            Ok(n) if n == 0.0 => "0".to_string(),
            Ok(n) => n.to_string(),
            Err(_) => text.trim().to_lowercase(),
        });
    }

    if matches!(data_type.as_str(), "text" | "varchar") || data_type.starts_with("varchar(") {
        return Some(text);
    }

    Some(text.trim().to_lowercase())
}

fn is_numeric_type(data_type: &str) -> bool {
    const PREFIXES: [&str; 10] = [
        "int", "smallint", "bigint", "serial", "bigserial", "numeric", "decimal", "real", "float",
        "double",
    ];
    PREFIXES.iter().any(|prefix| data_type.starts_with(prefix))
}
