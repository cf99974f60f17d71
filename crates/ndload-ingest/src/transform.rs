//! Record transformation
//!
//! Pure conversion of raw decoded records into storage-ready records for one
//! destination. The input batch is shared between destinations and is only
//! ever borrowed here; every call builds fresh [`PreparedRecord`]s.

use crate::error::{IngestError, IngestResult};
use crate::layout::{OVERFLOW_COLUMN, PAYLOAD_COLUMN};
use chrono::{DateTime, Utc};
use ndload_common::{DestinationConfig, StorageStrategy};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One decoded input object
pub type RawRecord = Map<String, Value>;

/// Ordered records handed to every destination
pub type Batch = Vec<RawRecord>;

/// Value of one prepared column
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// SQL NULL
    Null,
    /// Written as literal structured JSON
    Json(Value),
    Text(String),
    TextArray(Vec<String>),
}

impl FieldValue {
    /// Textual form used by backends without native JSON or array types
    pub fn to_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Json(value) => Some(value.to_string()),
            FieldValue::Text(text) => Some(text.clone()),
            FieldValue::TextArray(items) => Some(Value::from(items.clone()).to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedField {
    pub column: String,
    pub value: FieldValue,
}

/// A record shaped for one destination
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub id: Uuid,
    pub load_timestamp: DateTime<Utc>,
    /// Data columns in write order; system columns are not included
    pub fields: Vec<PreparedField>,
}

impl PreparedRecord {
    fn new(load_timestamp: DateTime<Utc>, fields: Vec<PreparedField>) -> Self {
        Self {
            id: Uuid::new_v4(),
            load_timestamp,
            fields,
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.column.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| &f.value)
    }
}

/// Transform a batch according to the destination's storage strategy.
///
/// The result keeps the relative order of the input. Explicit strategies may
/// return fewer records when constraint enforcement drops records without a
/// complete primary key.
pub fn prepare_batch(
    batch: &[RawRecord],
    config: &DestinationConfig,
    loaded_at: DateTime<Utc>,
) -> IngestResult<Vec<PreparedRecord>> {
    match config.storage {
        StorageStrategy::Json => Ok(batch
            .iter()
            .map(|record| {
                single_payload(loaded_at, FieldValue::Json(Value::Object(record.clone())))
            })
            .collect()),
        StorageStrategy::Text => Ok(batch
            .iter()
            .map(|record| single_payload(loaded_at, FieldValue::Text(serialize(record))))
            .collect()),
        StorageStrategy::CsvArray => Ok(batch
            .iter()
            .map(|record| {
                let parts = serialize(record).split(',').map(str::to_string).collect();
                single_payload(loaded_at, FieldValue::TextArray(parts))
            })
            .collect()),
        StorageStrategy::Explicit | StorageStrategy::ExplicitJsonOverflow => {
            if config.columns.is_empty() || !config.has_primary_key() {
                return Err(IngestError::config(
                    &config.id,
                    format!(
                        "storage strategy '{}' requires columns with at least one primary key",
                        config.storage
                    ),
                ));
            }

            let with_overflow = config.storage == StorageStrategy::ExplicitJsonOverflow;
            let primary_keys = config.primary_keys();

            Ok(batch
                .iter()
                .filter_map(|record| {
                    let record = if config.strip_empty_strings {
                        strip_empty_strings(record)
                    } else {
                        record.clone()
                    };

                    if config.enforce_constraint && !has_complete_key(&record, &primary_keys) {
                        tracing::trace!(
                            destination = %config.id,
                            "Dropping record with missing primary key"
                        );
                        return None;
                    }

                    Some(project(record, config, with_overflow, loaded_at))
                })
                .collect())
        },
    }
}

fn single_payload(loaded_at: DateTime<Utc>, value: FieldValue) -> PreparedRecord {
    PreparedRecord::new(
        loaded_at,
        vec![PreparedField {
            column: PAYLOAD_COLUMN.to_string(),
            value,
        }],
    )
}

fn serialize(record: &RawRecord) -> String {
    Value::Object(record.clone()).to_string()
}

fn strip_empty_strings(record: &RawRecord) -> RawRecord {
    record
        .iter()
        .filter(|(_, v)| !matches!(v, Value::String(s) if s.is_empty()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn has_complete_key(record: &RawRecord, primary_keys: &[&str]) -> bool {
    primary_keys
        .iter()
        .all(|key| !matches!(record.get(*key), None | Some(Value::Null)))
}

fn project(
    mut record: RawRecord,
    config: &DestinationConfig,
    with_overflow: bool,
    loaded_at: DateTime<Utc>,
) -> PreparedRecord {
    let mut fields = Vec::with_capacity(config.columns.len() + 1);

    for column in &config.columns {
        let Some(value) = record.remove(&column.name) else {
            continue;
        };
        let value = match value {
            Value::Null => FieldValue::Null,
            value if column.is_structured() => FieldValue::Json(value),
            Value::String(s) => FieldValue::Text(s),
            other => FieldValue::Text(other.to_string()),
        };
        fields.push(PreparedField {
            column: column.name.clone(),
            value,
        });
    }

    if with_overflow {
        fields.push(PreparedField {
            column: OVERFLOW_COLUMN.to_string(),
            value: FieldValue::Json(Value::Object(record)),
        });
    }

    PreparedRecord::new(loaded_at, fields)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ndload_common::{ColumnDescriptor, DestinationId, IngestionStrategy};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn destination(storage: StorageStrategy, columns: Vec<ColumnDescriptor>) -> DestinationConfig {
        DestinationConfig::new(
            DestinationId::new("ns", "d"),
            "sqlite",
            "sqlite::memory:",
            "t",
            storage,
            IngestionStrategy::Insert,
        )
        .with_columns(columns)
    }

    fn explicit(storage: StorageStrategy) -> DestinationConfig {
        destination(
            storage,
            vec![
                ColumnDescriptor::new("id").primary_key(),
                ColumnDescriptor::new("val"),
                ColumnDescriptor::new("meta").with_type("jsonb"),
            ],
        )
    }

    #[test]
    fn test_json_wraps_whole_record() {
        let batch = vec![record(json!({"a": 1, "b": {"c": [1, 2]}}))];
        let config = destination(StorageStrategy::Json, vec![]);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(prepared.len(), 1);
        assert_eq!(
            prepared[0].get(PAYLOAD_COLUMN),
            Some(&FieldValue::Json(json!({"a": 1, "b": {"c": [1, 2]}})))
        );
    }

    #[test]
    fn test_text_serializes_record() {
        let batch = vec![record(json!({"a": 1}))];
        let config = destination(StorageStrategy::Text, vec![]);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(prepared[0].get(PAYLOAD_COLUMN), Some(&FieldValue::Text(r#"{"a":1}"#.into())));
    }

    #[test]
    fn test_csv_array_splits_on_commas() {
        let batch = vec![record(json!({"a": 1, "b": "x"}))];
        let config = destination(StorageStrategy::CsvArray, vec![]);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(
            prepared[0].get(PAYLOAD_COLUMN),
            Some(&FieldValue::TextArray(vec![r#"{"a":1"#.into(), r#""b":"x"}"#.into()]))
        );
    }

    #[test]
    fn test_every_record_gets_identity_and_timestamp() {
        let loaded_at = Utc::now();
        let batch = vec![record(json!({"a": 1})), record(json!({"a": 2}))];
        let config = destination(StorageStrategy::Json, vec![]);
        let prepared = prepare_batch(&batch, &config, loaded_at).unwrap();

        assert_ne!(prepared[0].id, prepared[1].id);
        assert!(prepared.iter().all(|r| r.load_timestamp == loaded_at));
    }

    #[test]
    fn test_explicit_omits_missing_columns() {
        let batch = vec![record(json!({"id": "x", "extra": true}))];
        let config = explicit(StorageStrategy::Explicit);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(prepared[0].column_names().collect::<Vec<_>>(), vec!["id"]);
        assert_eq!(prepared[0].get("val"), None);
    }

    #[test]
    fn test_explicit_coerces_scalars_and_keeps_structured_columns() {
        let batch = vec![record(json!({"id": 7, "val": [1, "a"], "meta": {"k": 1}}))];
        let config = explicit(StorageStrategy::Explicit);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(prepared[0].get("id"), Some(&FieldValue::Text("7".into())));
        assert_eq!(prepared[0].get("val"), Some(&FieldValue::Text(r#"[1,"a"]"#.into())));
        assert_eq!(prepared[0].get("meta"), Some(&FieldValue::Json(json!({"k": 1}))));
    }

    #[test]
    fn test_explicit_keeps_null_as_sql_null() {
        let batch = vec![record(json!({"id": "x", "val": null}))];
        let config = explicit(StorageStrategy::Explicit);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(prepared[0].get("val"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_enforce_constraint_drops_incomplete_keys() {
        let config = explicit(StorageStrategy::Explicit).enforcing_constraint(true);
        let batch = vec![
            record(json!({"id": "a", "val": "1"})),
            record(json!({"val": "2"})),
            record(json!({"id": null, "val": "3"})),
            record(json!({"id": "b", "val": "4"})),
        ];
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        let ids: Vec<_> = prepared.iter().map(|r| r.get("id").cloned()).collect();
        assert_eq!(
            ids,
            vec![Some(FieldValue::Text("a".into())), Some(FieldValue::Text("b".into()))]
        );
    }

    #[test]
    fn test_without_enforcement_incomplete_keys_are_kept() {
        let batch = vec![record(json!({"val": "2"}))];
        let config = explicit(StorageStrategy::Explicit);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();
        assert_eq!(prepared.len(), 1);
    }

    #[test]
    fn test_strip_empty_strings_happens_before_key_check() {
        let config = explicit(StorageStrategy::Explicit)
            .enforcing_constraint(true)
            .stripping_empty_strings(true);
        let batch = vec![
            record(json!({"id": "", "val": "1"})),
            record(json!({"id": "k", "val": ""})),
        ];
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].column_names().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_overflow_collects_unprojected_fields() {
        let batch = vec![record(json!({"id": "x", "val": "1", "other": 2, "more": {"a": 1}}))];
        let config = explicit(StorageStrategy::ExplicitJsonOverflow);
        let prepared = prepare_batch(&batch, &config, Utc::now()).unwrap();

        assert_eq!(
            prepared[0].get(OVERFLOW_COLUMN),
            Some(&FieldValue::Json(json!({"other": 2, "more": {"a": 1}})))
        );
        assert_eq!(prepared[0].get("val"), Some(&FieldValue::Text("1".into())));
    }

    #[test]
    fn test_explicit_without_primary_key_is_a_config_error() {
        let config = destination(StorageStrategy::Explicit, vec![ColumnDescriptor::new("val")]);
        let err = prepare_batch(&[], &config, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::Config { .. }));
    }

    #[test]
    fn test_shared_batch_is_not_mutated() {
        let batch = vec![record(json!({"id": "x", "val": "", "rest": 1}))];
        let before = batch.clone();
        let config = explicit(StorageStrategy::ExplicitJsonOverflow).stripping_empty_strings(true);

        prepare_batch(&batch, &config, Utc::now()).unwrap();
        prepare_batch(&batch, &destination(StorageStrategy::Json, vec![]), Utc::now()).unwrap();

        assert_eq!(batch, before);
    }

    proptest! {
        #[test]
        fn prop_overflow_and_projection_partition_record_keys(
            fields in proptest::collection::btree_map("[a-f]", "[a-z]{0,3}", 0..6),
            columns in proptest::collection::btree_set("[a-f]", 1..4),
        ) {
            let descriptors = columns
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let column = ColumnDescriptor::new(name.clone());
                    if i == 0 { column.primary_key() } else { column }
                })
                .collect();
            let config = destination(StorageStrategy::ExplicitJsonOverflow, descriptors);
            let raw: RawRecord = fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();

            let prepared = prepare_batch(&[raw], &config, Utc::now()).unwrap();
            prop_assert_eq!(prepared.len(), 1);

            let projected: BTreeSet<String> = prepared[0]
                .column_names()
                .filter(|c| *c != OVERFLOW_COLUMN)
                .map(str::to_string)
                .collect();
            let overflow: BTreeSet<String> = match prepared[0].get(OVERFLOW_COLUMN) {
                Some(FieldValue::Json(Value::Object(map))) => map.keys().cloned().collect(),
                other => panic!("unexpected overflow value: {other:?}"),
            };

            prop_assert!(projected.is_disjoint(&overflow));
            let union: BTreeSet<String> = projected.union(&overflow).cloned().collect();
            let original: BTreeSet<String> = fields.keys().cloned().collect();
            prop_assert_eq!(union, original);
        }
    }
}
