//! Feature-table schema and fingerprint shared with the downstream model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::table::{FeatureDType, KeyedTable, TableError};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub fn build_feature_schema(table: &KeyedTable) -> Result<FeatureSchema, SchemaError> {
    let columns: Vec<FeatureColumn> = table
        .columns()
        .into_iter()
        .map(|name| {
            let dtype = table.column_dtype(&name)?;
            Ok(FeatureColumn { name, dtype })
        })
        .collect::<Result<_, SchemaError>>()?;

    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    info!(
        component = "schema",
        event = "schema.built",
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    Ok(FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    })
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.dtype.as_str()));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;

    fn table(columns: &[&str]) -> KeyedTable {
        let row = columns.iter().map(|_| Value::Float(1.0)).collect();
        KeyedTable::from_rows(columns.iter().copied(), vec![row]).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_sensitive() {
        let a = build_feature_schema(&table(&["year", "order_Q", "order_Q_1"])).unwrap();
        let b = build_feature_schema(&table(&["year", "order_Q", "order_Q_1"])).unwrap();
        let c = build_feature_schema(&table(&["year", "order_Q_1", "order_Q"])).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn compatibility_check_matches_version_and_fingerprint() {
        let schema = build_feature_schema(&table(&["year"])).unwrap();

        assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, &schema)
            .expect("compatibility should pass");

        let err = assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &schema.fingerprint, &schema)
            .expect_err("version mismatch expected");
        assert!(matches!(err, SchemaError::SchemaVersionMismatch { .. }));

        let err = assert_schema_compatible(FEATURE_SCHEMA_VERSION, "not-real", &schema)
            .expect_err("fingerprint mismatch expected");
        assert!(matches!(err, SchemaError::SchemaFingerprintMismatch { .. }));
    }
}
