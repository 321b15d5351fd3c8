//! Year-lagged features.
//!
//! For offset `k`, a copy of the table is shifted forward by `k` years,
//! its value columns are renamed `{value}_{prefix}{k}`, and it is
//! left-joined back on (year, key). The row at year Y therefore picks up the
//! value recorded at Y-k for the same key. Joining on the calendar year
//! rather than shifting by row keeps gaps in a key's history as gaps.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use polars::prelude::{col, lit, Expr};

use crate::table::{KeyedTable, TableError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LagFill {
    /// No history means zero (quantities).
    #[default]
    Zero,
    /// No history stays missing for a later terminal fill.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSpec {
    pub year_column: String,
    /// Non-year key columns.
    pub key: Vec<String>,
    pub values: Vec<String>,
    pub offsets: Vec<u32>,
    #[serde(default)]
    pub suffix_prefix: String,
    #[serde(default)]
    pub fill: LagFill,
}

#[derive(Debug, Error)]
pub enum LagError {
    #[error("invalid lag spec: {0}")]
    InvalidSpec(String),
    #[error("year value '{0}' is not an integer year")]
    InvalidYear(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

impl LagSpec {
    pub fn new(year_column: &str, key: &[&str], values: &[&str], offsets: &[u32]) -> Self {
        Self {
            year_column: year_column.to_string(),
            key: key.iter().map(|k| k.to_string()).collect(),
            values: values.iter().map(|v| v.to_string()).collect(),
            offsets: offsets.to_vec(),
            suffix_prefix: String::new(),
            fill: LagFill::Zero,
        }
    }

    pub fn with_suffix_prefix(mut self, prefix: &str) -> Self {
        self.suffix_prefix = prefix.to_string();
        self
    }

    pub fn with_fill(mut self, fill: LagFill) -> Self {
        self.fill = fill;
        self
    }

    pub fn column_name(&self, value: &str, offset: u32) -> String {
        format!("{value}_{}{offset}", self.suffix_prefix)
    }

    pub fn validate(&self) -> Result<(), LagError> {
        if self.values.is_empty() {
            return Err(LagError::InvalidSpec("values must not be empty".to_string()));
        }
        if self.offsets.is_empty() {
            return Err(LagError::InvalidSpec(
                "offsets must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for offset in &self.offsets {
            if *offset == 0 {
                return Err(LagError::InvalidSpec("offsets must be > 0".to_string()));
            }
            if !seen.insert(*offset) {
                return Err(LagError::InvalidSpec(
                    "offsets must be unique".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Adds `{value}_{k}` columns for every value and offset. No rows are added
/// or removed. Duplicate (year, key) tuples are rejected up front. Year
/// cells holding integral strings are rewritten as integers.
pub fn build_lags(table: &KeyedTable, spec: &LagSpec) -> Result<KeyedTable, LagError> {
    spec.validate()?;

    let mut join_key: Vec<&str> = vec![spec.year_column.as_str()];
    join_key.extend(spec.key.iter().map(String::as_str));
    table.ensure_unique(&join_key)?;

    let mut out = table.clone();
    out.normalize_int_column(&spec.year_column)
        .map_err(|err| match err {
            TableError::NonInteger { value, .. } => LagError::InvalidYear(value),
            other => other.into(),
        })?;
    for value in &spec.values {
        out.column_index(value)?;
    }

    for offset in &spec.offsets {
        let lag_columns: Vec<String> = spec
            .values
            .iter()
            .map(|value| spec.column_name(value, *offset))
            .collect();
        let shifted = KeyedTable::collect(out.lazy().select(shifted_projection(
            spec,
            &lag_columns,
            *offset,
        )))?;

        out = out.left_join(&shifted, &join_key)?;

        if spec.fill == LagFill::Zero {
            for name in &lag_columns {
                out.fill_missing(name, &Value::Float(0.0))?;
            }
        }
    }

    info!(
        component = "lag",
        event = "lag.build.finish",
        rows = out.len(),
        offsets = ?spec.offsets,
        value_columns = spec.values.len()
    );

    Ok(out)
}

/// `year + offset`, the key, and each value renamed to its lag column.
fn shifted_projection(spec: &LagSpec, lag_columns: &[String], offset: u32) -> Vec<Expr> {
    let mut exprs = vec![(col(&spec.year_column) + lit(i64::from(offset))).alias(&spec.year_column)];
    exprs.extend(spec.key.iter().map(|k| col(k)));
    exprs.extend(
        spec.values
            .iter()
            .zip(lag_columns)
            .map(|(value, name)| col(value).alias(name)),
    );
    exprs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_years_become_integer_years() {
        let table = KeyedTable::from_rows(
            ["year", "product", "order_Q"],
            vec![
                vec!["2019".into(), "P1".into(), 5.0.into()],
                vec!["2021".into(), "P1".into(), 7.0.into()],
            ],
        )
        .unwrap();
        let spec = LagSpec::new("year", &["product"], &["order_Q"], &[2]);

        let lagged = build_lags(&table, &spec).unwrap();
        assert_eq!(lagged.get(1, "year"), Some(Value::Int(2021)));
        assert_eq!(lagged.get(1, "order_Q_2"), Some(Value::Float(5.0)));
        assert_eq!(lagged.get(0, "order_Q_2"), Some(Value::Float(0.0)));
    }

    #[test]
    fn gaps_in_history_are_not_bridged() {
        let table = KeyedTable::from_rows(
            ["year", "order_Q"],
            vec![vec![2018.into(), 3.0.into()], vec![2020.into(), 9.0.into()]],
        )
        .unwrap();
        let spec = LagSpec::new("year", &[], &["order_Q"], &[1]).with_fill(LagFill::Missing);

        let lagged = build_lags(&table, &spec).unwrap();
        assert_eq!(lagged.get(1, "order_Q_1"), Some(Value::Null));
    }

    #[test]
    fn non_integer_years_are_rejected() {
        let table =
            KeyedTable::from_rows(["year", "v"], vec![vec!["MY20".into(), 1.0.into()]]).unwrap();
        assert!(matches!(
            build_lags(&table, &LagSpec::new("year", &[], &["v"], &[1])),
            Err(LagError::InvalidYear(year)) if year == "MY20"
        ));
    }

    #[test]
    fn spec_validation_rejects_zero_and_duplicate_offsets() {
        assert!(LagSpec::new("year", &[], &["v"], &[1, 0]).validate().is_err());
        assert!(LagSpec::new("year", &[], &["v"], &[2, 2]).validate().is_err());
        assert!(LagSpec::new("year", &[], &[], &[1]).validate().is_err());
        assert!(LagSpec::new("year", &[], &["v"], &[1, 2, 3]).validate().is_ok());
    }

    #[test]
    fn column_names_follow_prefix() {
        let spec = LagSpec::new("year", &[], &["CMprice"], &[1]).with_suffix_prefix("lag_");
        assert_eq!(spec.column_name("CMprice", 1), "CMprice_lag_1");
        let spec = LagSpec::new("year", &[], &["order_Q"], &[2]);
        assert_eq!(spec.column_name("order_Q", 2), "order_Q_2");
    }
}
