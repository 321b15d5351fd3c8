//! Product attributes derived from names and trait labels.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::table::{KeyedTable, TableError, Value};

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("product name pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

pub const DEFAULT_TRAIT: &str = "Conventional";

/// Maturity code at or below zero.
pub const NON_POSITIVE_MATURITY: f64 = -0.1;

/// Sorted, non-overlapping `[lower, upper)` ranges of the two-digit
/// maturity code and the bucket each maps to.
const MATURITY_BUCKETS: [(i64, i64, f64); 18] = [
    (1, 5, 0.0),
    (5, 10, 0.5),
    (10, 15, 1.0),
    (15, 20, 1.5),
    (20, 25, 2.0),
    (25, 30, 2.5),
    (30, 35, 3.0),
    (35, 40, 3.5),
    (40, 45, 4.0),
    (45, 50, 4.5),
    (50, 55, 5.0),
    (55, 60, 5.5),
    (60, 65, 6.0),
    (65, 70, 6.5),
    (70, 75, 7.0),
    (75, 80, 7.5),
    (80, 85, 8.0),
    (85, 90, 8.5),
];

/// Bucket for a maturity code. Codes of 90 and above have no bucket.
pub fn maturity_bucket(code: i64) -> Option<f64> {
    if code <= 0 {
        return Some(NON_POSITIVE_MATURITY);
    }
    MATURITY_BUCKETS
        .binary_search_by(|(lower, upper, _)| {
            if code < *lower {
                std::cmp::Ordering::Greater
            } else if code >= *upper {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .ok()
        .map(|idx| MATURITY_BUCKETS[idx].2)
}

fn compiled(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex, ProductError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|err| ProductError::Pattern(err.clone()))
}

fn digit_run() -> Result<&'static Regex, ProductError> {
    static DIGITS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    compiled(&DIGITS, "[0-9]+")
}

fn non_digit() -> Result<&'static Regex, ProductError> {
    static NON_DIGITS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    compiled(&NON_DIGITS, "[^0-9]")
}

/// First two characters of the first digit run in a product name, e.g.
/// `"P1185AM"` gives 11. Names without digits give 0.
pub fn maturity_code(product_name: &str) -> Result<i64, ProductError> {
    Ok(digit_run()?
        .find(product_name)
        .and_then(|m| {
            let digits = m.as_str();
            digits[..digits.len().min(2)].parse::<i64>().ok()
        })
        .unwrap_or(0))
}

/// Germplasm number of a product: every digit of its name, in order, so
/// `"P1185AM"` and `"P1185AMX"` share germplasm `"1185"`. Names without
/// digits have none.
pub fn germplasm(product_name: &str) -> Result<Option<String>, ProductError> {
    let digits = non_digit()?.replace_all(product_name, "");
    Ok((!digits.is_empty()).then(|| digits.into_owned()))
}

/// Appends `output` holding the maturity bucket of each product name.
/// Missing names and unbucketed codes give null.
pub fn add_maturity_column(
    table: &mut KeyedTable,
    product_column: &str,
    output: &str,
) -> Result<(), ProductError> {
    let buckets = table
        .column_values(product_column)?
        .iter()
        .map(|cell| match cell {
            Value::Str(name) => Ok(maturity_bucket(maturity_code(name)?).into()),
            _ => Ok(Value::Null),
        })
        .collect::<Result<Vec<Value>, ProductError>>()?;
    table.add_column(output, buckets)?;
    Ok(())
}

/// Appends `output` holding the germplasm of each product name.
pub fn add_germplasm_column(
    table: &mut KeyedTable,
    product_column: &str,
    output: &str,
) -> Result<(), ProductError> {
    let numbers = table
        .column_values(product_column)?
        .iter()
        .map(|cell| match cell {
            Value::Str(name) => Ok(germplasm(name)?.into()),
            _ => Ok(Value::Null),
        })
        .collect::<Result<Vec<Value>, ProductError>>()?;
    table.add_column(output, numbers)?;
    Ok(())
}

/// Rewrites trait labels through `aliases` (e.g. `HT3 -> XF`); returns the
/// number of cells changed.
pub fn normalize_traits(
    table: &mut KeyedTable,
    trait_column: &str,
    aliases: &BTreeMap<String, String>,
) -> Result<usize, TableError> {
    if aliases.is_empty() {
        return Ok(0);
    }
    let mut changed = 0;
    table.map_column(trait_column, |cell| match cell.as_str().and_then(|t| aliases.get(t)) {
        Some(canonical) => {
            changed += 1;
            Value::from(canonical.as_str())
        }
        None => cell.clone(),
    })?;
    Ok(changed)
}

pub fn default_trait_aliases() -> BTreeMap<String, String> {
    BTreeMap::from([("HT3".to_string(), "XF".to_string())])
}
