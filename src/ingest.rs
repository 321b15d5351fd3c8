//! CSV sources in, feature table out.
//!
//! Every input family goes through [`read_source`], configured by a
//! [`SourceSpec`] naming the file, header renames, row filters, an optional
//! fixed year and the typed columns to keep.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::pipeline::YEAR;
use crate::table::{KeyedTable, TableError, Value};

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y%m%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Int,
    Float,
    Str,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Name after renames.
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Keeps rows whose trimmed cell equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub column_renames: BTreeMap<String, String>,
    #[serde(default)]
    pub filters: Vec<ColumnFilter>,
    /// Stamped into the `year` column, replacing any value read from file.
    #[serde(default)]
    pub year_literal: Option<i64>,
    pub columns: Vec<ColumnSpec>,
}

impl SourceSpec {
    pub fn new(name: &str, file_path: impl Into<PathBuf>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.to_string(),
            file_path: file_path.into(),
            column_renames: BTreeMap::new(),
            filters: Vec::new(),
            year_literal: None,
            columns,
        }
    }

    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.column_renames.insert(from.to_string(), to.to_string());
        self
    }

    pub fn filter(mut self, column: &str, value: &str) -> Self {
        self.filters.push(ColumnFilter {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn with_year(mut self, year: i64) -> Self {
        self.year_literal = Some(year);
        self
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source {name} unavailable at {path}: {reason}")]
    SourceUnavailable {
        name: String,
        path: PathBuf,
        reason: String,
    },
    #[error("source {name} has no column {column}")]
    MissingColumn { name: String, column: String },
    #[error("source {name}, column {column}, row {row}: malformed value '{value}'")]
    MalformedCell {
        name: String,
        column: String,
        row: usize,
        value: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Reads the source file. A file that cannot be opened is reported as
/// `SourceUnavailable` naming the source.
pub fn read_source(spec: &SourceSpec) -> Result<KeyedTable, IngestError> {
    let file = File::open(&spec.file_path).map_err(|err| IngestError::SourceUnavailable {
        name: spec.name.clone(),
        path: spec.file_path.clone(),
        reason: err.to_string(),
    })?;
    read_source_from_reader(spec, file)
}

pub fn read_source_from_reader<R: Read>(
    spec: &SourceSpec,
    reader: R,
) -> Result<KeyedTable, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| {
            let h = h.trim();
            spec.column_renames
                .get(h)
                .cloned()
                .unwrap_or_else(|| h.to_string())
        })
        .collect();
    let position = |column: &str| -> Result<usize, IngestError> {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| IngestError::MissingColumn {
                name: spec.name.clone(),
                column: column.to_string(),
            })
    };

    let filters: Vec<(usize, &str)> = spec
        .filters
        .iter()
        .map(|f| position(&f.column).map(|idx| (idx, f.value.trim())))
        .collect::<Result<_, _>>()?;

    // No declared columns keeps every column as text.
    let columns: Vec<ColumnSpec> = if spec.columns.is_empty() {
        headers
            .iter()
            .map(|h| ColumnSpec::new(h, ColumnKind::Str))
            .collect()
    } else {
        spec.columns.clone()
    };
    let selected: Vec<(usize, &ColumnSpec)> = columns
        .iter()
        .map(|c| position(&c.name).map(|idx| (idx, c)))
        .collect::<Result<_, _>>()?;

    let mut names: Vec<String> = selected.iter().map(|(_, c)| c.name.clone()).collect();
    let year_slot = match spec.year_literal {
        Some(_) => Some(match names.iter().position(|n| n == YEAR) {
            Some(idx) => idx,
            None => {
                names.push(YEAR.to_string());
                names.len() - 1
            }
        }),
        None => None,
    };

    let width = names.len();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut read_rows = 0usize;
    for (row_number, record) in reader.records().enumerate() {
        let record = record?;
        read_rows += 1;
        if !passes_filters(&record, &filters) {
            continue;
        }

        let mut row = Vec::with_capacity(width);
        for (idx, column) in &selected {
            let raw = record.get(*idx).unwrap_or_default();
            let value = parse_cell(raw, column.kind).ok_or_else(|| IngestError::MalformedCell {
                name: spec.name.clone(),
                column: column.name.clone(),
                row: row_number + 1,
                value: raw.to_string(),
            })?;
            row.push(value);
        }
        if let (Some(slot), Some(year)) = (year_slot, spec.year_literal) {
            if slot < row.len() {
                row[slot] = Value::Int(year);
            } else {
                row.push(Value::Int(year));
            }
        }
        rows.push(row);
    }
    let table = KeyedTable::from_rows(names, rows)?;

    info!(
        component = "ingest",
        event = "ingest.source.loaded",
        source = spec.name.as_str(),
        path = %spec.file_path.display(),
        read_rows = read_rows,
        kept_rows = table.len(),
        columns = width
    );

    Ok(table)
}

fn passes_filters(record: &StringRecord, filters: &[(usize, &str)]) -> bool {
    filters
        .iter()
        .all(|(idx, expected)| record.get(*idx).map(str::trim) == Some(*expected))
}

/// Parses one raw cell. Returns `None` for a malformed value; empty cells
/// (and `-` in numeric columns) parse to `Value::Null`.
pub fn parse_cell(raw: &str, kind: ColumnKind) -> Option<Value> {
    let trimmed = raw.trim();
    match kind {
        ColumnKind::Str => Some(if trimmed.is_empty() {
            Value::Null
        } else {
            Value::from(trimmed)
        }),
        ColumnKind::Int => {
            let cleaned = sanitize_numeric(trimmed);
            if cleaned.is_empty() || cleaned == "-" {
                return Some(Value::Null);
            }
            if let Ok(v) = cleaned.parse::<i64>() {
                return Some(Value::Int(v));
            }
            match cleaned.parse::<f64>() {
                Ok(v) if v.is_finite() && v.fract() == 0.0 => Some(Value::Int(v as i64)),
                _ => None,
            }
        }
        ColumnKind::Float => {
            let cleaned = sanitize_numeric(trimmed);
            if cleaned.is_empty() || cleaned == "-" {
                return Some(Value::Null);
            }
            cleaned.parse::<f64>().ok().map(Value::Float)
        }
        ColumnKind::Date => {
            if trimmed.is_empty() {
                return Some(Value::Null);
            }
            parse_date(trimmed).map(Value::Date)
        }
    }
}

fn sanitize_numeric(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Old region id -> new region id, read from two columns of a map table.
pub fn region_map_from_table(
    map: &KeyedTable,
    old_column: &str,
    new_column: &str,
) -> Result<BTreeMap<String, String>, IngestError> {
    let old_ids = map.column_values(old_column)?;
    let new_ids = map.column_values(new_column)?;
    Ok(old_ids
        .iter()
        .zip(&new_ids)
        .filter(|(old, new)| !old.is_missing() && !new.is_missing())
        .map(|(old, new)| (old.to_string(), new.to_string()))
        .collect())
}

/// Replaces region ids through `map`; ids without an entry are kept. Region
/// ids come out as text either way. Returns the number of cells rewritten.
pub fn remap_regions(
    table: &mut KeyedTable,
    region_column: &str,
    map: &BTreeMap<String, String>,
) -> Result<usize, IngestError> {
    let mut remapped = 0;
    table.map_column(region_column, |cell| {
        if cell.is_missing() {
            return cell.clone();
        }
        let id = cell.to_string();
        match map.get(&id) {
            Some(new_id) => {
                remapped += 1;
                Value::from(new_id.as_str())
            }
            None => Value::from(id),
        }
    })?;
    Ok(remapped)
}

/// Writes the table as CSV with a header row. Nulls become empty cells.
pub fn write_feature_table(path: &Path, table: &KeyedTable) -> Result<(), IngestError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    writer.flush()?;

    info!(
        component = "ingest",
        event = "ingest.table.written",
        path = %path.display(),
        rows = table.len(),
        columns = table.columns().len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cells_are_sanitized() {
        assert_eq!(parse_cell(" $1,250 ", ColumnKind::Int), Some(Value::Int(1250)));
        assert_eq!(parse_cell("1,250.5", ColumnKind::Float), Some(Value::Float(1250.5)));
        assert_eq!(parse_cell("2020.0", ColumnKind::Int), Some(Value::Int(2020)));
        assert_eq!(parse_cell("-", ColumnKind::Float), Some(Value::Null));
        assert_eq!(parse_cell("", ColumnKind::Int), Some(Value::Null));
        assert_eq!(parse_cell("n/a", ColumnKind::Float), None);
        assert_eq!(parse_cell("-4", ColumnKind::Float), Some(Value::Float(-4.0)));
    }

    #[test]
    fn dates_accept_known_layouts() {
        let expected = Value::Date(NaiveDate::from_ymd_opt(2021, 1, 15).unwrap());
        assert_eq!(parse_cell("2021-01-15", ColumnKind::Date), Some(expected.clone()));
        assert_eq!(parse_cell("20210115", ColumnKind::Date), Some(expected.clone()));
        assert_eq!(parse_cell("01/15/2021", ColumnKind::Date), Some(expected.clone()));
        assert_eq!(parse_cell("2021-01-15 08:30:00", ColumnKind::Date), Some(expected));
        assert_eq!(parse_cell("15.01.2021", ColumnKind::Date), None);
    }

    #[test]
    fn reader_applies_renames_filters_and_year_literal() {
        let csv = "ABM,Variety_Name,Crop,Order Qty\n\
                   101,P1185AM,CORN,\"1,000\"\n\
                   102,AG36X6,SOYBEAN,50\n\
                   103,P0720Q,CORN,-\n";
        let spec = SourceSpec::new(
            "sales_2020",
            "sales_2020.csv",
            vec![
                ColumnSpec::new("region", ColumnKind::Str),
                ColumnSpec::new("product", ColumnKind::Str),
                ColumnSpec::new("order_Q", ColumnKind::Float),
            ],
        )
        .rename("ABM", "region")
        .rename("Variety_Name", "product")
        .rename("Order Qty", "order_Q")
        .filter("Crop", "CORN")
        .with_year(2020);

        let table = read_source_from_reader(&spec, csv.as_bytes()).unwrap();
        assert_eq!(table.columns(), &["region", "product", "order_Q", "year"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0, "order_Q"), Some(Value::Float(1000.0)));
        assert_eq!(table.get(1, "order_Q"), Some(Value::Null));
        assert_eq!(table.get(1, "year"), Some(Value::Int(2020)));
    }

    #[test]
    fn malformed_cell_names_source_and_column() {
        let csv = "region,order_Q\nR1,12\nR2,twelve\n";
        let spec = SourceSpec::new(
            "orders",
            "orders.csv",
            vec![
                ColumnSpec::new("region", ColumnKind::Str),
                ColumnSpec::new("order_Q", ColumnKind::Float),
            ],
        );
        match read_source_from_reader(&spec, csv.as_bytes()) {
            Err(IngestError::MalformedCell {
                name, column, row, ..
            }) => {
                assert_eq!(name, "orders");
                assert_eq!(column, "order_Q");
                assert_eq!(row, 2);
            }
            other => panic!("expected MalformedCell, got {other:?}"),
        }
    }

    #[test]
    fn region_remap_keeps_unmapped_ids() {
        let mut t = KeyedTable::from_rows(
            ["region"],
            vec![vec!["101".into()], vec!["999".into()], vec![Value::Null]],
        )
        .unwrap();
        let map = BTreeMap::from([("101".to_string(), "A".to_string())]);
        assert_eq!(remap_regions(&mut t, "region", &map).unwrap(), 1);
        assert_eq!(t.get(0, "region"), Some(Value::from("A")));
        assert_eq!(t.get(1, "region"), Some(Value::from("999")));
        assert_eq!(t.get(2, "region"), Some(Value::Null));
    }
}
