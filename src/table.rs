//! Keyed tables: a polars `DataFrame` addressed by column name, with a
//! [`Value`] cell type at the boundary.
//!
//! Every other stage consumes and produces [`KeyedTable`]. Aggregation
//! always reduces to one row per key, and joins require the right-hand side
//! to be unique on the join key, so the one-row-per-key invariant survives
//! the whole pipeline.

use std::fmt;

use chrono::{Duration, NaiveDate};
use polars::prelude::{
    col, lit, when, AnyValue, DataFrame, DataType, Expr, IntoLazy, JoinArgs, JoinType, LazyFrame,
    NamedFrom, PolarsError, Series, SortMultipleOptions, UniqueKeepStrategy, NULL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ROW_INDEX: &str = "__row_index";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
}

impl Value {
    /// Null and non-finite floats are both treated as missing.
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float(v) => !v.is_finite(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    /// Integer view used for year columns, which arrive either as integers
    /// or as strings that round-trip to integers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            Self::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn dtype(&self) -> FeatureDType {
        match self {
            Self::Null => FeatureDType::Null,
            Self::Int(_) => FeatureDType::I64,
            Self::Float(_) => FeatureDType::F64,
            Self::Str(_) => FeatureDType::Str,
            Self::Date(_) => FeatureDType::Date,
        }
    }

    /// Literal expression for this cell.
    fn literal(&self) -> Expr {
        match self {
            Self::Null => lit(NULL),
            Self::Int(v) => lit(*v),
            Self::Float(v) => lit(*v),
            Self::Str(s) => lit(s.as_str()),
            Self::Date(d) => lit(epoch_days(*d)).cast(DataType::Date),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<AnyValue<'_>> for Value {
    fn from(value: AnyValue<'_>) -> Self {
        match value {
            AnyValue::Null => Self::Null,
            AnyValue::Boolean(v) => Self::Int(i64::from(v)),
            AnyValue::Int32(v) => Self::Int(i64::from(v)),
            AnyValue::Int64(v) => Self::Int(v),
            AnyValue::UInt32(v) => Self::Int(i64::from(v)),
            AnyValue::UInt64(v) => i64::try_from(v).map_or(Self::Float(v as f64), Self::Int),
            AnyValue::Float32(v) if v.is_finite() => Self::Float(f64::from(v)),
            AnyValue::Float64(v) if v.is_finite() => Self::Float(v),
            AnyValue::Float32(_) | AnyValue::Float64(_) => Self::Null,
            AnyValue::String(s) => Self::Str(s.to_string()),
            AnyValue::StringOwned(s) => Self::Str(s.to_string()),
            AnyValue::Date(days) => NaiveDate::default()
                .checked_add_signed(Duration::days(i64::from(days)))
                .map_or(Self::Null, Self::Date),
            other => Self::Str(other.to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Days since 1970-01-01, the physical representation of a polars date.
fn epoch_days(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureDType {
    I64,
    F64,
    Str,
    Date,
    Null,
}

impl FeatureDType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::I64 => "i64",
            Self::F64 => "f64",
            Self::Str => "str",
            Self::Date => "date",
            Self::Null => "null",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::I64 | Self::F64 | Self::Null)
    }

    fn of(dtype: &DataType) -> Self {
        match dtype {
            DataType::Boolean
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt32
            | DataType::UInt64 => Self::I64,
            DataType::Float32 | DataType::Float64 => Self::F64,
            DataType::Date => Self::Date,
            DataType::Null => Self::Null,
            _ => Self::Str,
        }
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),
    #[error("row has {found} cells, expected {expected}")]
    RowWidth { found: usize, expected: usize },
    #[error("duplicate key ({key}) on columns {columns:?}")]
    DuplicateKey { columns: Vec<String>, key: String },
    #[error("column {0} exists on both sides of the join")]
    ColumnCollision(String),
    #[error("column {column} holds non-numeric value '{value}'")]
    NonNumeric { column: String, value: String },
    #[error("column {column} holds non-integer value '{value}'")]
    NonInteger { column: String, value: String },
    #[error("column {column} mixes {first} and {second} cells")]
    MixedTypes {
        column: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("column {column} is {left} on one side and {right} on the other")]
    TypeMismatch {
        column: String,
        left: String,
        right: String,
    },
    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggFunc {
    Sum,
    Mean,
    WeightedMean { weight: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub column: String,
    pub func: AggFunc,
    pub output: String,
}

impl Aggregate {
    pub fn sum(column: &str) -> Self {
        Self {
            column: column.to_string(),
            func: AggFunc::Sum,
            output: column.to_string(),
        }
    }

    pub fn mean(column: &str) -> Self {
        Self {
            column: column.to_string(),
            func: AggFunc::Mean,
            output: column.to_string(),
        }
    }

    pub fn weighted_mean(column: &str, weight: &str) -> Self {
        Self {
            column: column.to_string(),
            func: AggFunc::WeightedMean {
                weight: weight.to_string(),
            },
            output: column.to_string(),
        }
    }

    pub fn named(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    /// Sums of nothing are `0.0`. A mean over only missing cells, or a
    /// weighted mean whose paired weights total zero, is null.
    fn expr(&self) -> Expr {
        let value = col(&self.column).cast(DataType::Float64);
        let reduced = match &self.func {
            AggFunc::Sum => value.sum(),
            AggFunc::Mean => value.mean(),
            AggFunc::WeightedMean { weight } => {
                let weight = col(weight).cast(DataType::Float64);
                let paired = value.clone().is_not_null().and(weight.clone().is_not_null());
                let total_weight = weight.clone().filter(paired).sum();
                when(total_weight.clone().neq(lit(0.0)))
                    .then((value * weight).sum() / total_weight)
                    .otherwise(lit(NULL))
            }
        };
        reduced.alias(&self.output)
    }
}

#[derive(Debug, Clone)]
pub struct KeyedTable {
    frame: DataFrame,
}

impl Default for KeyedTable {
    fn default() -> Self {
        Self {
            frame: DataFrame::empty(),
        }
    }
}

impl PartialEq for KeyedTable {
    fn eq(&self, other: &Self) -> bool {
        self.columns() == other.columns() && self.rows() == other.rows()
    }
}

impl From<DataFrame> for KeyedTable {
    fn from(frame: DataFrame) -> Self {
        Self { frame }
    }
}

impl KeyedTable {
    pub fn new<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
    ) -> Result<Self, TableError> {
        Self::from_rows(columns, Vec::new())
    }

    /// Builds a table from row-major cells. Each column takes the type of
    /// its non-missing cells; integers mixed with floats widen to float.
    pub fn from_rows<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, TableError> {
        let names: Vec<String> = columns.into_iter().map(Into::into).collect();
        ensure_distinct(names.iter().map(String::as_str))?;

        let mut cells: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for row in rows {
            if row.len() != names.len() {
                return Err(TableError::RowWidth {
                    found: row.len(),
                    expected: names.len(),
                });
            }
            for (column, value) in cells.iter_mut().zip(row) {
                column.push(value);
            }
        }

        let series = names
            .iter()
            .zip(&cells)
            .map(|(name, column)| build_series(name, column))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            frame: DataFrame::new(series)?,
        })
    }

    /// Runs a lazy query to completion.
    pub fn collect(query: LazyFrame) -> Result<Self, TableError> {
        Ok(Self {
            frame: query.collect()?,
        })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn lazy(&self) -> LazyFrame {
        self.frame.clone().lazy()
    }

    pub fn columns(&self) -> Vec<String> {
        self.frame
            .get_columns()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Row-major copy of every cell.
    pub fn rows(&self) -> Vec<Vec<Value>> {
        let columns: Vec<Vec<Value>> = self.frame.get_columns().iter().map(series_values).collect();
        (0..self.len())
            .map(|row| columns.iter().map(|column| column[row].clone()).collect())
            .collect()
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<Value>, TableError> {
        Ok(series_values(self.series(name)?))
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.get_columns().iter().any(|s| s.name() == name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.frame
            .get_columns()
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
    }

    fn series(&self, name: &str) -> Result<&Series, TableError> {
        self.frame
            .column(name)
            .map_err(|_| TableError::UnknownColumn(name.to_string()))
    }

    fn check_columns(&self, names: &[&str]) -> Result<(), TableError> {
        names.iter().try_for_each(|name| self.column_index(name).map(|_| ()))
    }

    pub fn get(&self, row: usize, column: &str) -> Option<Value> {
        self.frame.column(column).ok()?.get(row).ok().map(Value::from)
    }

    fn row(&self, row: usize) -> Vec<Value> {
        self.frame
            .get_columns()
            .iter()
            .map(|s| s.get(row).map_or(Value::Null, Value::from))
            .collect()
    }

    /// Index of the first row whose cells equal every `(column, value)` pair.
    pub fn find(&self, criteria: &[(&str, Value)]) -> Option<usize> {
        let columns = criteria
            .iter()
            .map(|(name, value)| self.column_values(name).ok().map(|cells| (cells, value)))
            .collect::<Option<Vec<_>>>()?;
        (0..self.len()).find(|row| columns.iter().all(|(cells, value)| &cells[*row] == *value))
    }

    /// Type of the column's non-missing cells; `Null` when it has none.
    pub fn column_dtype(&self, name: &str) -> Result<FeatureDType, TableError> {
        let series = self.series(name)?;
        if series.null_count() == series.len() {
            return Ok(FeatureDType::Null);
        }
        Ok(FeatureDType::of(series.dtype()))
    }

    pub fn select(&self, names: &[&str]) -> Result<Self, TableError> {
        self.check_columns(names)?;
        ensure_distinct(names.iter().copied())?;
        Ok(Self {
            frame: self.frame.select(names.iter().copied())?,
        })
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        self.column_index(from)?;
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        self.frame.rename(from, to)?;
        Ok(())
    }

    pub fn drop_columns(&mut self, names: &[&str]) -> Result<(), TableError> {
        self.check_columns(names)?;
        for name in names {
            if self.has_column(name) {
                self.frame = self.frame.drop(name)?;
            }
        }
        Ok(())
    }

    pub fn add_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), TableError> {
        if self.has_column(name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        if values.len() != self.len() && self.frame.width() > 0 {
            return Err(TableError::RowWidth {
                found: values.len(),
                expected: self.len(),
            });
        }
        self.frame.with_column(build_series(name, &values)?)?;
        Ok(())
    }

    /// Rewrites every cell of a column through `f`; the column keeps its
    /// position and is re-typed from the new cells.
    pub fn map_column(
        &mut self,
        name: &str,
        f: impl FnMut(&Value) -> Value,
    ) -> Result<(), TableError> {
        let mapped: Vec<Value> = self.column_values(name)?.iter().map(f).collect();
        self.frame.with_column(build_series(name, &mapped)?)?;
        Ok(())
    }

    /// Rewrites a column of integral values (or strings that round-trip to
    /// integers) as a 64-bit integer column. Missing cells stay null.
    pub fn normalize_int_column(&mut self, name: &str) -> Result<(), TableError> {
        let values = self.column_values(name)?;
        let mut ints: Vec<Option<i64>> = Vec::with_capacity(values.len());
        for value in &values {
            if value.is_missing() {
                ints.push(None);
                continue;
            }
            let int = value.as_i64().ok_or_else(|| TableError::NonInteger {
                column: name.to_string(),
                value: value.to_string(),
            })?;
            ints.push(Some(int));
        }
        self.frame.with_column(Series::new(name, ints))?;
        Ok(())
    }

    /// Keeps rows where `predicate` is true; a null predicate drops the row.
    pub fn filter(&self, predicate: Expr) -> Result<Self, TableError> {
        Self::collect(self.lazy().filter(predicate))
    }

    pub fn with_columns(&self, exprs: Vec<Expr>) -> Result<Self, TableError> {
        Self::collect(self.lazy().with_columns(exprs))
    }

    /// Stacks tables vertically. Columns are the union of all inputs in
    /// first-appearance order; cells a table lacks become null. A column
    /// holding integers in one table and floats in another widens to float.
    pub fn concat(tables: &[Self]) -> Result<Self, TableError> {
        let mut columns: Vec<String> = Vec::new();
        let mut dtypes: Vec<Option<DataType>> = Vec::new();
        for table in tables {
            for series in table.frame.get_columns() {
                let name = series.name().to_string();
                let slot = match columns.iter().position(|c| *c == name) {
                    Some(slot) => slot,
                    None => {
                        columns.push(name.clone());
                        dtypes.push(None);
                        columns.len() - 1
                    }
                };
                if series.null_count() == series.len() {
                    continue;
                }
                dtypes[slot] = Some(match dtypes[slot].take() {
                    None => series.dtype().clone(),
                    Some(current) => unify(&name, current, series.dtype())?,
                });
            }
        }
        let dtypes: Vec<DataType> = dtypes
            .into_iter()
            .map(|dtype| dtype.unwrap_or(DataType::Float64))
            .collect();

        let mut stacked: Option<DataFrame> = None;
        for table in tables {
            let series = columns
                .iter()
                .zip(&dtypes)
                .map(|(name, dtype)| match table.frame.column(name) {
                    Ok(series) => series.cast(dtype),
                    Err(_) => Ok(Series::full_null(name, table.len(), dtype)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let frame = DataFrame::new(series)?;
            stacked = Some(match stacked {
                Some(acc) => acc.vstack(&frame)?,
                None => frame,
            });
        }
        Ok(Self {
            frame: stacked.unwrap_or_else(DataFrame::empty),
        })
    }

    /// Fails with `DuplicateKey` if two rows share the same key tuple.
    pub fn ensure_unique(&self, key: &[&str]) -> Result<(), TableError> {
        first_duplicate(&self.select(key)?, key)
    }

    /// Uniqueness over rows whose key cells are all present.
    fn ensure_unique_present(&self, key: &[&str]) -> Result<(), TableError> {
        let keys = Self {
            frame: self.select(key)?.frame.drop_nulls::<String>(None)?,
        };
        first_duplicate(&keys, key)
    }

    /// Reduces the table to one row per key. Rows with a missing key cell
    /// are dropped; groups keep first-appearance order.
    pub fn group_aggregate(&self, key: &[&str], aggs: &[Aggregate]) -> Result<Self, TableError> {
        self.check_columns(key)?;
        for agg in aggs {
            self.ensure_numeric(&agg.column)?;
            if let AggFunc::WeightedMean { weight } = &agg.func {
                self.ensure_numeric(weight)?;
            }
        }
        let exprs: Vec<Expr> = aggs.iter().map(Aggregate::expr).collect();
        Self::collect(
            self.lazy()
                .filter(all_present(key))
                .group_by_stable(key_exprs(key))
                .agg(exprs),
        )
    }

    /// Distinct key tuples with every key cell present, in first-appearance
    /// order.
    pub fn distinct_keys(&self, key: &[&str]) -> Result<Self, TableError> {
        self.check_columns(key)?;
        Self::collect(
            self.lazy()
                .filter(all_present(key))
                .select(key_exprs(key))
                .unique_stable(None, UniqueKeepStrategy::First),
        )
    }

    fn ensure_numeric(&self, name: &str) -> Result<(), TableError> {
        if self.column_dtype(name)?.is_numeric() {
            return Ok(());
        }
        let value = self
            .column_values(name)?
            .into_iter()
            .find(|v| !v.is_missing())
            .unwrap_or(Value::Null);
        Err(TableError::NonNumeric {
            column: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Left equi-join. The right side must be unique on `on`; left rows
    /// without a match (or with a missing key cell) carry nulls forward.
    /// One right row may match many left rows, which is how region- or
    /// year-level features broadcast onto product rows.
    pub fn left_join(&self, right: &Self, on: &[&str]) -> Result<Self, TableError> {
        self.check_columns(on)?;
        right.check_columns(on)?;
        for name in right.columns() {
            if !on.contains(&name.as_str()) && self.has_column(&name) {
                return Err(TableError::ColumnCollision(name));
            }
        }
        right.ensure_unique_present(on)?;

        let mut left = self.clone();
        let mut right = right.clone();
        for key in on {
            align_key(&mut left, &mut right, key)?;
        }

        let joined = left
            .frame
            .with_row_index(ROW_INDEX, None)?
            .lazy()
            .join(
                right.frame.lazy(),
                key_exprs(on),
                key_exprs(on),
                JoinArgs::new(JoinType::Left),
            )
            .sort([ROW_INDEX], SortMultipleOptions::default())
            .collect()?;
        Ok(Self {
            frame: joined.drop(ROW_INDEX)?,
        })
    }

    fn cast_column(&mut self, name: &str, dtype: &DataType) -> Result<(), TableError> {
        let cast = self.series(name)?.cast(dtype)?;
        self.frame.with_column(cast)?;
        Ok(())
    }

    /// Sets every missing cell of `column` to `value`; returns the count.
    pub fn fill_missing(&mut self, column: &str, value: &Value) -> Result<usize, TableError> {
        let missing = self.missing_count(column)?;
        if missing == 0 || value.is_missing() {
            return Ok(0);
        }
        if self.column_dtype(column)? == FeatureDType::Null {
            // An all-null column takes the type of the fill value.
            self.frame
                .with_column(build_series(column, &vec![value.clone(); self.len()])?)?;
        } else {
            *self = self.with_columns(vec![col(column).fill_null(value.literal())])?;
        }
        Ok(missing)
    }

    /// Fills missing cells of every numeric (or all-null) column not named
    /// in `skip`. String and date columns are left alone.
    pub fn fill_missing_numeric(&mut self, value: f64, skip: &[&str]) -> Result<usize, TableError> {
        let mut filled = 0;
        let mut exprs = Vec::new();
        for name in self.columns() {
            if skip.contains(&name.as_str()) || !self.column_dtype(&name)?.is_numeric() {
                continue;
            }
            let missing = self.missing_count(&name)?;
            if missing > 0 {
                filled += missing;
                exprs.push(col(&name).cast(DataType::Float64).fill_null(lit(value)));
            }
        }
        if !exprs.is_empty() {
            *self = self.with_columns(exprs)?;
        }
        Ok(filled)
    }

    pub fn missing_count(&self, column: &str) -> Result<usize, TableError> {
        Ok(self
            .column_values(column)?
            .iter()
            .filter(|v| v.is_missing())
            .count())
    }

    /// Stable sort, nulls first.
    pub fn sort_by(&mut self, key: &[&str]) -> Result<(), TableError> {
        self.check_columns(key)?;
        self.frame = self.frame.sort(
            key.to_vec(),
            SortMultipleOptions::default().with_maintain_order(true),
        )?;
        Ok(())
    }
}

fn ensure_distinct<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), TableError> {
    let mut seen: Vec<&str> = Vec::new();
    for name in names {
        if seen.contains(&name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        seen.push(name);
    }
    Ok(())
}

fn key_exprs(key: &[&str]) -> Vec<Expr> {
    key.iter().map(|k| col(k)).collect()
}

fn all_present(key: &[&str]) -> Expr {
    key.iter()
        .map(|k| col(k).is_not_null())
        .reduce(|acc, present| acc.and(present))
        .unwrap_or_else(|| lit(true))
}

fn series_values(series: &Series) -> Vec<Value> {
    (0..series.len())
        .map(|idx| series.get(idx).map_or(Value::Null, Value::from))
        .collect()
}

fn build_series(name: &str, cells: &[Value]) -> Result<Series, TableError> {
    let mut dtype = FeatureDType::Null;
    for cell in cells.iter().filter(|c| !c.is_missing()) {
        dtype = match (dtype, cell.dtype()) {
            (FeatureDType::Null, next) => next,
            (current, next) if current == next => current,
            (FeatureDType::I64, FeatureDType::F64) | (FeatureDType::F64, FeatureDType::I64) => {
                FeatureDType::F64
            }
            (current, next) => {
                return Err(TableError::MixedTypes {
                    column: name.to_string(),
                    first: current.as_str(),
                    second: next.as_str(),
                })
            }
        };
    }

    let series = match dtype {
        FeatureDType::I64 => {
            let ints: Vec<Option<i64>> = cells
                .iter()
                .map(|c| match c {
                    Value::Int(v) => Some(*v),
                    _ => None,
                })
                .collect();
            Series::new(name, ints)
        }
        FeatureDType::F64 | FeatureDType::Null => {
            let floats: Vec<Option<f64>> = cells.iter().map(Value::as_f64).collect();
            Series::new(name, floats)
        }
        FeatureDType::Str => {
            let strings: Vec<Option<&str>> = cells.iter().map(Value::as_str).collect();
            Series::new(name, strings)
        }
        FeatureDType::Date => {
            let days: Vec<Option<i32>> = cells
                .iter()
                .map(|c| c.as_date().map(epoch_days))
                .collect();
            Series::new(name, days).cast(&DataType::Date)?
        }
    };
    Ok(series)
}

/// Common type for one column seen with two physical types.
fn unify(name: &str, current: DataType, next: &DataType) -> Result<DataType, TableError> {
    if current == *next {
        return Ok(current);
    }
    if current.is_numeric() && next.is_numeric() {
        return Ok(DataType::Float64);
    }
    Err(TableError::TypeMismatch {
        column: name.to_string(),
        left: current.to_string(),
        right: next.to_string(),
    })
}

/// Brings one join key to the same type on both sides. An all-null side
/// takes the other side's type; numeric keys follow the left side.
fn align_key(left: &mut KeyedTable, right: &mut KeyedTable, key: &str) -> Result<(), TableError> {
    let left_dtype = left.series(key)?.dtype().clone();
    let right_dtype = right.series(key)?.dtype().clone();
    if left_dtype == right_dtype {
        return Ok(());
    }
    let numeric = left_dtype.is_numeric() && right_dtype.is_numeric();
    if numeric || right.column_dtype(key)? == FeatureDType::Null {
        right.cast_column(key, &left_dtype)
    } else if left.column_dtype(key)? == FeatureDType::Null {
        left.cast_column(key, &right_dtype)
    } else {
        Err(TableError::TypeMismatch {
            column: key.to_string(),
            left: left_dtype.to_string(),
            right: right_dtype.to_string(),
        })
    }
}

fn first_duplicate(keys: &KeyedTable, key: &[&str]) -> Result<(), TableError> {
    if keys.is_empty() {
        return Ok(());
    }
    let duplicated = keys.frame.is_duplicated()?;
    let first = duplicated.into_iter().position(|dup| dup == Some(true));
    match first {
        Some(row) => Err(TableError::DuplicateKey {
            columns: key.iter().map(|k| k.to_string()).collect(),
            key: keys
                .row(row)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> KeyedTable {
        KeyedTable::from_rows(
            ["year", "region", "product", "order_Q"],
            vec![
                vec![2020.into(), "A".into(), "X".into(), 10.0.into()],
                vec![2020.into(), "A".into(), "X".into(), 5.0.into()],
                vec![2020.into(), "A".into(), "Y".into(), Value::Null],
                vec![2020.into(), Value::Null, "Y".into(), 7.0.into()],
                vec![2021.into(), "A".into(), "X".into(), 3.0.into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn group_sum_reduces_to_one_row_per_key() {
        let grouped = sales()
            .group_aggregate(&["year", "region", "product"], &[Aggregate::sum("order_Q")])
            .unwrap();

        assert_eq!(grouped.len(), 3);
        grouped
            .ensure_unique(&["year", "region", "product"])
            .unwrap();
        let x = grouped
            .find(&[("year", 2020.into()), ("product", "X".into())])
            .unwrap();
        assert_eq!(grouped.get(x, "order_Q"), Some(Value::Float(15.0)));
        let y = grouped
            .find(&[("year", 2020.into()), ("product", "Y".into())])
            .unwrap();
        assert_eq!(grouped.get(y, "order_Q"), Some(Value::Float(0.0)));
    }

    #[test]
    fn groups_keep_first_appearance_order() {
        let grouped = sales()
            .group_aggregate(&["year", "product"], &[Aggregate::sum("order_Q")])
            .unwrap();
        assert_eq!(grouped.get(0, "product"), Some(Value::from("X")));
        assert_eq!(grouped.get(1, "product"), Some(Value::from("Y")));
        assert_eq!(grouped.get(2, "year"), Some(Value::Int(2021)));
    }

    #[test]
    fn mean_of_all_missing_is_null_and_weighted_mean_uses_weights() {
        let table = KeyedTable::from_rows(
            ["g", "v", "w"],
            vec![
                vec!["a".into(), 1.0.into(), 1.0.into()],
                vec!["a".into(), 4.0.into(), 3.0.into()],
                vec!["b".into(), Value::Null, 2.0.into()],
            ],
        )
        .unwrap();

        let means = table
            .group_aggregate(
                &["g"],
                &[
                    Aggregate::mean("v"),
                    Aggregate::weighted_mean("v", "w").named("v_w"),
                ],
            )
            .unwrap();

        assert_eq!(means.get(0, "v"), Some(Value::Float(2.5)));
        assert_eq!(means.get(0, "v_w"), Some(Value::Float(13.0 / 4.0)));
        assert_eq!(means.get(1, "v"), Some(Value::Null));
        assert_eq!(means.get(1, "v_w"), Some(Value::Null));
    }

    #[test]
    fn aggregating_text_is_rejected() {
        let table = KeyedTable::from_rows(
            ["g", "v"],
            vec![vec!["a".into(), "lots".into()]],
        )
        .unwrap();
        assert!(matches!(
            table.group_aggregate(&["g"], &[Aggregate::sum("v")]),
            Err(TableError::NonNumeric { .. })
        ));
    }

    #[test]
    fn left_join_broadcasts_and_carries_nulls() {
        let products = KeyedTable::from_rows(
            ["year", "region", "product"],
            vec![
                vec![2020.into(), "A".into(), "X".into()],
                vec![2020.into(), "A".into(), "Y".into()],
                vec![2020.into(), "B".into(), "X".into()],
                vec![2020.into(), Value::Null, "Z".into()],
            ],
        )
        .unwrap();
        let weather = KeyedTable::from_rows(
            ["year", "region", "precip"],
            vec![
                vec![2020.into(), "A".into(), 3.5.into()],
                vec![2020.into(), Value::Null, 9.0.into()],
            ],
        )
        .unwrap();

        let joined = products.left_join(&weather, &["year", "region"]).unwrap();
        assert_eq!(joined.len(), 4);
        assert_eq!(joined.get(0, "precip"), Some(Value::Float(3.5)));
        assert_eq!(joined.get(1, "precip"), Some(Value::Float(3.5)));
        assert_eq!(joined.get(2, "precip"), Some(Value::Null));
        assert_eq!(joined.get(3, "precip"), Some(Value::Null));
        assert_eq!(joined.get(3, "product"), Some(Value::from("Z")));
    }

    #[test]
    fn left_join_rejects_duplicate_right_keys_and_collisions() {
        let left =
            KeyedTable::from_rows(["k", "v"], vec![vec!["a".into(), 1.0.into()]]).unwrap();
        let dup = KeyedTable::from_rows(
            ["k", "w"],
            vec![vec!["a".into(), 1.0.into()], vec!["a".into(), 2.0.into()]],
        )
        .unwrap();
        assert!(matches!(
            left.left_join(&dup, &["k"]),
            Err(TableError::DuplicateKey { .. })
        ));

        let clash =
            KeyedTable::from_rows(["k", "v"], vec![vec!["a".into(), 9.0.into()]]).unwrap();
        assert!(matches!(
            left.left_join(&clash, &["k"]),
            Err(TableError::ColumnCollision(column)) if column == "v"
        ));
    }

    #[test]
    fn join_keys_of_different_types_do_not_silently_miss() {
        let left = KeyedTable::from_rows(["year"], vec![vec![2020.into()]]).unwrap();
        let right = KeyedTable::from_rows(
            ["year", "fcst"],
            vec![vec!["2020".into(), 4.0.into()]],
        )
        .unwrap();
        assert!(matches!(
            left.left_join(&right, &["year"]),
            Err(TableError::TypeMismatch { .. })
        ));

        let mut normalized = right.clone();
        normalized.normalize_int_column("year").unwrap();
        let joined = left.left_join(&normalized, &["year"]).unwrap();
        assert_eq!(joined.get(0, "fcst"), Some(Value::Float(4.0)));
    }

    #[test]
    fn concat_unions_columns() {
        let a = KeyedTable::from_rows(["k", "x"], vec![vec!["a".into(), 1.into()]]).unwrap();
        let b = KeyedTable::from_rows(["y", "k", "x"], vec![vec![2.0.into(), "b".into(), 1.5.into()]])
            .unwrap();
        let c = KeyedTable::concat(&[a, b]).unwrap();
        assert_eq!(c.columns(), &["k", "x", "y"]);
        assert_eq!(c.rows()[0], vec!["a".into(), 1.0.into(), Value::Null]);
        assert_eq!(c.rows()[1], vec!["b".into(), 1.5.into(), 2.0.into()]);
    }

    #[test]
    fn fill_missing_numeric_skips_string_columns() {
        let mut t = KeyedTable::from_rows(
            ["trait", "yield", "empty"],
            vec![
                vec![Value::Null, Value::Null, Value::Null],
                vec!["RR2X".into(), Value::Float(f64::NAN), Value::Null],
            ],
        )
        .unwrap();
        let filled = t.fill_missing_numeric(0.0, &[]).unwrap();
        assert_eq!(filled, 4);
        assert_eq!(t.get(0, "trait"), Some(Value::Null));
        assert_eq!(t.get(1, "yield"), Some(Value::Float(0.0)));
    }

    #[test]
    fn fill_missing_types_an_all_null_column() {
        let mut t = KeyedTable::from_rows(
            ["trait"],
            vec![vec![Value::Null], vec![Value::Null]],
        )
        .unwrap();
        assert_eq!(t.fill_missing("trait", &"Conventional".into()).unwrap(), 2);
        assert_eq!(t.column_dtype("trait").unwrap(), FeatureDType::Str);
        assert_eq!(t.get(1, "trait"), Some(Value::from("Conventional")));
    }

    #[test]
    fn sort_orders_nulls_first() {
        let mut t = KeyedTable::from_rows(
            ["v"],
            vec![vec![3.5.into()], vec![Value::Null], vec![2.into()]],
        )
        .unwrap();
        t.sort_by(&["v"]).unwrap();
        assert_eq!(t.get(0, "v"), Some(Value::Null));
        assert_eq!(t.get(1, "v"), Some(Value::Float(2.0)));
    }

    #[test]
    fn mixed_cell_types_are_rejected() {
        assert!(matches!(
            KeyedTable::from_rows(["v"], vec![vec![1.into()], vec!["one".into()]]),
            Err(TableError::MixedTypes { .. })
        ));
    }

    #[test]
    fn year_values_round_trip_through_strings() {
        assert_eq!(Value::from("2021").as_i64(), Some(2021));
        assert_eq!(Value::Float(2021.0).as_i64(), Some(2021));
        assert_eq!(Value::from("21a").as_i64(), None);

        let mut t = KeyedTable::from_rows(
            ["year"],
            vec![vec!["2021".into()], vec![Value::Null]],
        )
        .unwrap();
        t.normalize_int_column("year").unwrap();
        assert_eq!(t.column_dtype("year").unwrap(), FeatureDType::I64);
        assert_eq!(t.get(0, "year"), Some(Value::Int(2021)));

        let mut bad = KeyedTable::from_rows(["year"], vec![vec!["next".into()]]).unwrap();
        assert!(matches!(
            bad.normalize_int_column("year"),
            Err(TableError::NonInteger { .. })
        ));
    }

    #[test]
    fn dates_survive_the_frame() {
        let day = NaiveDate::from_ymd_opt(2021, 1, 15).unwrap();
        let t = KeyedTable::from_rows(["d"], vec![vec![day.into()], vec![Value::Null]]).unwrap();
        assert_eq!(t.column_dtype("d").unwrap(), FeatureDType::Date);
        assert_eq!(t.get(0, "d"), Some(Value::Date(day)));
        assert_eq!(t.get(1, "d"), Some(Value::Null));
    }
}
