//! Cutoff aggregation: cumulative "to-date" quantity sums per key.
//!
//! A processing (marketing) year Y runs from the month after the fiscal
//! boundary in calendar year Y-1 through the boundary month of Y. A cutoff
//! month later than the boundary therefore falls in calendar year Y-1.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};
use polars::prelude::{col, lit, when, DataType, Expr, NULL};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::table::{Aggregate, FeatureDType, KeyedTable, TableError, Value};

pub const DEFAULT_FISCAL_BOUNDARY_MONTH: u32 = 8;

/// Blend fraction used when no region has a historical fraction.
pub const DEFAULT_ORDER_FRACTION: f64 = 0.23;

pub const FRACTION: &str = "fraction";

const CUTOFF: &str = "__cutoff";
const FRACTION_TOTAL: &str = "__month_total";
const FRACTION_THROUGH: &str = "__through_day";
const BLEND_FRACTION: &str = "__blend_fraction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoffPolicy {
    pub month: u32,
    pub day: u32,
    #[serde(default = "default_boundary_month")]
    pub fiscal_boundary_month: u32,
}

impl Default for CutoffPolicy {
    fn default() -> Self {
        Self {
            month: 1,
            day: 15,
            fiscal_boundary_month: DEFAULT_FISCAL_BOUNDARY_MONTH,
        }
    }
}

fn default_boundary_month() -> u32 {
    DEFAULT_FISCAL_BOUNDARY_MONTH
}

#[derive(Debug, Error)]
pub enum CutoffError {
    #[error("invalid cutoff policy: {0}")]
    InvalidPolicy(String),
    #[error("year value '{0}' is not an integer year")]
    InvalidYear(String),
    #[error("column {column} holds non-date value '{value}'")]
    InvalidDate { column: String, value: String },
    #[error("blend fraction must be within [0, 1], got {0}")]
    InvalidFraction(f64),
    #[error("month {month} / day {day} is not a calendar position")]
    InvalidMonthDay { month: u32, day: u32 },
    #[error(transparent)]
    Table(#[from] TableError),
}

impl CutoffPolicy {
    pub fn new(month: u32, day: u32) -> Self {
        Self {
            month,
            day,
            fiscal_boundary_month: DEFAULT_FISCAL_BOUNDARY_MONTH,
        }
    }

    pub fn with_boundary(mut self, fiscal_boundary_month: u32) -> Self {
        self.fiscal_boundary_month = fiscal_boundary_month;
        self
    }

    pub fn validate(&self) -> Result<(), CutoffError> {
        if !(1..=12).contains(&self.month) {
            return Err(CutoffError::InvalidPolicy(format!(
                "month must be within 1..=12, got {}",
                self.month
            )));
        }
        if !(1..=31).contains(&self.day) {
            return Err(CutoffError::InvalidPolicy(format!(
                "day must be within 1..=31, got {}",
                self.day
            )));
        }
        if !(1..=12).contains(&self.fiscal_boundary_month) {
            return Err(CutoffError::InvalidPolicy(format!(
                "fiscal_boundary_month must be within 1..=12, got {}",
                self.fiscal_boundary_month
            )));
        }
        Ok(())
    }

    pub fn calendar_year(&self, processing_year: i32) -> i32 {
        if self.month > self.fiscal_boundary_month {
            processing_year - 1
        } else {
            processing_year
        }
    }

    /// Days past the end of the month clamp to its last day, so Feb 29
    /// resolves to Feb 28 outside leap years.
    pub fn cutoff_date(&self, processing_year: i32) -> Result<NaiveDate, CutoffError> {
        self.validate()?;
        let year = self.calendar_year(processing_year);
        let day = self.day.min(days_in_month(year, self.month)?);
        NaiveDate::from_ymd_opt(year, self.month, day).ok_or_else(|| {
            CutoffError::InvalidPolicy(format!("no date {year}-{}-{day}", self.month))
        })
    }
}

fn days_in_month(year: i32, month: u32) -> Result<u32, CutoffError> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .ok_or_else(|| CutoffError::InvalidPolicy(format!("year {year} out of range")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantitySpec {
    pub source: String,
    pub output: String,
}

impl QuantitySpec {
    pub fn new(source: &str, output: &str) -> Self {
        Self {
            source: source.to_string(),
            output: output.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToDateRequest {
    /// Output key; must include `year_column`.
    pub key: Vec<String>,
    pub year_column: String,
    pub date_column: String,
    pub quantities: Vec<QuantitySpec>,
}

/// Copy of `events` with an integer year column and a date-typed date
/// column. Year strings such as `"2020"` become integers.
fn typed_events(
    events: &KeyedTable,
    year_column: &str,
    date_column: &str,
) -> Result<KeyedTable, CutoffError> {
    let mut typed = events.clone();
    typed
        .normalize_int_column(year_column)
        .map_err(|err| match err {
            TableError::NonInteger { value, .. } => CutoffError::InvalidYear(value),
            other => other.into(),
        })?;
    match typed.column_dtype(date_column)? {
        FeatureDType::Date => Ok(typed),
        FeatureDType::Null => Ok(typed.with_columns(vec![col(date_column).cast(DataType::Date)])?),
        _ => {
            let value = typed
                .column_values(date_column)?
                .into_iter()
                .find(|v| !v.is_missing())
                .unwrap_or(Value::Null);
            Err(CutoffError::InvalidDate {
                column: date_column.to_string(),
                value: value.to_string(),
            })
        }
    }
}

/// Sums each quantity over events dated on or before the cutoff of their
/// processing year. Events with a missing date or year never qualify. Keys
/// with no qualifying event are absent from the result; callers join onto
/// their full key universe and fill zero.
pub fn to_date_totals(
    events: &KeyedTable,
    req: &ToDateRequest,
    policy: &CutoffPolicy,
) -> Result<KeyedTable, CutoffError> {
    policy.validate()?;
    let events = typed_events(events, &req.year_column, &req.date_column)?;

    let years: BTreeSet<i64> = events
        .column_values(&req.year_column)?
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    let mut cutoffs = Vec::with_capacity(years.len());
    for year in years {
        let processing_year =
            i32::try_from(year).map_err(|_| CutoffError::InvalidYear(year.to_string()))?;
        cutoffs.push(vec![
            Value::Int(year),
            Value::Date(policy.cutoff_date(processing_year)?),
        ]);
    }

    let qualifying = if cutoffs.is_empty() {
        events.filter(lit(false))?
    } else {
        let cutoffs = KeyedTable::from_rows([req.year_column.as_str(), CUTOFF], cutoffs)?;
        let mut dated = events
            .left_join(&cutoffs, &[req.year_column.as_str()])?
            .filter(col(&req.date_column).lt_eq(col(CUTOFF)))?;
        dated.drop_columns(&[CUTOFF])?;
        dated
    };

    let key: Vec<&str> = req.key.iter().map(String::as_str).collect();
    let aggs: Vec<Aggregate> = req
        .quantities
        .iter()
        .map(|q| Aggregate::sum(&q.source).named(&q.output))
        .collect();
    let totals = qualifying.group_aggregate(&key, &aggs)?;

    debug!(
        component = "cutoff",
        event = "cutoff.to_date.finish",
        cutoff_month = policy.month,
        cutoff_day = policy.day,
        input_rows = events.len(),
        qualifying_rows = qualifying.len(),
        output_rows = totals.len()
    );

    Ok(totals)
}

/// Marketing-year month order: the months after the boundary, then January
/// through the boundary month.
pub fn marketing_months(fiscal_boundary_month: u32) -> Vec<u32> {
    (fiscal_boundary_month + 1..=12)
        .chain(1..=fiscal_boundary_month)
        .collect()
}

pub fn month_column(output: &str, month: u32) -> String {
    format!("{output}_month_{month}")
}

/// End-of-month to-date totals for every marketing month. Every key seen in
/// the events gets a value for every month, zero when nothing qualifies.
pub fn monthly_to_date(
    events: &KeyedTable,
    req: &ToDateRequest,
    fiscal_boundary_month: u32,
) -> Result<KeyedTable, CutoffError> {
    let key: Vec<&str> = req.key.iter().map(String::as_str).collect();
    let events = typed_events(events, &req.year_column, &req.date_column)?;
    let mut out = events.distinct_keys(&key)?;
    let months = marketing_months(fiscal_boundary_month);

    for month in &months {
        let policy = CutoffPolicy {
            month: *month,
            day: 31,
            fiscal_boundary_month,
        };
        let month_req = ToDateRequest {
            quantities: req
                .quantities
                .iter()
                .map(|q| QuantitySpec::new(&q.source, &month_column(&q.output, *month)))
                .collect(),
            ..req.clone()
        };
        let totals = to_date_totals(&events, &month_req, &policy)?;
        out = out.left_join(&totals, &key)?;
        for q in &month_req.quantities {
            out.fill_missing(&q.output, &Value::Float(0.0))?;
        }
    }

    info!(
        component = "cutoff",
        event = "cutoff.monthly.finish",
        months = months.len(),
        keys = out.len()
    );

    Ok(out)
}

/// Linear blend between two monthly totals:
/// `output = this + fraction * (next - this)`. Missing cells count as zero.
pub fn blend_month_totals(
    table: &mut KeyedTable,
    this_month: &str,
    next_month: &str,
    fraction: f64,
    output: &str,
) -> Result<(), CutoffError> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(CutoffError::InvalidFraction(fraction));
    }
    blend(table, this_month, next_month, lit(fraction), output)
}

fn blend(
    table: &mut KeyedTable,
    this_month: &str,
    next_month: &str,
    fraction: Expr,
    output: &str,
) -> Result<(), CutoffError> {
    table.column_index(this_month)?;
    table.column_index(next_month)?;
    if table.has_column(output) {
        return Err(TableError::DuplicateColumn(output.to_string()).into());
    }
    let this = col(this_month).cast(DataType::Float64).fill_null(lit(0.0));
    let next = col(next_month).cast(DataType::Float64).fill_null(lit(0.0));
    *table = table.with_columns(vec![(this.clone() + fraction * (next - this)).alias(output)])?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionRequest {
    pub region_column: String,
    pub date_column: String,
    pub quantity: String,
}

/// Per-region share of a calendar month's quantity that was booked on or
/// before `day`, pooled over every year in `events`. A region whose month
/// total is zero gets a null fraction. Columns: region, [`FRACTION`].
pub fn historical_month_fractions(
    events: &KeyedTable,
    req: &FractionRequest,
    month: u32,
    day: u32,
) -> Result<KeyedTable, CutoffError> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(CutoffError::InvalidMonthDay { month, day });
    }
    let dates: Vec<Option<NaiveDate>> = match events.column_dtype(&req.date_column)? {
        FeatureDType::Date | FeatureDType::Null => events
            .column_values(&req.date_column)?
            .iter()
            .map(Value::as_date)
            .collect(),
        _ => {
            return Err(CutoffError::InvalidDate {
                column: req.date_column.clone(),
                value: events
                    .column_values(&req.date_column)?
                    .into_iter()
                    .find(|v| !v.is_missing())
                    .unwrap_or(Value::Null)
                    .to_string(),
            })
        }
    };

    let in_month: Vec<Value> = dates
        .iter()
        .map(|d| Value::Int(i64::from(d.is_some_and(|d| d.month() == month))))
        .collect();
    let through_day: Vec<Value> = dates
        .iter()
        .map(|d| Value::Int(i64::from(d.is_some_and(|d| d.day() <= day))))
        .collect();

    let mut flagged = events.select(&[req.region_column.as_str(), req.quantity.as_str()])?;
    flagged.add_column("__in_month", in_month)?;
    flagged.add_column("__through", through_day)?;
    let month_rows = flagged
        .filter(col("__in_month").eq(lit(1i64)))?
        .with_columns(vec![(col(&req.quantity).cast(DataType::Float64)
            * col("__through").cast(DataType::Float64))
        .alias(FRACTION_THROUGH)])?;

    let totals = month_rows.group_aggregate(
        &[req.region_column.as_str()],
        &[
            Aggregate::sum(&req.quantity).named(FRACTION_TOTAL),
            Aggregate::sum(FRACTION_THROUGH),
        ],
    )?;
    let fractions = totals
        .with_columns(vec![when(col(FRACTION_TOTAL).gt(lit(0.0)))
            .then(col(FRACTION_THROUGH) / col(FRACTION_TOTAL))
            .otherwise(lit(NULL))
            .alias(FRACTION)])?
        .select(&[req.region_column.as_str(), FRACTION])?;

    debug!(
        component = "cutoff",
        event = "cutoff.fractions.built",
        month = month,
        day = day,
        regions = fractions.len()
    );

    Ok(fractions)
}

/// Blends two monthly totals with a per-region fraction from `fractions`
/// (as built by [`historical_month_fractions`]). Regions without a fraction
/// take the mean of the known ones, or [`DEFAULT_ORDER_FRACTION`] when no
/// region has one. Returns the fallback fraction used.
pub fn blend_with_fractions(
    table: &mut KeyedTable,
    this_month: &str,
    next_month: &str,
    fractions: &KeyedTable,
    region_column: &str,
    output: &str,
) -> Result<f64, CutoffError> {
    let known: Vec<f64> = fractions
        .column_values(FRACTION)?
        .iter()
        .filter_map(Value::as_f64)
        .collect();
    if let Some(bad) = known.iter().find(|f| !(0.0..=1.0).contains(*f)) {
        return Err(CutoffError::InvalidFraction(*bad));
    }
    let fallback = if known.is_empty() {
        DEFAULT_ORDER_FRACTION
    } else {
        known.iter().sum::<f64>() / known.len() as f64
    };

    let mut per_region = fractions.select(&[region_column, FRACTION])?;
    per_region.rename_column(FRACTION, BLEND_FRACTION)?;
    let mut joined = table.left_join(&per_region, &[region_column])?;
    let defaulted = joined.fill_missing(BLEND_FRACTION, &Value::Float(fallback))?;
    blend(&mut joined, this_month, next_month, col(BLEND_FRACTION), output)?;
    joined.drop_columns(&[BLEND_FRACTION])?;
    *table = joined;

    info!(
        component = "cutoff",
        event = "cutoff.blend.fractions",
        regions = known.len(),
        defaulted_rows = defaulted,
        fallback = fallback
    );

    Ok(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_after_boundary_falls_in_previous_calendar_year() {
        let policy = CutoffPolicy::new(10, 20);
        assert_eq!(
            policy.cutoff_date(2021).unwrap(),
            NaiveDate::from_ymd_opt(2020, 10, 20).unwrap()
        );

        let policy = CutoffPolicy::new(8, 31);
        assert_eq!(
            policy.cutoff_date(2021).unwrap(),
            NaiveDate::from_ymd_opt(2021, 8, 31).unwrap()
        );
    }

    #[test]
    fn day_past_month_end_clamps() {
        let policy = CutoffPolicy::new(2, 29);
        assert_eq!(
            policy.cutoff_date(2021).unwrap(),
            NaiveDate::from_ymd_opt(2021, 2, 28).unwrap()
        );
        assert_eq!(
            policy.cutoff_date(2020).unwrap(),
            NaiveDate::from_ymd_opt(2020, 2, 29).unwrap()
        );
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(CutoffPolicy::new(13, 1).validate().is_err());
        assert!(CutoffPolicy::new(1, 0).validate().is_err());
        assert!(CutoffPolicy::new(1, 1).with_boundary(0).validate().is_err());
    }

    #[test]
    fn marketing_months_start_after_boundary() {
        assert_eq!(
            marketing_months(8),
            vec![9, 10, 11, 12, 1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(marketing_months(12), (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn blend_interpolates_and_rejects_bad_fraction() {
        let mut t = KeyedTable::from_rows(
            ["m1", "m2"],
            vec![vec![10.0.into(), 20.0.into()], vec![Value::Null, 8.0.into()]],
        )
        .unwrap();
        blend_month_totals(&mut t, "m1", "m2", 0.25, "to_date").unwrap();
        assert_eq!(t.get(0, "to_date"), Some(Value::Float(12.5)));
        assert_eq!(t.get(1, "to_date"), Some(Value::Float(2.0)));

        assert!(matches!(
            blend_month_totals(&mut t, "m1", "m2", 1.5, "other"),
            Err(CutoffError::InvalidFraction(_))
        ));
    }

    fn date(y: i32, m: u32, d: u32) -> Value {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().into()
    }

    #[test]
    fn string_and_missing_years_are_handled_before_windowing() {
        let events = KeyedTable::from_rows(
            ["year", "product", "effective_date", "order_Q"],
            vec![
                vec!["2021".into(), "P1".into(), date(2021, 1, 10), 4.0.into()],
                vec![Value::Null, "P1".into(), date(2021, 1, 10), 9.0.into()],
            ],
        )
        .unwrap();
        let req = ToDateRequest {
            key: vec!["year".into(), "product".into()],
            year_column: "year".into(),
            date_column: "effective_date".into(),
            quantities: vec![QuantitySpec::new("order_Q", "to_date")],
        };

        let totals = to_date_totals(&events, &req, &CutoffPolicy::default()).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals.get(0, "year"), Some(Value::Int(2021)));
        assert_eq!(totals.get(0, "to_date"), Some(Value::Float(4.0)));
    }

    #[test]
    fn fractions_pool_years_per_region() {
        let events = KeyedTable::from_rows(
            ["region", "effective_date", "order_Q"],
            vec![
                vec!["R1".into(), date(2020, 1, 5), 1.0.into()],
                vec!["R1".into(), date(2020, 1, 25), 3.0.into()],
                vec!["R1".into(), date(2021, 1, 10), 4.0.into()],
                vec!["R1".into(), date(2021, 2, 1), 50.0.into()],
                vec!["R2".into(), date(2021, 1, 20), 0.0.into()],
            ],
        )
        .unwrap();
        let req = FractionRequest {
            region_column: "region".into(),
            date_column: "effective_date".into(),
            quantity: "order_Q".into(),
        };

        let fractions = historical_month_fractions(&events, &req, 1, 15).unwrap();
        assert_eq!(fractions.len(), 2);
        assert_eq!(fractions.get(0, FRACTION), Some(Value::Float(5.0 / 8.0)));
        assert_eq!(fractions.get(1, FRACTION), Some(Value::Null));
    }

    #[test]
    fn blend_uses_region_fraction_or_the_mean_of_known_fractions() {
        let mut table = KeyedTable::from_rows(
            ["region", "m1", "m2"],
            vec![
                vec!["R1".into(), 10.0.into(), 20.0.into()],
                vec!["R2".into(), 0.0.into(), 8.0.into()],
                vec!["R3".into(), 0.0.into(), 8.0.into()],
            ],
        )
        .unwrap();
        let fractions = KeyedTable::from_rows(
            ["region", FRACTION],
            vec![
                vec!["R1".into(), 0.5.into()],
                vec!["R2".into(), 0.25.into()],
            ],
        )
        .unwrap();

        let fallback =
            blend_with_fractions(&mut table, "m1", "m2", &fractions, "region", "to_date").unwrap();
        assert_eq!(fallback, 0.375);
        assert_eq!(table.get(0, "to_date"), Some(Value::Float(15.0)));
        assert_eq!(table.get(1, "to_date"), Some(Value::Float(2.0)));
        assert_eq!(table.get(2, "to_date"), Some(Value::Float(3.0)));
        assert!(!table.has_column(BLEND_FRACTION));
    }
}
