//! Yield-advantage features from head-to-head trial pairs.
//!
//! Each trial row compares a candidate product against an opponent in one
//! region and year. Advantages are averaged per (year, region, product,
//! trait): within the candidate's trait, against other traits, and
//! overall, next to the candidate's mean yield.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use polars::prelude::{col, lit, when, DataType, NULL};

use crate::pipeline::{PRODUCT, REGION, TRAIT, YEAR};
use crate::products::normalize_traits;
use crate::table::{Aggregate, KeyedTable, TableError};

pub const YIELD_ADVANTAGE: &str = "yield_adv";
pub const YIELD_ADV_IN_TRAIT: &str = "yield_adv_in_trait";
pub const YIELD_ADV_OUT_OF_TRAIT: &str = "yield_adv_out_of_trait";
pub const YIELD_ADV_OVERALL: &str = "yield_adv_overall";
pub const MEAN_YIELD: &str = "yield";

pub const PERFORMANCE_FEATURES: [&str; 4] = [
    YIELD_ADV_IN_TRAIT,
    YIELD_ADV_OUT_OF_TRAIT,
    YIELD_ADV_OVERALL,
    MEAN_YIELD,
];

/// Column names on the raw trial table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialColumns {
    pub year: String,
    pub region: String,
    pub product: String,
    pub candidate_trait: String,
    pub opponent_trait: String,
    pub candidate_yield: String,
    pub opponent_yield: String,
}

impl Default for TrialColumns {
    fn default() -> Self {
        Self {
            year: "year".to_string(),
            region: "region".to_string(),
            product: "c_product".to_string(),
            candidate_trait: "c_trait".to_string(),
            opponent_trait: "o_trait".to_string(),
            candidate_yield: "c_yield".to_string(),
            opponent_yield: "o_yield".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PerformanceError {
    #[error("trial year '{0}' is not an integer year")]
    InvalidYear(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Adds `yield_adv = (c_yield - o_yield) / c_yield`. Rows whose advantage
/// is infinite (zero candidate yield against a non-zero opponent) are
/// dropped; rows with a missing yield keep a null advantage.
pub fn with_yield_advantage(
    trials: &KeyedTable,
    cols: &TrialColumns,
) -> Result<KeyedTable, PerformanceError> {
    trials.column_index(&cols.candidate_yield)?;
    trials.column_index(&cols.opponent_yield)?;
    let candidate = col(&cols.candidate_yield).cast(DataType::Float64);
    let opponent = col(&cols.opponent_yield).cast(DataType::Float64);

    let infinite = candidate
        .clone()
        .eq(lit(0.0))
        .and(opponent.clone().neq(lit(0.0)));
    let advantage = when(candidate.clone().eq(lit(0.0)))
        .then(lit(NULL))
        .otherwise((candidate.clone() - opponent) / candidate)
        .alias(YIELD_ADVANTAGE);

    Ok(trials
        .filter(infinite.not().fill_null(lit(true)))?
        .with_columns(vec![advantage])?)
}

/// Per-(year, region, product, trait) performance features with the trial
/// year shifted by `year_offset` so it lines up with the sales year it
/// informs. Trait aliases apply to both sides of each pair before grouping.
pub fn yield_advantage_features(
    trials: &KeyedTable,
    cols: &TrialColumns,
    year_offset: i64,
    trait_aliases: &BTreeMap<String, String>,
) -> Result<KeyedTable, PerformanceError> {
    let mut rows = with_yield_advantage(trials, cols)?.select(&[
        cols.year.as_str(),
        cols.region.as_str(),
        cols.product.as_str(),
        cols.candidate_trait.as_str(),
        cols.opponent_trait.as_str(),
        cols.candidate_yield.as_str(),
        YIELD_ADVANTAGE,
    ])?;
    rows.rename_column(&cols.year, YEAR)?;
    rows.rename_column(&cols.region, REGION)?;
    rows.rename_column(&cols.product, PRODUCT)?;
    rows.rename_column(&cols.candidate_trait, TRAIT)?;

    normalize_traits(&mut rows, TRAIT, trait_aliases)?;
    normalize_traits(&mut rows, &cols.opponent_trait, trait_aliases)?;

    rows.normalize_int_column(YEAR).map_err(|err| match err {
        TableError::NonInteger { value, .. } => PerformanceError::InvalidYear(value),
        other => other.into(),
    })?;
    let rows = rows.with_columns(vec![(col(YEAR) + lit(year_offset)).alias(YEAR)])?;

    let same_trait = col(TRAIT).eq(col(&cols.opponent_trait));
    let in_trait = rows.filter(same_trait.clone())?;
    let out_of_trait = rows.filter(same_trait.not().fill_null(lit(true)))?;

    let key = [YEAR, REGION, PRODUCT, TRAIT];
    let overall = rows.group_aggregate(
        &key,
        &[
            Aggregate::mean(YIELD_ADVANTAGE).named(YIELD_ADV_OVERALL),
            Aggregate::mean(&cols.candidate_yield).named(MEAN_YIELD),
        ],
    )?;
    let in_trait = in_trait.group_aggregate(
        &key,
        &[Aggregate::mean(YIELD_ADVANTAGE).named(YIELD_ADV_IN_TRAIT)],
    )?;
    let out_of_trait = out_of_trait.group_aggregate(
        &key,
        &[Aggregate::mean(YIELD_ADVANTAGE).named(YIELD_ADV_OUT_OF_TRAIT)],
    )?;

    let features = overall
        .left_join(&in_trait, &key)?
        .left_join(&out_of_trait, &key)?
        .select(&[
            YEAR,
            REGION,
            PRODUCT,
            TRAIT,
            YIELD_ADV_IN_TRAIT,
            YIELD_ADV_OUT_OF_TRAIT,
            YIELD_ADV_OVERALL,
            MEAN_YIELD,
        ])?;

    info!(
        component = "performance",
        event = "performance.features.built",
        trial_rows = trials.len(),
        feature_rows = features.len(),
        year_offset = year_offset
    );

    Ok(features)
}
