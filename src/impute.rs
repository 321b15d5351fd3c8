//! Hierarchical imputation over an ordered fallback chain.
//!
//! Each level aggregates a source table over a coarser key. Levels are
//! applied finest first, and a level only fills cells that are still
//! missing, so the finest available aggregate always wins and observed
//! values are never touched. Cells no level can fill stay missing; the
//! caller owns the terminal default.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use polars::prelude::{col, lit, when, NULL};

use crate::table::{Aggregate, KeyedTable, TableError};

pub const OBSERVED_TAG: &str = "observed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackLevel {
    pub tag: String,
    pub key: Vec<String>,
}

impl FallbackLevel {
    pub fn new(tag: &str, key: &[&str]) -> Self {
        Self {
            tag: tag.to_string(),
            key: key.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn suffixed(&self, feature: &str) -> String {
        format!("{feature}_{}", self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    UnweightedMean,
    WeightedMean { weight_column: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImputationPlan {
    pub features: Vec<String>,
    pub chain: Vec<FallbackLevel>,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub provenance_columns: bool,
}

impl ImputationPlan {
    pub fn new(features: &[&str], chain: Vec<FallbackLevel>) -> Self {
        Self {
            features: features.iter().map(|f| f.to_string()).collect(),
            chain,
            aggregation: Aggregation::UnweightedMean,
            provenance_columns: false,
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_provenance_columns(mut self) -> Self {
        self.provenance_columns = true;
        self
    }

    pub fn provenance_column(feature: &str) -> String {
        format!("{feature}_provenance")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelFill {
    pub feature: String,
    pub level: String,
    pub cells: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImputationReport {
    pub rows: usize,
    pub observed: Vec<(String, usize)>,
    pub fills: Vec<LevelFill>,
    pub still_missing: Vec<(String, usize)>,
}

impl ImputationReport {
    pub fn filled_by(&self, feature: &str, level: &str) -> usize {
        self.fills
            .iter()
            .find(|fill| fill.feature == feature && fill.level == level)
            .map_or(0, |fill| fill.cells)
    }

    pub fn missing_after(&self, feature: &str) -> usize {
        self.still_missing
            .iter()
            .find(|(name, _)| name == feature)
            .map_or(0, |(_, count)| *count)
    }
}

#[derive(Debug, Error)]
pub enum ImputeError {
    #[error("invalid imputation plan: {0}")]
    InvalidPlan(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// One aggregate table per level, columns = level key + `{feature}_{tag}`.
pub fn level_aggregates(
    source: &KeyedTable,
    plan: &ImputationPlan,
) -> Result<Vec<KeyedTable>, ImputeError> {
    plan.chain
        .iter()
        .map(|level| {
            let key: Vec<&str> = level.key.iter().map(String::as_str).collect();
            let aggs: Vec<Aggregate> = plan
                .features
                .iter()
                .map(|feature| {
                    let agg = match &plan.aggregation {
                        Aggregation::UnweightedMean => Aggregate::mean(feature),
                        Aggregation::WeightedMean { weight_column } => {
                            Aggregate::weighted_mean(feature, weight_column)
                        }
                    };
                    agg.named(&level.suffixed(feature))
                })
                .collect();
            Ok(source.group_aggregate(&key, &aggs)?)
        })
        .collect()
}

/// Fills missing `plan.features` cells of `primary` from aggregates of
/// `source`, level by level in chain order. `source` may be the primary
/// table itself; aggregates are always taken from the unfilled input.
pub fn impute(
    primary: &KeyedTable,
    source: &KeyedTable,
    plan: &ImputationPlan,
) -> Result<(KeyedTable, ImputationReport), ImputeError> {
    validate_plan(primary, source, plan)?;
    let aggregates = level_aggregates(source, plan)?;

    let mut report = ImputationReport {
        rows: primary.len(),
        ..ImputationReport::default()
    };

    let mut tags = Vec::with_capacity(plan.features.len());
    for feature in &plan.features {
        let observed = primary.len() - primary.missing_count(feature)?;
        report.observed.push((feature.clone(), observed));
        tags.push(
            when(col(feature).is_not_null())
                .then(lit(OBSERVED_TAG))
                .otherwise(lit(NULL))
                .alias(&working_tag(feature)),
        );
    }
    let mut working = primary.with_columns(tags)?;

    for (level, aggregate) in plan.chain.iter().zip(&aggregates) {
        let key: Vec<&str> = level.key.iter().map(String::as_str).collect();
        let before: Vec<usize> = plan
            .features
            .iter()
            .map(|feature| working.missing_count(feature))
            .collect::<Result<_, _>>()?;

        let joined = working.left_join(aggregate, &key)?;
        let mut fills = Vec::with_capacity(plan.features.len() * 2);
        for feature in &plan.features {
            let suffixed = level.suffixed(feature);
            let tag = working_tag(feature);
            fills.push(
                when(col(feature).is_null().and(col(&suffixed).is_not_null()))
                    .then(lit(level.tag.as_str()))
                    .otherwise(col(&tag))
                    .alias(&tag),
            );
            fills.push(col(feature).fill_null(col(&suffixed)));
        }
        working = joined.with_columns(fills)?;

        let mut suffixed_columns = Vec::with_capacity(plan.features.len());
        for (feature, missing_before) in plan.features.iter().zip(before) {
            let cells = missing_before - working.missing_count(feature)?;
            info!(
                component = "impute",
                event = "impute.level.applied",
                feature = feature.as_str(),
                level = level.tag.as_str(),
                filled = cells
            );
            report.fills.push(LevelFill {
                feature: feature.clone(),
                level: level.tag.clone(),
                cells,
            });
            suffixed_columns.push(level.suffixed(feature));
        }

        let drop: Vec<&str> = suffixed_columns.iter().map(String::as_str).collect();
        working.drop_columns(&drop)?;
    }

    for feature in &plan.features {
        let remaining = working.missing_count(feature)?;
        if remaining > 0 {
            warn!(
                component = "impute",
                event = "impute.chain.exhausted",
                feature = feature.as_str(),
                still_missing = remaining
            );
        }
        report.still_missing.push((feature.clone(), remaining));

        let tag = working_tag(feature);
        if plan.provenance_columns {
            working.rename_column(&tag, &ImputationPlan::provenance_column(feature))?;
        } else {
            working.drop_columns(&[tag.as_str()])?;
        }
    }

    Ok((working, report))
}

/// Provenance tags are carried under a private name until the chain ends.
fn working_tag(feature: &str) -> String {
    format!("__{feature}_tag")
}

fn validate_plan(
    primary: &KeyedTable,
    source: &KeyedTable,
    plan: &ImputationPlan,
) -> Result<(), ImputeError> {
    if plan.features.is_empty() {
        return Err(ImputeError::InvalidPlan(
            "features must not be empty".to_string(),
        ));
    }
    if plan.chain.is_empty() {
        return Err(ImputeError::InvalidPlan(
            "fallback chain must not be empty".to_string(),
        ));
    }

    let mut tags = HashSet::new();
    for level in &plan.chain {
        if level.tag.is_empty() {
            return Err(ImputeError::InvalidPlan(
                "level tags must not be empty".to_string(),
            ));
        }
        if !tags.insert(level.tag.as_str()) {
            return Err(ImputeError::InvalidPlan(format!(
                "duplicate level tag {}",
                level.tag
            )));
        }
        for column in &level.key {
            if plan.features.contains(column) {
                return Err(ImputeError::InvalidPlan(format!(
                    "level {} keys on imputed feature {column}",
                    level.tag
                )));
            }
            primary.column_index(column)?;
            source.column_index(column)?;
        }
        for feature in &plan.features {
            let suffixed = level.suffixed(feature);
            if primary.has_column(&suffixed) {
                return Err(ImputeError::InvalidPlan(format!(
                    "column {suffixed} already exists on the primary table"
                )));
            }
        }
    }

    for feature in &plan.features {
        primary.column_index(feature)?;
        source.column_index(feature)?;
    }
    if let Aggregation::WeightedMean { weight_column } = &plan.aggregation {
        source.column_index(weight_column)?;
    }

    Ok(())
}
