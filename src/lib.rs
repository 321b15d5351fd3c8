//! cropcast core crate.
//!
//! Builds the per-(year, region, product) feature table for seed sales
//! forecasting:
//! - keyed tables over polars data frames, with explicit uniqueness checks
//! - to-date order totals under cutoff-date conventions
//! - year-lagged features
//! - hierarchical imputation over an ordered fallback chain
//! - a staged orchestrator from CSV sources to one CSV feature table

mod cutoff;
mod impute;
mod ingest;
mod lag;
mod observability;
mod performance;
mod pipeline;
mod products;
mod schema;
mod table;

pub use cutoff::{
    blend_month_totals, blend_with_fractions, historical_month_fractions, marketing_months,
    month_column, monthly_to_date, to_date_totals, CutoffError, CutoffPolicy, FractionRequest,
    QuantitySpec, ToDateRequest, DEFAULT_FISCAL_BOUNDARY_MONTH, DEFAULT_ORDER_FRACTION, FRACTION,
};
pub use impute::{
    impute, level_aggregates, Aggregation, FallbackLevel, ImputationPlan, ImputationReport,
    ImputeError, LevelFill, OBSERVED_TAG,
};
pub use ingest::{
    parse_cell, read_source, read_source_from_reader, region_map_from_table, remap_regions,
    write_feature_table, ColumnFilter, ColumnKind, ColumnSpec, IngestError, SourceSpec,
};
pub use lag::{build_lags, LagError, LagFill, LagSpec};
pub use observability::{
    init_logging, log_run_output, log_run_start, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError, LOG_FORMAT_VAR,
    LOG_LEVEL_VAR, LOG_TARGET_VAR,
};
pub use performance::{
    with_yield_advantage, yield_advantage_features, PerformanceError, TrialColumns, MEAN_YIELD,
    PERFORMANCE_FEATURES, YIELD_ADVANTAGE, YIELD_ADV_IN_TRAIT, YIELD_ADV_OUT_OF_TRAIT,
    YIELD_ADV_OVERALL,
};
pub use pipeline::{
    default_list_price_chain, default_performance_chain, load_inputs, run_pipeline, BlendConfig,
    ImputationSource, PipelineConfig, PipelineError, PipelineInputs, PipelineOutput,
    PipelineReport, RegionMapSource, RunConfig, SourcesConfig, YearOffsets,
    COMMODITY_LAG_PREFIX, FEATURE_KEY, GERMPLASM, MATURITY, PRODUCT, REGION, TRAIT, YEAR,
};
pub use products::{
    add_germplasm_column, add_maturity_column, default_trait_aliases, germplasm, maturity_bucket,
    maturity_code, normalize_traits, ProductError, DEFAULT_TRAIT, NON_POSITIVE_MATURITY,
};
pub use schema::{
    assert_schema_compatible, build_feature_schema, FeatureColumn, FeatureSchema, SchemaError,
    FEATURE_SCHEMA_VERSION,
};
pub use table::{AggFunc, Aggregate, FeatureDType, KeyedTable, TableError, Value};
