//! Orchestrates the feature-table build.
//!
//! Stages run strictly in sequence, each fully materializing its table
//! before the next starts:
//!
//! 1. yearly sales totals per (year, region, product)
//! 2. orders to date at the configured cutoff
//! 3. optional monthly to-date series and partial-month blend, the blend
//!    fraction fixed or taken per region from historical bookings
//! 4. lags over quantities and to-date columns
//! 5. maturity bucket from the product name
//! 6. product attributes on (year, product)
//! 7. weather on (year, region)
//! 8. commodity prices (with their own `lag_1`) on (year)
//! 9. consensus forecast on (year, region, product)
//! 10. performance features, then hierarchical imputation (germplasm
//!     first when enabled)
//! 11. default trait
//! 12. list price, imputed from observed prices
//! 13. every remaining missing numeric cell set to zero
//! 14. uniqueness check, sort, schema
//!
//! Every family's year column is rewritten as integers on the way in, so a
//! CSV year read as text still joins against integer years.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use polars::prelude::{col, lit};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cutoff::{
    blend_month_totals, blend_with_fractions, historical_month_fractions, month_column,
    monthly_to_date, to_date_totals, CutoffError, CutoffPolicy, FractionRequest, QuantitySpec,
    ToDateRequest,
};
use crate::impute::{impute, Aggregation, FallbackLevel, ImputationPlan, ImputationReport, ImputeError};
use crate::ingest::{read_source, region_map_from_table, remap_regions, IngestError, SourceSpec};
use crate::lag::{build_lags, LagError, LagFill, LagSpec};
use crate::performance::{
    yield_advantage_features, PerformanceError, TrialColumns, PERFORMANCE_FEATURES,
};
use crate::products::{
    add_germplasm_column, add_maturity_column, default_trait_aliases, normalize_traits,
    ProductError, DEFAULT_TRAIT,
};
use crate::schema::{build_feature_schema, FeatureSchema, SchemaError};
use crate::table::{Aggregate, KeyedTable, TableError, Value};

pub const YEAR: &str = "year";
pub const REGION: &str = "region";
pub const PRODUCT: &str = "product";
pub const TRAIT: &str = "trait";
pub const MATURITY: &str = "RM";
/// Digits of the product name; shared by products bred from one line.
pub const GERMPLASM: &str = "germplasm";

pub const FEATURE_KEY: [&str; 3] = [YEAR, REGION, PRODUCT];

pub const COMMODITY_LAG_PREFIX: &str = "lag_";

/// Shift applied to each family's year column before it is joined, so that
/// e.g. a trial run in year Y informs sales in year Y + 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct YearOffsets {
    pub performance: i64,
    pub forecast: i64,
    pub list_price: i64,
}

impl Default for YearOffsets {
    fn default() -> Self {
        Self {
            performance: 1,
            forecast: 1,
            list_price: 0,
        }
    }
}

/// Table the performance fallback levels are aggregated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputationSource {
    /// Per-product trial aggregates.
    #[default]
    Trials,
    /// The merged feature table, needed when weighting by a forecast column.
    FeatureTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendConfig {
    pub this_month: u32,
    pub next_month: u32,
    /// Fixed fraction for every region. When absent, each region uses the
    /// share of its historical `next_month` orders booked by the cutoff day.
    #[serde(default)]
    pub fraction: Option<f64>,
    pub output: String,
}

impl BlendConfig {
    /// Blend of two adjacent months at per-region historical fractions.
    pub fn between(this_month: u32, next_month: u32, output: &str) -> Self {
        Self {
            this_month,
            next_month,
            fraction: None,
            output: output.to_string(),
        }
    }

    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = Some(fraction);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cutoff: CutoffPolicy,
    pub date_column: String,
    /// Summed per (year, region, product) and lagged.
    pub quantity_columns: Vec<String>,
    pub order_column: String,
    pub to_date_column: String,
    pub monthly_series: bool,
    pub partial_month_blend: Option<BlendConfig>,
    pub lag_offsets: Vec<u32>,
    pub maturity_buckets: bool,
    pub commodity_lags: bool,
    pub year_offsets: YearOffsets,
    pub trial_columns: TrialColumns,
    pub fallback_chain: Vec<FallbackLevel>,
    /// Keeps fallback levels keyed on [`GERMPLASM`]; when off they are
    /// removed from the chain.
    pub germplasm_imputation: bool,
    pub aggregation: Aggregation,
    pub imputation_source: ImputationSource,
    pub list_price_column: String,
    pub list_price_chain: Vec<FallbackLevel>,
    pub trait_aliases: BTreeMap<String, String>,
    pub default_trait: String,
    pub provenance_columns: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cutoff: CutoffPolicy::default(),
            date_column: "effective_date".to_string(),
            quantity_columns: vec!["order_Q".to_string()],
            order_column: "order_Q".to_string(),
            to_date_column: "order_Q_to_date".to_string(),
            monthly_series: false,
            partial_month_blend: None,
            lag_offsets: vec![1, 2],
            maturity_buckets: true,
            commodity_lags: true,
            year_offsets: YearOffsets::default(),
            trial_columns: TrialColumns::default(),
            fallback_chain: default_performance_chain(),
            germplasm_imputation: true,
            aggregation: Aggregation::UnweightedMean,
            imputation_source: ImputationSource::Trials,
            list_price_column: "SRP".to_string(),
            list_price_chain: default_list_price_chain(),
            trait_aliases: default_trait_aliases(),
            default_trait: DEFAULT_TRAIT.to_string(),
            provenance_columns: false,
        }
    }
}

/// GA (germplasm, region, year) -> PA (product, region) -> TAY (trait,
/// region, year) -> AY (region, year) -> Y (year).
pub fn default_performance_chain() -> Vec<FallbackLevel> {
    vec![
        FallbackLevel::new("GA", &[GERMPLASM, REGION, YEAR]),
        FallbackLevel::new("PA", &[PRODUCT, REGION]),
        FallbackLevel::new("TAY", &[TRAIT, REGION, YEAR]),
        FallbackLevel::new("AY", &[REGION, YEAR]),
        FallbackLevel::new("Y", &[YEAR]),
    ]
}

pub fn default_list_price_chain() -> Vec<FallbackLevel> {
    vec![
        FallbackLevel::new("ty", &[YEAR, TRAIT]),
        FallbackLevel::new("y", &[YEAR]),
    ]
}

impl PipelineConfig {
    /// The performance fallback chain with germplasm levels dropped when
    /// germplasm imputation is off.
    pub fn performance_chain(&self) -> Vec<FallbackLevel> {
        self.fallback_chain
            .iter()
            .filter(|level| self.germplasm_imputation || !keys_on_germplasm(level))
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.cutoff.validate()?;

        if self.quantity_columns.is_empty() {
            return Err(invalid("quantity_columns must not be empty"));
        }
        if self.lag_offsets.is_empty() {
            return Err(invalid("lag_offsets must not be empty"));
        }
        let mut offsets = self.lag_offsets.clone();
        offsets.sort_unstable();
        offsets.dedup();
        if offsets.len() != self.lag_offsets.len() {
            return Err(invalid("lag_offsets must be unique"));
        }
        if offsets.contains(&0) {
            return Err(invalid("lag_offsets must be > 0"));
        }

        validate_chain("fallback_chain", &self.performance_chain())?;
        validate_chain("list_price_chain", &self.list_price_chain)?;

        if let Aggregation::WeightedMean { weight_column } = &self.aggregation {
            if weight_column.trim().is_empty() {
                return Err(invalid("weighted aggregation needs a weight_column"));
            }
            if self.imputation_source != ImputationSource::FeatureTable {
                return Err(invalid(
                    "weighted aggregation requires imputation_source = feature_table",
                ));
            }
        }

        if let Some(blend) = &self.partial_month_blend {
            if let Some(fraction) = blend.fraction {
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(invalid(&format!(
                        "blend fraction must be within [0, 1], got {fraction}"
                    )));
                }
            }
            for month in [blend.this_month, blend.next_month] {
                if !(1..=12).contains(&month) {
                    return Err(invalid(&format!(
                        "blend months must be within 1..=12, got {month}"
                    )));
                }
            }
            if blend.output.trim().is_empty() {
                return Err(invalid("blend output column must not be empty"));
            }
        }

        if self.default_trait.trim().is_empty() {
            return Err(invalid("default_trait must not be empty"));
        }

        Ok(())
    }
}

fn validate_chain(name: &str, chain: &[FallbackLevel]) -> Result<(), PipelineError> {
    if chain.is_empty() {
        return Err(invalid(&format!("{name} must not be empty")));
    }
    for (idx, level) in chain.iter().enumerate() {
        if level.tag.trim().is_empty() {
            return Err(invalid(&format!("{name} has a level without a tag")));
        }
        if chain[..idx].iter().any(|prev| prev.tag == level.tag) {
            return Err(invalid(&format!(
                "{name} has duplicate level tag {}",
                level.tag
            )));
        }
    }
    Ok(())
}

fn keys_on_germplasm(level: &FallbackLevel) -> bool {
    level.key.iter().any(|k| k == GERMPLASM)
}

fn invalid(message: &str) -> PipelineError {
    PipelineError::InvalidConfig(message.to_string())
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("{family} year value '{value}' is not an integer year")]
    InvalidYear { family: &'static str, value: String },
    #[error("config read error: {0}")]
    ConfigRead(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Cutoff(#[from] CutoffError),
    #[error(transparent)]
    Lag(#[from] LagError),
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Performance(#[from] PerformanceError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Product(#[from] ProductError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Loaded source tables. Only sales is required; an absent family is
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    /// Event rows: year, region, product, date and quantity columns.
    pub sales: KeyedTable,
    /// Keyed by (year, product); usually carries `trait`.
    pub products: Option<KeyedTable>,
    /// Keyed by (year, region).
    pub weather: Option<KeyedTable>,
    /// Keyed by (year).
    pub commodity: Option<KeyedTable>,
    /// Raw head-to-head trial pairs.
    pub trials: Option<KeyedTable>,
    /// Keyed by (year, region, product).
    pub forecast: Option<KeyedTable>,
    /// Keyed by (year, product).
    pub list_price: Option<KeyedTable>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub rows: usize,
    pub schema: FeatureSchema,
    pub performance_imputation: Option<ImputationReport>,
    pub list_price_imputation: Option<ImputationReport>,
    pub default_trait_fills: usize,
    pub terminal_fills: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub table: KeyedTable,
    pub report: PipelineReport,
}

pub fn run_pipeline(
    inputs: &PipelineInputs,
    config: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    info!(
        component = "pipeline",
        event = "pipeline.run.start",
        sales_rows = inputs.sales.len(),
        cutoff_month = config.cutoff.month,
        cutoff_day = config.cutoff.day,
        lag_offsets = ?config.lag_offsets
    );

    let key = FEATURE_KEY;
    let key_names: Vec<String> = key.iter().map(|k| k.to_string()).collect();
    let sales = integer_years(&inputs.sales, "sales")?;

    let totals: Vec<Aggregate> = config
        .quantity_columns
        .iter()
        .map(|q| Aggregate::sum(q))
        .collect();
    let mut table = sales.group_aggregate(&key, &totals)?;
    stage_finished("yearly_totals", &table);

    let to_date_request = ToDateRequest {
        key: key_names.clone(),
        year_column: YEAR.to_string(),
        date_column: config.date_column.clone(),
        quantities: vec![QuantitySpec::new(&config.order_column, &config.to_date_column)],
    };
    let to_date = to_date_totals(&sales, &to_date_request, &config.cutoff)?;
    table = table.left_join(&to_date, &key)?;
    table.fill_missing(&config.to_date_column, &Value::Float(0.0))?;
    stage_finished("to_date", &table);

    let mut lag_values: Vec<String> = config.quantity_columns.clone();
    lag_values.push(config.to_date_column.clone());

    if config.monthly_series || config.partial_month_blend.is_some() {
        let monthly_request = ToDateRequest {
            quantities: vec![QuantitySpec::new(&config.order_column, &config.order_column)],
            ..to_date_request.clone()
        };
        let monthly = monthly_to_date(
            &sales,
            &monthly_request,
            config.cutoff.fiscal_boundary_month,
        )?;
        table = table.left_join(&monthly, &key)?;

        if let Some(blend) = &config.partial_month_blend {
            let this_month = month_column(&config.order_column, blend.this_month);
            let next_month = month_column(&config.order_column, blend.next_month);
            match blend.fraction {
                Some(fraction) => blend_month_totals(
                    &mut table,
                    &this_month,
                    &next_month,
                    fraction,
                    &blend.output,
                )?,
                None => {
                    let request = FractionRequest {
                        region_column: REGION.to_string(),
                        date_column: config.date_column.clone(),
                        quantity: config.order_column.clone(),
                    };
                    let fractions = historical_month_fractions(
                        &sales,
                        &request,
                        blend.next_month,
                        config.cutoff.day,
                    )?;
                    blend_with_fractions(
                        &mut table,
                        &this_month,
                        &next_month,
                        &fractions,
                        REGION,
                        &blend.output,
                    )?;
                }
            }
            lag_values.push(blend.output.clone());
        }
        stage_finished("monthly_to_date", &table);
    }

    let lag_value_refs: Vec<&str> = lag_values.iter().map(String::as_str).collect();
    let lag_spec = LagSpec::new(YEAR, &[REGION, PRODUCT], &lag_value_refs, &config.lag_offsets);
    table = build_lags(&table, &lag_spec)?;
    stage_finished("lags", &table);

    if config.maturity_buckets {
        add_maturity_column(&mut table, PRODUCT, MATURITY)?;
    }

    if let Some(products) = &inputs.products {
        let mut products = integer_years(products, "products")?;
        if products.has_column(TRAIT) {
            normalize_traits(&mut products, TRAIT, &config.trait_aliases)?;
        }
        table = table.left_join(&products, &[YEAR, PRODUCT])?;
        stage_finished("products", &table);
    }

    if let Some(weather) = &inputs.weather {
        let weather = integer_years(weather, "weather")?;
        table = table.left_join(&weather, &[YEAR, REGION])?;
        stage_finished("weather", &table);
    }

    if let Some(commodity) = &inputs.commodity {
        let commodity = integer_years(commodity, "commodity")?;
        let commodity = if config.commodity_lags {
            let columns = commodity.columns();
            let values: Vec<&str> = columns
                .iter()
                .map(String::as_str)
                .filter(|c| *c != YEAR)
                .collect();
            let spec = LagSpec::new(YEAR, &[], &values, &[1])
                .with_suffix_prefix(COMMODITY_LAG_PREFIX)
                .with_fill(LagFill::Missing);
            build_lags(&commodity, &spec)?
        } else {
            commodity
        };
        table = table.left_join(&commodity, &[YEAR])?;
        stage_finished("commodity", &table);
    }

    if let Some(forecast) = &inputs.forecast {
        let forecast = shift_year_column(forecast, config.year_offsets.forecast, "forecast")?;
        let value_columns: Vec<String> = forecast
            .columns()
            .iter()
            .filter(|c| !key.contains(&c.as_str()))
            .cloned()
            .collect();
        table = table.left_join(&forecast, &key)?;
        for column in &value_columns {
            table.fill_missing(column, &Value::Float(0.0))?;
        }
        stage_finished("forecast", &table);
    }

    // Trait is a fallback key; rows without attributes keep it null until
    // the default below.
    if !table.has_column(TRAIT) {
        let nulls = vec![Value::Null; table.len()];
        table.add_column(TRAIT, nulls)?;
    }

    let mut performance_imputation = None;
    if let Some(trials) = &inputs.trials {
        let chain = config.performance_chain();
        let germplasm_levels = chain.iter().any(keys_on_germplasm);
        let derive_germplasm = germplasm_levels && !table.has_column(GERMPLASM);

        let mut per_trait = yield_advantage_features(
            trials,
            &config.trial_columns,
            config.year_offsets.performance,
            &config.trait_aliases,
        )?;
        let means: Vec<Aggregate> = PERFORMANCE_FEATURES
            .iter()
            .map(|f| Aggregate::mean(f))
            .collect();
        let per_product = per_trait.group_aggregate(&key, &means)?;
        table = table.left_join(&per_product, &key)?;
        if derive_germplasm {
            add_germplasm_column(&mut table, PRODUCT, GERMPLASM)?;
        }
        if germplasm_levels && !per_trait.has_column(GERMPLASM) {
            add_germplasm_column(&mut per_trait, PRODUCT, GERMPLASM)?;
        }

        let source = match config.imputation_source {
            ImputationSource::Trials => per_trait,
            ImputationSource::FeatureTable => table.clone(),
        };
        let plan = ImputationPlan {
            features: PERFORMANCE_FEATURES.iter().map(|f| f.to_string()).collect(),
            chain,
            aggregation: config.aggregation.clone(),
            provenance_columns: config.provenance_columns,
        };
        let (imputed, report) = impute(&table, &source, &plan)?;
        table = imputed;
        if derive_germplasm {
            table.drop_columns(&[GERMPLASM])?;
        }
        performance_imputation = Some(report);
        stage_finished("performance", &table);
    }

    let default_trait_fills =
        table.fill_missing(TRAIT, &Value::from(config.default_trait.as_str()))?;

    let mut list_price_imputation = None;
    if let Some(prices) = &inputs.list_price {
        let prices = shift_year_column(prices, config.year_offsets.list_price, "list_price")?
            .select(&[YEAR, PRODUCT, config.list_price_column.as_str()])?;
        table = table.left_join(&prices, &[YEAR, PRODUCT])?;

        let plan = ImputationPlan {
            features: vec![config.list_price_column.clone()],
            chain: config.list_price_chain.clone(),
            aggregation: Aggregation::UnweightedMean,
            provenance_columns: config.provenance_columns,
        };
        let (imputed, report) = impute(&table, &table, &plan)?;
        table = imputed;
        list_price_imputation = Some(report);
        stage_finished("list_price", &table);
    }

    let provenance: Vec<String> = table
        .columns()
        .iter()
        .filter(|c| c.ends_with("_provenance"))
        .cloned()
        .collect();
    let mut skip: Vec<&str> = key.to_vec();
    skip.push(TRAIT);
    skip.extend(provenance.iter().map(String::as_str));
    let terminal_fills = table.fill_missing_numeric(0.0, &skip)?;

    table.ensure_unique(&key)?;
    table.sort_by(&key)?;
    let schema = build_feature_schema(&table)?;

    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        rows = table.len(),
        columns = table.columns().len(),
        default_trait_fills = default_trait_fills,
        terminal_fills = terminal_fills,
        fingerprint = schema.fingerprint.as_str()
    );

    let report = PipelineReport {
        rows: table.len(),
        schema,
        performance_imputation,
        list_price_imputation,
        default_trait_fills,
        terminal_fills,
    };
    Ok(PipelineOutput { table, report })
}

fn stage_finished(stage: &str, table: &KeyedTable) {
    info!(
        component = "pipeline",
        event = "pipeline.stage.finish",
        stage,
        rows = table.len(),
        columns = table.columns().len()
    );
}

/// Copy of `table` with its year column as integers.
fn integer_years(table: &KeyedTable, family: &'static str) -> Result<KeyedTable, PipelineError> {
    let mut normalized = table.clone();
    normalized
        .normalize_int_column(YEAR)
        .map_err(|err| match err {
            TableError::NonInteger { value, .. } => PipelineError::InvalidYear { family, value },
            other => other.into(),
        })?;
    Ok(normalized)
}

fn shift_year_column(
    table: &KeyedTable,
    offset: i64,
    family: &'static str,
) -> Result<KeyedTable, PipelineError> {
    let normalized = integer_years(table, family)?;
    Ok(normalized.with_columns(vec![(col(YEAR) + lit(offset)).alias(YEAR)])?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMapSource {
    pub source: SourceSpec,
    pub old_column: String,
    pub new_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Per-year extracts, stacked in order.
    pub sales: Vec<SourceSpec>,
    #[serde(default)]
    pub region_map: Option<RegionMapSource>,
    #[serde(default)]
    pub products: Option<SourceSpec>,
    #[serde(default)]
    pub weather: Option<SourceSpec>,
    #[serde(default)]
    pub commodity: Option<SourceSpec>,
    #[serde(default)]
    pub trials: Option<SourceSpec>,
    #[serde(default)]
    pub forecast: Option<SourceSpec>,
    #[serde(default)]
    pub list_price: Option<SourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub sources: SourcesConfig,
    pub output_path: PathBuf,
}

impl RunConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(raw)?;
        config.pipeline.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Reads every declared source. Any unreadable file aborts the load. Region
/// ids are remapped on every table carrying a `region` column.
pub fn load_inputs(sources: &SourcesConfig) -> Result<PipelineInputs, PipelineError> {
    if sources.sales.is_empty() {
        return Err(invalid("at least one sales source is required"));
    }

    let region_map = match &sources.region_map {
        Some(map) => Some(region_map_from_table(
            &read_source(&map.source)?,
            &map.old_column,
            &map.new_column,
        )?),
        None => None,
    };

    let sales_tables = sources
        .sales
        .iter()
        .map(|spec| integer_years(&read_source(spec)?, "sales"))
        .collect::<Result<Vec<_>, _>>()?;
    let optional = |spec: &Option<SourceSpec>| spec.as_ref().map(read_source).transpose();

    let mut inputs = PipelineInputs {
        sales: KeyedTable::concat(&sales_tables)?,
        products: optional(&sources.products)?,
        weather: optional(&sources.weather)?,
        commodity: optional(&sources.commodity)?,
        trials: optional(&sources.trials)?,
        forecast: optional(&sources.forecast)?,
        list_price: optional(&sources.list_price)?,
    };

    if let Some(map) = &region_map {
        let mut remapped = remap_regions(&mut inputs.sales, REGION, map)?;
        for table in [
            &mut inputs.weather,
            &mut inputs.trials,
            &mut inputs.forecast,
        ]
        .into_iter()
        .flatten()
        {
            if table.has_column(REGION) {
                remapped += remap_regions(table, REGION, map)?;
            }
        }
        info!(
            component = "pipeline",
            event = "pipeline.regions.remapped",
            mapped_ids = map.len(),
            remapped_cells = remapped
        );
    }

    Ok(inputs)
}
