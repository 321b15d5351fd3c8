//! Logging setup shared by the binary and tests.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_VAR: &str = "CROPCAST_LOG_LEVEL";
pub const LOG_FORMAT_VAR: &str = "CROPCAST_LOG_FORMAT";
pub const LOG_TARGET_VAR: &str = "CROPCAST_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Builds the config from any variable source. Unparseable values keep the
/// default.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup(LOG_LEVEL_VAR) {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }
    if let Some(format) = lookup(LOG_FORMAT_VAR).as_deref().and_then(parse_log_format) {
        config.format = format;
    }
    if let Some(include_target) = lookup(LOG_TARGET_VAR).as_deref().and_then(parse_bool) {
        config.include_target = include_target;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_run_start(logging: &LoggingConfig, config_path: &Path) {
    info!(
        component = "build_feature_table",
        event = "run.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        include_target = logging.include_target,
        config_path = %config_path.display()
    );
}

pub fn log_run_output(output_path: &Path, rows: usize, fingerprint: &str) {
    info!(
        component = "build_feature_table",
        event = "run.output_written",
        output_path = %output_path.display(),
        rows,
        fingerprint
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_vars_missing() {
        assert_eq!(
            logging_config_from_lookup(lookup_from(&[])),
            LoggingConfig::default()
        );
    }

    #[test]
    fn parses_level_format_and_target() {
        let cfg = logging_config_from_lookup(lookup_from(&[
            (LOG_LEVEL_VAR, "cropcast=debug"),
            (LOG_FORMAT_VAR, " JSON "),
            (LOG_TARGET_VAR, "off"),
        ]));

        assert_eq!(cfg.level, "cropcast=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unparseable_values_keep_defaults() {
        let cfg = logging_config_from_lookup(lookup_from(&[
            (LOG_LEVEL_VAR, "   "),
            (LOG_FORMAT_VAR, "yaml"),
            (LOG_TARGET_VAR, "maybe"),
        ]));

        assert_eq!(cfg, LoggingConfig::default());
    }
}
