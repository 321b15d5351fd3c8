use std::path::PathBuf;

use cropcast::{
    init_logging, load_inputs, log_run_output, log_run_start, logging_config_from_env,
    run_pipeline, write_feature_table, RunConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config_path = std::env::var("CROPCAST_PIPELINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("pipeline.json"));
    log_run_start(&logging_cfg, &config_path);

    let run = RunConfig::from_path(&config_path)?;
    let inputs = load_inputs(&run.sources)?;
    let output = run_pipeline(&inputs, &run.pipeline)?;

    if let Some(parent) = run.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_feature_table(&run.output_path, &output.table)?;
    log_run_output(
        &run.output_path,
        output.report.rows,
        &output.report.schema.fingerprint,
    );

    Ok(())
}
