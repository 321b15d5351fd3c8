use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use cropcast::{
    impute, log_run_output, log_run_start, read_source_from_reader, run_pipeline, ColumnKind,
    ColumnSpec, FallbackLevel, ImputationPlan, KeyedTable, LoggingConfig, PipelineConfig,
    PipelineInputs, SourceSpec, Value,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

#[test]
fn imputation_logs_each_level_and_exhausted_chain() {
    let table = KeyedTable::from_rows(
        ["year", "region", "yield"],
        vec![
            vec![2020.into(), "R1".into(), 10.0.into()],
            vec![2020.into(), "R1".into(), Value::Null],
            vec![2031.into(), "R2".into(), Value::Null],
        ],
    )
    .expect("fixture table should build");
    let plan = ImputationPlan::new(
        &["yield"],
        vec![
            FallbackLevel::new("AY", &["region", "year"]),
            FallbackLevel::new("Y", &["year"]),
        ],
    );

    let logs = capture_logs(Level::INFO, || {
        let (_, report) = impute(&table, &table, &plan).expect("imputation should succeed");
        assert_eq!(report.filled_by("yield", "AY"), 1);
        assert_eq!(report.missing_after("yield"), 1);
    });

    assert!(logs.contains("\"event\":\"impute.level.applied\""));
    assert!(logs.contains("\"level\":\"AY\""));
    assert!(logs.contains("\"event\":\"impute.chain.exhausted\""));
}

#[test]
fn pipeline_logs_stage_progress() {
    let sales = KeyedTable::from_rows(
        ["year", "region", "product", "effective_date", "order_Q"],
        vec![vec![2020.into(), "R1".into(), "P1".into(), Value::Null, 5.0.into()]],
    )
    .expect("fixture table should build");
    let inputs = PipelineInputs {
        sales,
        ..PipelineInputs::default()
    };

    let logs = capture_logs(Level::INFO, || {
        run_pipeline(&inputs, &PipelineConfig::default()).expect("pipeline should run");
    });

    assert!(logs.contains("\"event\":\"pipeline.run.start\""));
    assert!(logs.contains("\"event\":\"pipeline.stage.finish\""));
    assert!(logs.contains("\"stage\":\"lags\""));
    assert!(logs.contains("\"event\":\"lag.build.finish\""));
    assert!(logs.contains("\"event\":\"pipeline.run.finish\""));
}

#[test]
fn source_reader_logs_loaded_rows() {
    let spec = SourceSpec::new(
        "weather",
        "weather.csv",
        vec![
            ColumnSpec::new("year", ColumnKind::Int),
            ColumnSpec::new("precip", ColumnKind::Float),
        ],
    );

    let logs = capture_logs(Level::INFO, || {
        let table = read_source_from_reader(&spec, "year,precip\n2020,3.5\n".as_bytes())
            .expect("csv should parse");
        assert_eq!(table.len(), 1);
    });

    assert!(logs.contains("\"event\":\"ingest.source.loaded\""));
    assert!(logs.contains("\"source\":\"weather\""));
}

#[test]
fn run_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_run_start(&cfg, Path::new("pipeline.json"));
        log_run_output(Path::new("out/features.csv"), 6, "abc123");
    });

    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"event\":\"run.output_written\""));
}
