mod support;

use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use bqx_backfill::{
    init_baseline_rates, log_app_start, log_job_complete, log_run_summary, run_partition_job,
    FailureRecord, FamilyKind, FamilySet, FeatureFamily, JobContext, JobReport, JobStatus,
    LoggingConfig, Pair, PartitionUnit, RunSummary,
};
use chrono::NaiveDate;
use support::{baselines, month, Fixture};
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

fn sample_unit() -> PartitionUnit {
    PartitionUnit {
        family: FamilyKind::Regression,
        pair: Pair::Usdcad,
        month: month(2020, 4),
    }
}

#[test]
fn job_and_run_helpers_emit_structured_events() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start("run", &LoggingConfig::default());
        log_job_complete(
            &JobReport {
                unit: sample_unit(),
                status: JobStatus::Completed,
                rows_written: 43_200,
                batches: 9,
                elapsed_seconds: 4.2,
                error_kind: None,
                error: None,
            },
            1,
            3,
        );
        log_run_summary(&RunSummary {
            total: 3,
            completed: 1,
            failed: 1,
            empty: 1,
            rows_total: 43_200,
            failures: vec![FailureRecord {
                unit: sample_unit(),
                kind: "kernel",
                message: "window 0 is below the minimum of 1".to_string(),
                elapsed_seconds: 0.1,
            }],
            ..RunSummary::default()
        });
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"job.complete\""));
    assert!(logs.contains("\"status\":\"completed\""));
    assert!(logs.contains("\"pair\":\"usdcad\""));
    assert!(logs.contains("\"progress\":\"1/3\""));
    assert!(logs.contains("\"event\":\"run.summary\""));
}

#[test]
fn failed_jobs_log_at_error_with_their_kind() {
    let logs = capture_logs(Level::ERROR, || {
        log_job_complete(
            &JobReport {
                unit: sample_unit(),
                status: JobStatus::Failed,
                rows_written: 0,
                batches: 0,
                elapsed_seconds: 0.5,
                error_kind: Some("missing_baseline"),
                error: Some("no baseline rate for usdcad".to_string()),
            },
            2,
            3,
        );
        log_job_complete(
            &JobReport {
                unit: sample_unit(),
                status: JobStatus::Empty,
                rows_written: 0,
                batches: 0,
                elapsed_seconds: 0.0,
                error_kind: None,
                error: None,
            },
            3,
            3,
        );
    });

    assert!(logs.contains("\"level\":\"ERROR\""));
    assert!(logs.contains("\"error_kind\":\"missing_baseline\""));
    assert!(!logs.contains("\"status\":\"empty\""));
}

#[test]
fn empty_partitions_and_baselines_are_logged() {
    let fixture = Fixture::new();
    let mut store = fixture.store();
    let families =
        FamilySet::new(vec![FeatureFamily::new(FamilyKind::Bqx, &[5]).unwrap()]).unwrap();
    let rates = baselines(&[(Pair::Eurusd, 1.1)]);

    let logs = capture_logs(Level::INFO, || {
        let ctx = JobContext::new(&families, &rates);
        let unit = PartitionUnit {
            family: FamilyKind::Bqx,
            pair: Pair::Eurusd,
            month: month(2020, 5),
        };
        run_partition_job(&mut store, unit, &ctx).expect("empty month is not an error");
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        init_baseline_rates(&mut store, &[Pair::Nzdusd], date)
            .expect("missing source is reported, not raised");
    });

    assert!(logs.contains("\"event\":\"job.partition_empty\""));
    assert!(logs.contains("\"event\":\"baseline.source_missing\""));
    assert!(logs.contains("\"component\":\"job\""));
}
