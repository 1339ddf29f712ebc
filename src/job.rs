//! One `(family, pair, month)` unit: read with a lookback pad, run the kernel
//! per window, keep in-month rows, upsert in batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::baseline::BaselineRates;
use crate::calendar::YearMonth;
use crate::family::{FamilyError, FamilyInput, FamilyKind, FamilySet, FeatureFamily};
use crate::pairs::Pair;
use crate::store::{
    FeatureRow, FeatureStore, SeriesFrame, SeriesSource, SourceColumn, StoreError,
};
use crate::window::{finite, KernelError, KernelOutput};

pub const DEFAULT_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionUnit {
    pub family: FamilyKind,
    pub pair: Pair,
    pub month: YearMonth,
}

impl std::fmt::Display for PartitionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.family, self.pair, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Written { rows: usize, batches: usize },
    /// No source rows fell inside the month; nothing was written.
    Empty,
}

impl JobOutcome {
    pub fn rows_written(&self) -> usize {
        match self {
            Self::Written { rows, .. } => *rows,
            Self::Empty => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("kernel failed for window {window}: {source}")]
    Kernel { window: usize, source: KernelError },
    #[error(transparent)]
    Family(#[from] FamilyError),
    #[error("no baseline rate for {0}")]
    MissingBaseline(Pair),
    #[error("soft timeout of {timeout_secs}s exceeded during {stage}")]
    TimedOut {
        stage: &'static str,
        timeout_secs: u64,
    },
    #[error("interrupted before writing")]
    Interrupted,
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Short stable tag used in failure tables and CSV reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(StoreError::Unavailable { .. }) => "store_unavailable",
            Self::Store(StoreError::SchemaMismatch { .. }) => "schema_mismatch",
            Self::Store(_) => "store",
            Self::Kernel { .. } | Self::Panicked(_) => "kernel",
            Self::Family(_) => "config",
            Self::MissingBaseline(_) => "missing_baseline",
            Self::TimedOut { .. } => "timed_out",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Shared, read-only inputs of every job in a run.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub families: &'a FamilySet,
    pub baselines: &'a BaselineRates,
    pub batch_size: usize,
    pub timeout: Option<Duration>,
    pub cancel: Option<&'a AtomicBool>,
}

impl<'a> JobContext<'a> {
    pub fn new(families: &'a FamilySet, baselines: &'a BaselineRates) -> Self {
        Self {
            families,
            baselines,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Cancellation only applies before the first write; the deadline always applies.
    fn checkpoint(
        &self,
        started: Instant,
        stage: &'static str,
        writing: bool,
    ) -> Result<(), JobError> {
        if let Some(timeout) = self.timeout {
            if started.elapsed() >= timeout {
                return Err(JobError::TimedOut {
                    stage,
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
        if !writing && self.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(JobError::Interrupted);
        }
        Ok(())
    }
}

/// Kernel input of a family over the padded range.
struct JobInput {
    frame: SeriesFrame,
    rate_index: Option<Vec<f64>>,
}

pub fn run_partition_job<S: FeatureStore + ?Sized>(
    store: &mut S,
    unit: PartitionUnit,
    ctx: &JobContext<'_>,
) -> Result<JobOutcome, JobError> {
    let started = Instant::now();
    ctx.checkpoint(started, "start", false)?;

    let family = ctx.families.get(unit.family)?;
    let schema = family.schema();
    let month_start = unit.month.start_ms();
    let month_end = unit.month.end_ms_exclusive();

    let input = read_input(store, family, unit, ctx)?;
    let in_month: Vec<usize> = input
        .frame
        .ts_ms_utc
        .iter()
        .enumerate()
        .filter(|(_, ts)| (month_start..month_end).contains(*ts))
        .map(|(i, _)| i)
        .collect();
    if in_month.is_empty() {
        warn!(
            component = "job",
            event = "job.partition_empty",
            family = unit.family.as_str(),
            pair = unit.pair.as_str(),
            month = %unit.month,
            rows_read = input.frame.len()
        );
        return Ok(JobOutcome::Empty);
    }
    debug!(
        component = "job",
        event = "job.input_read",
        family = unit.family.as_str(),
        pair = unit.pair.as_str(),
        month = %unit.month,
        rows_read = input.frame.len(),
        rows_in_month = in_month.len()
    );
    ctx.checkpoint(started, "read", false)?;

    let mut outputs: Vec<KernelOutput> = Vec::with_capacity(family.windows().len());
    for window in family.windows() {
        let output = match &input.rate_index {
            Some(series) => unit
                .family
                .run_kernel(std::slice::from_ref(series), *window),
            None => {
                let terms: Vec<Vec<f64>> = family
                    .upstream_columns(*window)
                    .iter()
                    .map(|name| input.frame.column(name).map(<[f64]>::to_vec).unwrap_or_default())
                    .collect();
                unit.family.run_kernel(&terms, *window)
            }
        }
        .and_then(|output| output.ensure_finite().map(|()| output))
        .map_err(|source| JobError::Kernel {
            window: *window,
            source,
        })?;
        outputs.push(output);
        ctx.checkpoint(started, "kernel", false)?;
    }

    let rows = assemble_rows(&input, &outputs, &in_month);
    ctx.checkpoint(started, "assemble", false)?;

    store.ensure_output_partition(&schema, unit.pair, unit.month)?;
    let mut written = 0usize;
    let mut batches = 0usize;
    for batch in rows.chunks(ctx.batch_size) {
        ctx.checkpoint(started, "write", true)?;
        written += store.upsert_rows(&schema, unit.pair, unit.month, batch)?;
        batches += 1;
    }

    if let Err(err) = store.analyze(unit.family, unit.pair) {
        warn!(
            component = "job",
            event = "job.analyze_failed",
            family = unit.family.as_str(),
            pair = unit.pair.as_str(),
            error = %err
        );
    }

    Ok(JobOutcome::Written {
        rows: written,
        batches,
    })
}

fn read_input<S: FeatureStore + ?Sized>(
    store: &mut S,
    family: &FeatureFamily,
    unit: PartitionUnit,
    ctx: &JobContext<'_>,
) -> Result<JobInput, JobError> {
    let month_start = unit.month.start_ms();
    let month_end = unit.month.end_ms_exclusive();
    let pad = family.max_window();

    match unit.family.input() {
        FamilyInput::RateIndex => {
            if ctx.baselines.get(unit.pair).is_none() {
                return Err(JobError::MissingBaseline(unit.pair));
            }
            let range_start = store
                .lookback_start(SeriesSource::Bars, unit.pair, month_start, pad)?
                .unwrap_or(month_start);
            let frame =
                store.read_source_window(unit.pair, range_start, month_end, &[SourceColumn::Rate])?;
            let rates = frame.column(SourceColumn::Rate.as_str()).unwrap_or_default();
            let rate_index = ctx
                .baselines
                .index_series(unit.pair, rates)
                .map_err(|_| JobError::MissingBaseline(unit.pair))?;
            Ok(JobInput {
                frame,
                rate_index: Some(rate_index),
            })
        }
        FamilyInput::Upstream(upstream) => {
            let columns: Vec<String> = family
                .windows()
                .iter()
                .flat_map(|window| family.upstream_columns(*window))
                .collect();
            let range_start = store
                .lookback_start(SeriesSource::Family(upstream), unit.pair, month_start, pad)?
                .unwrap_or(month_start);
            let frame =
                store.read_feature_window(upstream, unit.pair, range_start, month_end, &columns)?;
            Ok(JobInput {
                frame,
                rate_index: None,
            })
        }
    }
}

/// Rows in schema order: the pass-through column first, then window-major features.
fn assemble_rows(
    input: &JobInput,
    outputs: &[KernelOutput],
    in_month: &[usize],
) -> Vec<FeatureRow> {
    in_month
        .iter()
        .map(|&i| {
            let mut values = Vec::new();
            if let Some(series) = &input.rate_index {
                values.push(finite(series[i]));
            }
            for output in outputs {
                values.extend(output.columns.iter().map(|(_, column)| column[i]));
            }
            FeatureRow {
                ts_ms_utc: input.frame.ts_ms_utc[i],
                values,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineRate;
    use crate::calendar::MINUTE_MS;
    use crate::family::FeatureSchema;
    use std::collections::BTreeMap;

    /// In-memory source bars plus a record of what was written.
    #[derive(Default)]
    struct MemoryStore {
        bars: Vec<(i64, f64)>,
        written: BTreeMap<i64, Vec<Option<f64>>>,
        batch_sizes: Vec<usize>,
        ensured: usize,
        fail_upsert: bool,
    }

    impl FeatureStore for MemoryStore {
        fn read_source_window(
            &mut self,
            _pair: Pair,
            start: i64,
            end: i64,
            _columns: &[SourceColumn],
        ) -> Result<SeriesFrame, StoreError> {
            let rows: Vec<&(i64, f64)> = self
                .bars
                .iter()
                .filter(|(ts, _)| (start..end).contains(ts))
                .collect();
            Ok(SeriesFrame {
                ts_ms_utc: rows.iter().map(|(ts, _)| *ts).collect(),
                columns: vec![("rate".to_string(), rows.iter().map(|(_, r)| *r).collect())],
            })
        }

        fn read_feature_window(
            &mut self,
            _family: FamilyKind,
            _pair: Pair,
            _start: i64,
            _end: i64,
            columns: &[String],
        ) -> Result<SeriesFrame, StoreError> {
            Ok(SeriesFrame {
                ts_ms_utc: Vec::new(),
                columns: columns.iter().map(|c| (c.clone(), Vec::new())).collect(),
            })
        }

        fn lookback_start(
            &mut self,
            _source: SeriesSource,
            _pair: Pair,
            before: i64,
            rows: usize,
        ) -> Result<Option<i64>, StoreError> {
            let earlier: Vec<i64> = self
                .bars
                .iter()
                .map(|(ts, _)| *ts)
                .filter(|ts| *ts < before)
                .collect();
            Ok(earlier.iter().rev().take(rows).last().copied())
        }

        fn ensure_output_partition(
            &mut self,
            _schema: &FeatureSchema,
            _pair: Pair,
            _month: YearMonth,
        ) -> Result<(), StoreError> {
            self.ensured += 1;
            Ok(())
        }

        fn upsert_rows(
            &mut self,
            _schema: &FeatureSchema,
            _pair: Pair,
            _month: YearMonth,
            rows: &[FeatureRow],
        ) -> Result<usize, StoreError> {
            if self.fail_upsert {
                return Err(StoreError::Unavailable {
                    attempts: 4,
                    message: "connection reset".to_string(),
                });
            }
            for row in rows {
                self.written.insert(row.ts_ms_utc, row.values.clone());
            }
            self.batch_sizes.push(rows.len());
            Ok(rows.len())
        }

        fn analyze(&mut self, _family: FamilyKind, _pair: Pair) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn month() -> YearMonth {
        YearMonth::new(2020, 3).unwrap()
    }

    fn store_with_pad(pad: usize, in_month: usize) -> MemoryStore {
        let start = month().start_ms() - pad as i64 * MINUTE_MS;
        MemoryStore {
            bars: (0..pad + in_month)
                .map(|i| (start + i as i64 * MINUTE_MS, 1.1 + (i % 9) as f64 * 0.001))
                .collect(),
            ..MemoryStore::default()
        }
    }

    fn fixtures() -> (FamilySet, BaselineRates) {
        let families = FamilySet::new(vec![
            FeatureFamily::new(FamilyKind::Bqx, &[3, 5]).unwrap(),
            FeatureFamily::new(FamilyKind::Regression, &[5]).unwrap(),
        ])
        .unwrap();
        let baselines = BaselineRates::from_rates([BaselineRate {
            pair: Pair::Eurusd,
            baseline_ts_ms: 0,
            rate: 1.1,
        }])
        .unwrap();
        (families, baselines)
    }

    fn unit(family: FamilyKind, pair: Pair) -> PartitionUnit {
        PartitionUnit {
            family,
            pair,
            month: month(),
        }
    }

    #[test]
    fn writes_in_month_rows_in_batches_with_full_lookback() {
        let (families, baselines) = fixtures();
        let ctx = JobContext::new(&families, &baselines).with_batch_size(30);
        let mut store = store_with_pad(20, 100);

        let outcome = run_partition_job(&mut store, unit(FamilyKind::Bqx, Pair::Eurusd), &ctx)
            .unwrap();
        assert_eq!(outcome, JobOutcome::Written { rows: 100, batches: 4 });
        assert_eq!(store.batch_sizes, vec![30, 30, 30, 10]);
        assert_eq!(store.ensured, 1);

        let (first_ts, first) = store.written.iter().next().unwrap();
        assert_eq!(*first_ts, month().start_ms());
        assert_eq!(first.len(), 1 + 2 * 6);
        assert!(first.iter().all(Option::is_some));
        assert!(store.written.keys().all(|ts| month().contains(*ts)));
    }

    #[test]
    fn without_history_the_leading_rows_are_edge_nulls() {
        let (families, baselines) = fixtures();
        let ctx = JobContext::new(&families, &baselines);
        let mut store = store_with_pad(0, 12);

        run_partition_job(&mut store, unit(FamilyKind::Regression, Pair::Eurusd), &ctx).unwrap();
        let rows: Vec<&Vec<Option<f64>>> = store.written.values().collect();
        assert_eq!(rows.len(), 12);
        for row in &rows[..5] {
            assert!(row[0].is_some(), "rate_index passes through");
            assert!(row[1..].iter().all(Option::is_none));
        }
        for row in &rows[5..] {
            assert!(row.iter().all(Option::is_some));
        }
    }

    #[test]
    fn missing_baseline_fails_before_touching_the_output() {
        let (families, baselines) = fixtures();
        let ctx = JobContext::new(&families, &baselines);
        let mut store = store_with_pad(5, 10);

        let err = run_partition_job(&mut store, unit(FamilyKind::Bqx, Pair::Gbpusd), &ctx)
            .unwrap_err();
        assert!(matches!(err, JobError::MissingBaseline(Pair::Gbpusd)));
        assert_eq!(err.kind(), "missing_baseline");
        assert_eq!(store.ensured, 0);
    }

    #[test]
    fn empty_month_is_not_an_error() {
        let (families, baselines) = fixtures();
        let ctx = JobContext::new(&families, &baselines);
        let mut store = store_with_pad(10, 0);

        let outcome = run_partition_job(&mut store, unit(FamilyKind::Bqx, Pair::Eurusd), &ctx)
            .unwrap();
        assert_eq!(outcome, JobOutcome::Empty);
        assert_eq!(outcome.rows_written(), 0);
        assert_eq!(store.ensured, 0);
    }

    #[test]
    fn store_failure_fails_the_unit() {
        let (families, baselines) = fixtures();
        let ctx = JobContext::new(&families, &baselines);
        let mut store = MemoryStore {
            fail_upsert: true,
            ..store_with_pad(5, 10)
        };

        let err = run_partition_job(&mut store, unit(FamilyKind::Bqx, Pair::Eurusd), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
        assert!(store.written.is_empty());
    }

    #[test]
    fn cancellation_and_deadline_are_observed() {
        let (families, baselines) = fixtures();
        let cancel = AtomicBool::new(true);
        let ctx = JobContext::new(&families, &baselines).with_cancel(&cancel);
        let mut store = store_with_pad(5, 10);
        assert!(matches!(
            run_partition_job(&mut store, unit(FamilyKind::Bqx, Pair::Eurusd), &ctx),
            Err(JobError::Interrupted)
        ));

        let ctx = JobContext::new(&families, &baselines).with_timeout(Duration::ZERO);
        assert!(matches!(
            run_partition_job(&mut store, unit(FamilyKind::Bqx, Pair::Eurusd), &ctx),
            Err(JobError::TimedOut { .. })
        ));
        assert!(store.written.is_empty());
    }

    #[test]
    fn unconfigured_family_is_a_config_failure() {
        let (families, baselines) = fixtures();
        let ctx = JobContext::new(&families, &baselines);
        let mut store = store_with_pad(5, 10);
        let err = run_partition_job(&mut store, unit(FamilyKind::Covariance, Pair::Eurusd), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), "config");
        assert_eq!(unit(FamilyKind::Bqx, Pair::Eurusd).to_string(), "bqx/eurusd/2020-03");
    }
}
