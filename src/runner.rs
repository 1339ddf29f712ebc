//! Parallel execution of partition units over a bounded worker pool.
//!
//! Units run in dependency stages. Within a stage, worker threads pull units
//! from a bounded queue; each job holds one pooled connection for its whole
//! read and write. Progress and the failure list share one mutex.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use tracing::{error, warn};

use crate::baseline::BaselineRates;
use crate::calendar::YearMonth;
use crate::family::{FamilyKind, FamilySet};
use crate::job::{
    run_partition_job, JobContext, JobError, JobOutcome, PartitionUnit, DEFAULT_BATCH_SIZE,
};
use crate::observability::{log_job_complete, log_run_start, log_run_summary};
use crate::pairs::Pair;
use crate::pool::ConnectionPool;

const QUEUE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub job_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: DEFAULT_BATCH_SIZE,
            job_timeout: Duration::from_secs(1_800),
            grace_period: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Empty,
    Failed,
    Incomplete,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Empty => "empty",
            Self::Failed => "failed",
            Self::Incomplete => "incomplete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub unit: PartitionUnit,
    pub status: JobStatus,
    pub rows_written: usize,
    pub batches: usize,
    pub elapsed_seconds: f64,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub unit: PartitionUnit,
    pub kind: &'static str,
    pub message: String,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub empty: usize,
    pub incomplete: usize,
    pub not_started: usize,
    pub rows_total: usize,
    pub elapsed_total_seconds: f64,
    pub interrupted: bool,
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.incomplete == 0 && self.not_started == 0 && !self.interrupted
    }
}

/// Hooks for an integration layer. Each unit gets exactly one start and one
/// completion call; the run gets one completion call.
pub trait RunObserver: Send + Sync {
    fn on_job_start(&self, _unit: &PartitionUnit) {}
    fn on_job_complete(&self, _unit: &PartitionUnit, _report: &JobReport) {}
    fn on_run_complete(&self, _summary: &RunSummary) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Every `(family, pair, month)` unit, stage-major, then pair, then month.
pub fn plan_units(
    kinds: &[FamilyKind],
    pairs: &[Pair],
    months: &[YearMonth],
) -> Vec<PartitionUnit> {
    let mut kinds = kinds.to_vec();
    kinds.sort_by_key(|kind| (kind.stage(), *kind));
    kinds.dedup();

    let mut units = Vec::with_capacity(kinds.len() * pairs.len() * months.len());
    for family in kinds {
        for pair in pairs {
            for month in months {
                units.push(PartitionUnit {
                    family,
                    pair: *pair,
                    month: *month,
                });
            }
        }
    }
    units
}

#[derive(Default)]
struct Progress {
    completed: usize,
    failed: usize,
    empty: usize,
    incomplete: usize,
    rows_written: usize,
    failures: Vec<FailureRecord>,
    in_flight: HashMap<PartitionUnit, Instant>,
    closed: bool,
}

impl Progress {
    fn done(&self) -> usize {
        self.completed + self.failed + self.empty + self.incomplete
    }
}

struct Shared {
    pool: Arc<ConnectionPool>,
    families: Arc<FamilySet>,
    baselines: Arc<BaselineRates>,
    observer: Arc<dyn RunObserver>,
    cancel: Arc<AtomicBool>,
    config: RunnerConfig,
    total: usize,
    progress: Mutex<Progress>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

pub struct Runner {
    pool: Arc<ConnectionPool>,
    families: Arc<FamilySet>,
    baselines: Arc<BaselineRates>,
    config: RunnerConfig,
    observer: Arc<dyn RunObserver>,
    cancel: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(
        pool: Arc<ConnectionPool>,
        families: Arc<FamilySet>,
        baselines: Arc<BaselineRates>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pool,
            families,
            baselines,
            config,
            observer: Arc::new(NoopObserver),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Setting the flag drains the run: no new units start, in-flight units finish.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Configured workers, capped by the connection budget.
    pub fn effective_workers(&self) -> usize {
        let requested = self.config.workers.max(1);
        let budget = self.pool.size();
        if requested > budget {
            warn!(
                component = "runner",
                event = "run.workers_clamped",
                requested,
                max_connections = budget
            );
            budget
        } else {
            requested
        }
    }

    pub fn run(&self, kinds: &[FamilyKind], pairs: &[Pair], months: &[YearMonth]) -> RunSummary {
        self.run_units(plan_units(kinds, pairs, months))
    }

    pub fn run_units(&self, units: Vec<PartitionUnit>) -> RunSummary {
        let started = Instant::now();
        let workers = self.effective_workers();
        let shared = Arc::new(Shared {
            pool: Arc::clone(&self.pool),
            families: Arc::clone(&self.families),
            baselines: Arc::clone(&self.baselines),
            observer: Arc::clone(&self.observer),
            cancel: Arc::clone(&self.cancel),
            config: self.config,
            total: units.len(),
            progress: Mutex::new(Progress::default()),
        });

        let mut stages: BTreeMap<usize, Vec<PartitionUnit>> = BTreeMap::new();
        for unit in units {
            stages.entry(unit.family.stage()).or_default().push(unit);
        }
        log_run_start(shared.total, stages.len(), workers, &self.config);

        for (stage, stage_units) in stages {
            if shared.cancelled() {
                break;
            }
            if !run_stage(&shared, stage, stage_units, workers) {
                break;
            }
        }

        let summary = finish(&shared, started);
        log_run_summary(&summary);
        shared.observer.on_run_complete(&summary);
        summary
    }
}

/// Returns false when in-flight units were abandoned after the grace period.
fn run_stage(
    shared: &Arc<Shared>,
    stage: usize,
    units: Vec<PartitionUnit>,
    workers: usize,
) -> bool {
    let (unit_tx, unit_rx) = bounded::<PartitionUnit>(workers * 2);
    let (done_tx, done_rx) = unbounded::<()>();

    let mut spawned = 0usize;
    for worker in 0..workers {
        let shared = Arc::clone(shared);
        let unit_rx = unit_rx.clone();
        let done_tx = done_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("bqx-worker-{stage}-{worker}"))
            .spawn(move || worker_loop(&shared, &unit_rx, &done_tx));
        match handle {
            Ok(_) => spawned += 1,
            Err(err) => error!(
                component = "runner",
                event = "run.worker_spawn_failed",
                stage,
                worker,
                error = %err
            ),
        }
    }
    drop(unit_rx);
    drop(done_tx);

    for unit in units {
        if !enqueue(&unit_tx, unit, &shared.cancel) {
            break;
        }
    }
    drop(unit_tx);

    wait_for_workers(shared, &done_rx, spawned)
}

fn enqueue(tx: &Sender<PartitionUnit>, mut unit: PartitionUnit, cancel: &AtomicBool) -> bool {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        match tx.send_timeout(unit, QUEUE_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => unit = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn wait_for_workers(shared: &Shared, done_rx: &Receiver<()>, workers: usize) -> bool {
    let mut finished = 0usize;
    let mut grace_deadline: Option<Instant> = None;
    while finished < workers {
        match done_rx.recv_timeout(QUEUE_POLL) {
            Ok(()) => finished += 1,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !shared.cancelled() {
                    continue;
                }
                let deadline = *grace_deadline.get_or_insert_with(|| {
                    warn!(
                        component = "runner",
                        event = "run.draining",
                        in_flight = shared.progress().in_flight.len(),
                        grace_period_secs = shared.config.grace_period.as_secs()
                    );
                    Instant::now() + shared.config.grace_period
                });
                if Instant::now() >= deadline {
                    return false;
                }
            }
        }
    }
    true
}

fn worker_loop(shared: &Shared, units: &Receiver<PartitionUnit>, done: &Sender<()>) {
    while !shared.cancelled() {
        let Ok(unit) = units.recv() else {
            break;
        };
        if shared.cancelled() {
            break;
        }
        run_one(shared, unit);
    }
    let _ = done.send(());
}

fn run_one(shared: &Shared, unit: PartitionUnit) {
    let started = Instant::now();
    {
        let mut progress = shared.progress();
        if progress.closed {
            return;
        }
        progress.in_flight.insert(unit, started);
    }
    shared.observer.on_job_start(&unit);

    let result = run_guarded(|| {
        let mut store = shared.pool.acquire()?;
        let ctx = JobContext::new(&shared.families, &shared.baselines)
            .with_batch_size(shared.config.batch_size)
            .with_timeout(shared.config.job_timeout)
            .with_cancel(&shared.cancel);
        run_partition_job(&mut *store, unit, &ctx)
    });
    let report = job_report(unit, result, started.elapsed().as_secs_f64());

    let (done, recorded) = {
        let mut progress = shared.progress();
        if progress.closed {
            (progress.done(), false)
        } else {
            progress.in_flight.remove(&unit);
            match report.status {
                JobStatus::Completed => progress.completed += 1,
                JobStatus::Empty => progress.empty += 1,
                JobStatus::Incomplete => progress.incomplete += 1,
                JobStatus::Failed => {
                    progress.failed += 1;
                    progress.failures.push(FailureRecord {
                        unit,
                        kind: report.error_kind.unwrap_or("unknown"),
                        message: report.error.clone().unwrap_or_default(),
                        elapsed_seconds: report.elapsed_seconds,
                    });
                }
            }
            progress.rows_written += report.rows_written;
            (progress.done(), true)
        }
    };

    if recorded {
        log_job_complete(&report, done, shared.total);
        shared.observer.on_job_complete(&unit, &report);
    }
}

/// A panic inside a job fails that unit only; the worker keeps pulling units.
fn run_guarded<F>(job: F) -> Result<JobOutcome, JobError>
where
    F: FnOnce() -> Result<JobOutcome, JobError>,
{
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Err(JobError::Panicked(message))
    })
}

fn job_report(
    unit: PartitionUnit,
    result: Result<JobOutcome, JobError>,
    elapsed_seconds: f64,
) -> JobReport {
    let mut report = JobReport {
        unit,
        status: JobStatus::Completed,
        rows_written: 0,
        batches: 0,
        elapsed_seconds,
        error_kind: None,
        error: None,
    };
    match result {
        Ok(JobOutcome::Written { rows, batches }) => {
            report.rows_written = rows;
            report.batches = batches;
        }
        Ok(JobOutcome::Empty) => report.status = JobStatus::Empty,
        Err(err) => {
            report.status = if matches!(err, JobError::Interrupted) {
                JobStatus::Incomplete
            } else {
                JobStatus::Failed
            };
            report.error_kind = Some(err.kind());
            report.error = Some(err.to_string());
        }
    }
    report
}

/// Closes the progress record; units still in flight become incomplete.
fn finish(shared: &Shared, started: Instant) -> RunSummary {
    let (mut summary, leftovers) = {
        let mut progress = shared.progress();
        progress.closed = true;
        let leftovers: Vec<(PartitionUnit, Instant)> = progress.in_flight.drain().collect();
        progress.incomplete += leftovers.len();
        let summary = RunSummary {
            total: shared.total,
            completed: progress.completed,
            failed: progress.failed,
            empty: progress.empty,
            incomplete: progress.incomplete,
            not_started: shared.total.saturating_sub(progress.done()),
            rows_total: progress.rows_written,
            elapsed_total_seconds: 0.0,
            interrupted: shared.cancelled(),
            failures: progress.failures.clone(),
        };
        (summary, leftovers)
    };

    for (unit, unit_started) in leftovers {
        let report = JobReport {
            unit,
            status: JobStatus::Incomplete,
            rows_written: 0,
            batches: 0,
            elapsed_seconds: unit_started.elapsed().as_secs_f64(),
            error_kind: Some("incomplete"),
            error: Some("still running when the grace period expired".to_string()),
        };
        log_job_complete(&report, shared.total - summary.not_started, shared.total);
        shared.observer.on_job_complete(&unit, &report);
    }

    summary.failures.sort_by_key(|failure| failure.unit);
    summary.elapsed_total_seconds = started.elapsed().as_secs_f64();
    summary
}

/// Flips `cancel` on the first Ctrl-C. The listener runs on its own thread.
pub fn spawn_interrupt_listener(cancel: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("bqx-interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        cancel.store(true, Ordering::SeqCst);
                        warn!(component = "runner", event = "run.interrupt_received");
                    }
                    Err(err) => warn!(
                        component = "runner",
                        event = "run.interrupt_listener_failed",
                        error = %err
                    ),
                }
            });
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_stage_then_pair_then_month() {
        let jan = YearMonth::new(2020, 1).unwrap();
        let units = plan_units(
            &[FamilyKind::Covariance, FamilyKind::Regression, FamilyKind::Covariance],
            &[Pair::Eurusd, Pair::Usdjpy],
            &[jan, jan.next()],
        );

        assert_eq!(units.len(), 8);
        assert!(units[..4].iter().all(|u| u.family == FamilyKind::Regression));
        assert!(units[4..].iter().all(|u| u.family == FamilyKind::Covariance));
        assert_eq!(units[1].pair, Pair::Eurusd);
        assert_eq!(units[1].month, jan.next());
        assert_eq!(units[2].pair, Pair::Usdjpy);
    }

    #[test]
    fn interrupted_jobs_are_incomplete_not_failed() {
        let unit = PartitionUnit {
            family: FamilyKind::Bqx,
            pair: Pair::Eurusd,
            month: YearMonth::new(2020, 1).unwrap(),
        };
        let report = job_report(unit, Err(JobError::Interrupted), 0.5);
        assert_eq!(report.status, JobStatus::Incomplete);

        let report = job_report(unit, Err(JobError::MissingBaseline(Pair::Eurusd)), 0.5);
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some("missing_baseline"));

        let report = job_report(unit, Ok(JobOutcome::Written { rows: 7, batches: 1 }), 0.5);
        assert_eq!((report.status, report.rows_written), (JobStatus::Completed, 7));
    }

    #[test]
    fn a_panicking_job_becomes_a_kernel_failure() {
        let unit = PartitionUnit {
            family: FamilyKind::Regression,
            pair: Pair::Gbpjpy,
            month: YearMonth::new(2021, 3).unwrap(),
        };
        let result = run_guarded(|| panic!("window slice out of range"));
        let report = job_report(unit, result, 0.1);

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some("kernel"));
        assert!(report.error.unwrap().contains("window slice out of range"));

        let formatted = run_guarded(|| panic!("bad window {}", 7));
        assert!(matches!(formatted, Err(JobError::Panicked(message)) if message == "bad window 7"));
        assert_eq!(run_guarded(|| Ok(JobOutcome::Empty)).unwrap(), JobOutcome::Empty);
    }

    #[test]
    fn summary_success_requires_a_clean_finish() {
        let mut summary = RunSummary {
            total: 2,
            completed: 2,
            ..RunSummary::default()
        };
        assert!(summary.is_success());
        summary.interrupted = true;
        assert!(!summary.is_success());
    }
}
