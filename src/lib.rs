//! BQX backfill core crate.
//!
//! Computes per-minute rolling-window feature families for 28 forex pairs
//! over monthly partitions:
//! - rate index normalization against a fixed per-pair baseline
//! - `bqx` retrospective aggregates, `reg` quadratic regression, `cov` term covariances
//! - a parallel partition runner with idempotent keyed writes
//! - a read-only validator over the produced partitions

mod baseline;
mod bqx;
mod calendar;
mod config;
mod covariance;
mod family;
mod job;
mod observability;
mod pairs;
mod pool;
mod regression;
mod report;
mod runner;
mod store;
mod validate;
mod window;

pub use baseline::{
    init_baseline_rates, rate_index, BaselineError, BaselineInitReport, BaselineRate,
    BaselineRates,
};
pub use bqx::{bqx_window, BQX_FEATURES};
pub use calendar::{
    day_start_ms, month_range, months_overlapping, CalendarError, YearMonth, MINUTE_MS,
};
pub use config::{
    parse_date, parse_family_list, parse_pair_list, BackfillConfig, ConfigError,
    ConfigOverrides, WindowConfig,
};
pub use covariance::{covariance_window, COVARIANCE_FEATURES, COVARIANCE_TERMS};
pub use family::{
    assert_schema_compatible, parse_family_kind, FamilyError, FamilyInput, FamilyKind, FamilySet,
    FeatureColumn, FeatureDType, FeatureFamily, FeatureSchema, ALL_FAMILIES, DEFAULT_WINDOWS,
    FEATURE_SCHEMA_VERSION, RATE_INDEX_COLUMN,
};
pub use job::{
    run_partition_job, JobContext, JobError, JobOutcome, PartitionUnit, DEFAULT_BATCH_SIZE,
};
pub use observability::{
    init_logging, log_app_start, log_job_complete, log_run_start, log_run_summary,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pairs::{parse_pair, Pair, PairError, ALL_PAIRS};
pub use pool::{ConnectionPool, PooledStore};
pub use regression::{regression_window, REGRESSION_FEATURES};
pub use report::{
    failure_table, summary_line, validation_text, write_run_csv, write_run_csv_file,
    write_validation_csv, write_validation_csv_file, ReportCollector, ReportError,
};
pub use runner::{
    plan_units, spawn_interrupt_listener, FailureRecord, JobReport, JobStatus, NoopObserver,
    RunObserver, RunSummary, Runner, RunnerConfig,
};
pub use store::{
    decode_f64, retry, source_table, FeatureRow, FeatureStore, RetryPolicy, SeriesFrame,
    SeriesSource, SourceBar, SourceColumn, SqliteStore, StoreConfig, StoreError, UnmatchedTs,
    DEFAULT_DATABASE_PATH,
};
pub use validate::{
    validate, CheckResult, CheckStatus, Offender, ValidateError, ValidationReport,
    ValidatorConfig, CHECK_CRITICAL_NON_NULL, CHECK_CROSS_FAMILY_ALIGNMENT,
    CHECK_PARTITION_COVERAGE, CHECK_ROW_COUNT_SANITY, CHECK_SCHEMA_CONSISTENCY,
    CHECK_TERM_IDENTITY, CHECK_TS_WITHIN_MONTH,
};
pub use window::{KernelError, KernelOutput, NullableSeries};
