//! Logging configuration, initialization and the structured run events.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use std::env;

use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::runner::{JobReport, JobStatus, RunSummary, RunnerConfig};

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
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("BQX_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("BQX_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("BQX_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_writer(std::io::stderr)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(command: &str, config: &LoggingConfig) {
    info!(
        component = "bqx_backfill",
        event = "app.start",
        command,
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_run_start(units: usize, stages: usize, workers: usize, config: &RunnerConfig) {
    info!(
        component = "runner",
        event = "run.start",
        units,
        stages,
        workers,
        batch_size = config.batch_size,
        job_timeout_secs = config.job_timeout.as_secs(),
        grace_period_secs = config.grace_period.as_secs()
    );
}

/// One line per finished unit.
pub fn log_job_complete(report: &JobReport, done: usize, total: usize) {
    let unit = &report.unit;
    match report.status {
        JobStatus::Completed | JobStatus::Empty => info!(
            component = "runner",
            event = "job.complete",
            status = report.status.as_str(),
            family = unit.family.as_str(),
            pair = unit.pair.as_str(),
            year = unit.month.year,
            month = unit.month.month,
            rows_written = report.rows_written,
            batches = report.batches,
            elapsed_seconds = report.elapsed_seconds,
            progress = %format_args!("{done}/{total}")
        ),
        JobStatus::Failed => error!(
            component = "runner",
            event = "job.complete",
            status = report.status.as_str(),
            family = unit.family.as_str(),
            pair = unit.pair.as_str(),
            year = unit.month.year,
            month = unit.month.month,
            rows_written = report.rows_written,
            elapsed_seconds = report.elapsed_seconds,
            error_kind = report.error_kind.unwrap_or("unknown"),
            error = report.error.as_deref().unwrap_or(""),
            progress = %format_args!("{done}/{total}")
        ),
        JobStatus::Incomplete => warn!(
            component = "runner",
            event = "job.complete",
            status = report.status.as_str(),
            family = unit.family.as_str(),
            pair = unit.pair.as_str(),
            year = unit.month.year,
            month = unit.month.month,
            rows_written = report.rows_written,
            elapsed_seconds = report.elapsed_seconds,
            progress = %format_args!("{done}/{total}")
        ),
    }
}

pub fn log_run_summary(summary: &RunSummary) {
    info!(
        component = "runner",
        event = "run.summary",
        completed = summary.completed,
        failed = summary.failed,
        empty = summary.empty,
        incomplete = summary.incomplete,
        not_started = summary.not_started,
        rows_total = summary.rows_total,
        elapsed_total_seconds = summary.elapsed_total_seconds,
        interrupted = summary.interrupted
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
