use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use bqx_backfill::{
    failure_table, init_baseline_rates, init_logging, log_app_start, logging_config_from_env,
    parse_family_list, parse_pair_list, spawn_interrupt_listener, summary_line, validate,
    validation_text, write_run_csv_file, write_validation_csv_file, BackfillConfig,
    BaselineRates, ConfigError, ConfigOverrides, ConnectionPool, ReportCollector, Runner,
    SqliteStore, YearMonth,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, warn};

const EXIT_FAILURES: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Batch backfill of rolling-window forex features into monthly partitions
#[derive(Parser, Debug)]
#[command(name = "bqx-backfill")]
#[command(about = "Backfill BQX, regression and covariance features per pair and month")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "BQX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "BQX_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Comma-separated families: bqx, reg, cov
    #[arg(long, env = "BQX_FAMILIES", global = true)]
    families: Option<String>,

    /// Comma-separated pairs, or `all`
    #[arg(long, env = "BQX_PAIRS", global = true)]
    pairs: Option<String>,

    /// First month, YYYY-MM
    #[arg(long, env = "BQX_START_MONTH", global = true)]
    start_month: Option<YearMonth>,

    /// Last month (inclusive), YYYY-MM
    #[arg(long, env = "BQX_END_MONTH", global = true)]
    end_month: Option<YearMonth>,

    /// Worker threads
    #[arg(long, env = "BQX_WORKERS", global = true)]
    workers: Option<usize>,

    /// Store connection budget
    #[arg(long, env = "BQX_MAX_CONNECTIONS", global = true)]
    max_connections: Option<usize>,

    /// Rows per upsert batch
    #[arg(long, env = "BQX_BATCH_SIZE", global = true)]
    batch_size: Option<usize>,

    /// Per-job soft timeout in seconds
    #[arg(long, env = "BQX_JOB_TIMEOUT_SECS", global = true)]
    job_timeout_secs: Option<u64>,

    /// Seconds to wait for in-flight jobs after an interrupt
    #[arg(long, env = "BQX_GRACE_PERIOD_SECS", global = true)]
    grace_period_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record missing per-pair baseline rates from the first bar of a date
    Baseline {
        /// Baseline date, YYYY-MM-DD
        #[arg(long, env = "BQX_BASELINE_DATE")]
        date: Option<NaiveDate>,
    },
    /// Compute and write every configured partition
    Run {
        /// Write one CSV row per partition job
        #[arg(long)]
        report_csv: Option<PathBuf>,
    },
    /// Check the produced partitions
    Validate {
        /// Write one CSV row per check offender
        #[arg(long)]
        report_csv: Option<PathBuf>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Baseline { .. } => "baseline",
            Self::Run { .. } => "run",
            Self::Validate { .. } => "validate",
        }
    }
}

impl Cli {
    fn overrides(&self) -> Result<ConfigOverrides, ConfigError> {
        Ok(ConfigOverrides {
            database: self.database.clone(),
            families: self.families.as_deref().map(parse_family_list).transpose()?,
            pairs: self.pairs.as_deref().map(parse_pair_list).transpose()?,
            start_month: self.start_month,
            end_month: self.end_month,
            workers: self.workers,
            max_connections: self.max_connections,
            batch_size: self.batch_size,
            job_timeout_secs: self.job_timeout_secs,
            grace_period_secs: self.grace_period_secs,
            acquire_timeout_secs: None,
            baseline_date: match &self.command {
                Command::Baseline { date } => *date,
                _ => None,
            },
        })
    }

    fn load_config(&self) -> Result<BackfillConfig, ConfigError> {
        let overrides = self.overrides()?;
        match self.command {
            // Baseline initialization needs no family list.
            Command::Baseline { .. } => BackfillConfig::resolve(self.config.as_deref(), overrides),
            _ => BackfillConfig::load(self.config.as_deref(), overrides),
        }
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(cli.command.name(), &logging_cfg);

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(err) => {
            error!(component = "bqx_backfill", event = "config.invalid", error = %err);
            eprintln!("configuration error: {err}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    match &cli.command {
        Command::Baseline { .. } => baseline(&config),
        Command::Run { report_csv } => run(&config, report_csv.as_deref()),
        Command::Validate { report_csv } => validate_partitions(&config, report_csv.as_deref()),
    }
}

fn baseline(config: &BackfillConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut store = SqliteStore::open(&config.store_config())?;
    let report = init_baseline_rates(&mut store, &config.pairs, config.baseline_date)?;

    println!(
        "baseline {} | inserted={} existing={} missing_source={}",
        config.baseline_date,
        report.inserted.len(),
        report.existing.len(),
        report.missing_source.len()
    );
    if report.missing_source.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    let missing: Vec<&str> = report.missing_source.iter().map(|pair| pair.as_str()).collect();
    println!("no source bars on {} for: {}", config.baseline_date, missing.join(", "));
    Ok(ExitCode::from(EXIT_FAILURES))
}

fn run(
    config: &BackfillConfig,
    report_csv: Option<&Path>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let families = Arc::new(config.family_set()?);
    let months = config.months()?;
    let store_config = config.store_config();

    let baselines = {
        let mut store = SqliteStore::open(&store_config)?;
        BaselineRates::load(&mut store)?
    };
    let pool = Arc::new(ConnectionPool::open(
        &store_config,
        config.max_connections,
        config.acquire_timeout(),
    )?);

    let collector = Arc::new(ReportCollector::new());
    let runner = Runner::new(pool, families, Arc::new(baselines), config.runner_config())
        .with_observer(collector.clone());
    if let Err(err) = spawn_interrupt_listener(runner.cancel_flag()) {
        warn!(component = "bqx_backfill", event = "app.interrupt_unavailable", error = %err);
    }

    let summary = runner.run(&config.families, &config.pairs, &months);

    if let Some(path) = report_csv {
        write_run_csv_file(path, &collector.reports())?;
    }
    if !summary.failures.is_empty() {
        print!("{}", failure_table(&summary));
    }
    println!("{}", summary_line(&summary));

    if summary.interrupted {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURES))
    }
}

fn validate_partitions(
    config: &BackfillConfig,
    report_csv: Option<&Path>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let families = config.family_set()?;
    let months = config.months()?;
    let mut store = SqliteStore::open(&config.store_config())?;

    let report = validate(
        &mut store,
        &families,
        &config.families,
        &config.pairs,
        &months,
        &config.validator_config(),
    )?;

    if let Some(path) = report_csv {
        write_validation_csv_file(path, &report)?;
    }
    print!("{}", validation_text(&report));

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURES))
    }
}
