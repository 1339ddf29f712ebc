//! Backfill configuration: defaults, JSON file, and flag/env overrides.
//!
//! Precedence is override > file > default. Everything has a default except
//! the family list, which must be named explicitly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::{month_range, CalendarError, YearMonth};
use crate::family::{
    parse_family_kind, FamilyError, FamilyInput, FamilyKind, FamilySet, FeatureFamily,
    DEFAULT_WINDOWS,
};
use crate::pairs::{parse_pair, Pair, PairError, ALL_PAIRS};
use crate::runner::RunnerConfig;
use crate::store::{StoreConfig, DEFAULT_DATABASE_PATH};
use crate::validate::ValidatorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no feature families configured; pass --families or set BQX_FAMILIES")]
    MissingFamilies,
    #[error("no pairs configured")]
    MissingPairs,
    #[error("cannot read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: u64,
        value: u64,
    },
    #[error("min_row_ratio must be in (0, 1], got {0}")]
    RowRatio(f64),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error(transparent)]
    Family(#[from] FamilyError),
    #[error(transparent)]
    Pair(#[from] PairError),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

/// Per-family window lists; `None` keeps the default set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub bqx: Option<Vec<usize>>,
    pub reg: Option<Vec<usize>>,
    pub cov: Option<Vec<usize>>,
}

impl WindowConfig {
    pub fn for_family(&self, kind: FamilyKind) -> &[usize] {
        let configured = match kind {
            FamilyKind::Bqx => self.bqx.as_deref(),
            FamilyKind::Regression => self.reg.as_deref(),
            FamilyKind::Covariance => self.cov.as_deref(),
        };
        configured.unwrap_or(&DEFAULT_WINDOWS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackfillConfig {
    pub database: PathBuf,
    pub families: Vec<FamilyKind>,
    pub pairs: Vec<Pair>,
    pub start_month: YearMonth,
    pub end_month: YearMonth,
    pub workers: usize,
    pub max_connections: usize,
    pub batch_size: usize,
    pub job_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub acquire_timeout_secs: u64,
    pub store_retries: u32,
    pub retry_backoff_ms: u64,
    pub busy_timeout_ms: u64,
    pub windows: WindowConfig,
    pub baseline_date: NaiveDate,
    pub min_row_ratio: f64,
    pub term_sample_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        let runner = RunnerConfig::default();
        let validator = ValidatorConfig::default();
        Self {
            database: PathBuf::from(DEFAULT_DATABASE_PATH),
            families: Vec::new(),
            pairs: ALL_PAIRS.to_vec(),
            start_month: YearMonth {
                year: 2020,
                month: 1,
            },
            end_month: YearMonth {
                year: 2020,
                month: 12,
            },
            workers: runner.workers,
            max_connections: 8,
            batch_size: runner.batch_size,
            job_timeout_secs: runner.job_timeout.as_secs(),
            grace_period_secs: runner.grace_period.as_secs(),
            acquire_timeout_secs: 60,
            store_retries: store.max_retries,
            retry_backoff_ms: store.retry_backoff_ms,
            busy_timeout_ms: store.busy_timeout_ms,
            windows: WindowConfig::default(),
            baseline_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default(),
            min_row_ratio: validator.min_row_ratio,
            term_sample_size: validator.sample_size,
        }
    }
}

/// Values supplied on the command line or through `BQX_*` variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub database: Option<PathBuf>,
    pub families: Option<Vec<FamilyKind>>,
    pub pairs: Option<Vec<Pair>>,
    pub start_month: Option<YearMonth>,
    pub end_month: Option<YearMonth>,
    pub workers: Option<usize>,
    pub max_connections: Option<usize>,
    pub batch_size: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub baseline_date: Option<NaiveDate>,
}

impl BackfillConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Defaults, then the optional file, then overrides. Not validated.
    pub fn resolve(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let config = Self::resolve(path, overrides)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(database) = overrides.database {
            self.database = database;
        }
        if let Some(families) = overrides.families {
            self.families = families;
        }
        if let Some(pairs) = overrides.pairs {
            self.pairs = pairs;
        }
        if let Some(start_month) = overrides.start_month {
            self.start_month = start_month;
        }
        if let Some(end_month) = overrides.end_month {
            self.end_month = end_month;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(max_connections) = overrides.max_connections {
            self.max_connections = max_connections;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(secs) = overrides.job_timeout_secs {
            self.job_timeout_secs = secs;
        }
        if let Some(secs) = overrides.grace_period_secs {
            self.grace_period_secs = secs;
        }
        if let Some(secs) = overrides.acquire_timeout_secs {
            self.acquire_timeout_secs = secs;
        }
        if let Some(date) = overrides.baseline_date {
            self.baseline_date = date;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.families.is_empty() {
            return Err(ConfigError::MissingFamilies);
        }
        if self.pairs.is_empty() {
            return Err(ConfigError::MissingPairs);
        }
        at_least("workers", self.workers as u64, 1)?;
        at_least("max_connections", self.max_connections as u64, 1)?;
        at_least("batch_size", self.batch_size as u64, 1)?;
        at_least("job_timeout_secs", self.job_timeout_secs, 1)?;
        at_least("acquire_timeout_secs", self.acquire_timeout_secs, 1)?;
        at_least("term_sample_size", self.term_sample_size as u64, 1)?;
        if !(self.min_row_ratio > 0.0 && self.min_row_ratio <= 1.0) {
            return Err(ConfigError::RowRatio(self.min_row_ratio));
        }
        self.months()?;
        self.family_set()?;
        Ok(())
    }

    /// Requested families plus the upstream families they read from.
    pub fn family_set(&self) -> Result<FamilySet, ConfigError> {
        let mut kinds = self.families.clone();
        let mut index = 0;
        while index < kinds.len() {
            if let FamilyInput::Upstream(upstream) = kinds[index].input() {
                if !kinds.contains(&upstream) {
                    kinds.push(upstream);
                }
            }
            index += 1;
        }
        kinds.sort();
        kinds.dedup();

        let families = kinds
            .into_iter()
            .map(|kind| FeatureFamily::new(kind, self.windows.for_family(kind)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FamilySet::new(families)?)
    }

    pub fn months(&self) -> Result<Vec<YearMonth>, ConfigError> {
        Ok(month_range(self.start_month, self.end_month)?)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database.clone(),
            busy_timeout_ms: self.busy_timeout_ms,
            max_retries: self.store_retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            min_row_ratio: self.min_row_ratio,
            sample_size: self.term_sample_size,
            ..ValidatorConfig::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { field, min, value });
    }
    Ok(())
}

/// Comma-separated family names, e.g. `reg,cov`.
pub fn parse_family_list(raw: &str) -> Result<Vec<FamilyKind>, ConfigError> {
    let mut kinds = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        kinds.push(parse_family_kind(part)?);
    }
    if kinds.is_empty() {
        return Err(ConfigError::MissingFamilies);
    }
    Ok(kinds)
}

/// Comma-separated pair codes, or `all`.
pub fn parse_pair_list(raw: &str) -> Result<Vec<Pair>, ConfigError> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(ALL_PAIRS.to_vec());
    }
    let mut pairs = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        pairs.push(parse_pair(part)?);
    }
    if pairs.is_empty() {
        return Err(ConfigError::MissingPairs);
    }
    Ok(pairs)
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn with_families(families: &[FamilyKind]) -> ConfigOverrides {
        ConfigOverrides {
            families: Some(families.to_vec()),
            ..ConfigOverrides::default()
        }
    }

    #[test]
    fn families_are_required() {
        let err = BackfillConfig::load(None, ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFamilies));
    }

    #[test]
    fn defaults_cover_the_full_universe() {
        let config = BackfillConfig::load(None, with_families(&[FamilyKind::Bqx])).unwrap();
        assert_eq!(config.pairs.len(), 28);
        assert_eq!(config.months().unwrap().len(), 12);
        assert_eq!(config.batch_size, 5_000);
        assert_eq!(config.runner_config().job_timeout, Duration::from_secs(1_800));
        assert_eq!(config.store_config().path, PathBuf::from("data/forex.sqlite"));
        assert_eq!(config.baseline_date.to_string(), "2020-01-01");
    }

    #[test]
    fn file_values_yield_to_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "families": ["reg"],
                "pairs": ["eurusd", "gbpusd"],
                "start_month": "2021-03",
                "end_month": "2021-04",
                "workers": 2,
                "windows": {{ "reg": [45, 90] }}
            }}"#
        )
        .unwrap();

        let overrides = ConfigOverrides {
            workers: Some(4),
            ..ConfigOverrides::default()
        };
        let config = BackfillConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.pairs, vec![Pair::Eurusd, Pair::Gbpusd]);
        assert_eq!(config.months().unwrap().len(), 2);
        let families = config.family_set().unwrap();
        assert_eq!(families.get(FamilyKind::Regression).unwrap().windows(), &[45, 90]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(BackfillConfig::from_json(r#"{"familes": ["bqx"]}"#).is_err());
    }

    #[test]
    fn covariance_pulls_in_its_upstream() {
        let config = BackfillConfig::load(None, with_families(&[FamilyKind::Covariance])).unwrap();
        let families = config.family_set().unwrap();
        assert!(families.get(FamilyKind::Regression).is_ok());
        assert!(families.get(FamilyKind::Bqx).is_err());
    }

    #[test]
    fn invalid_ranges_and_sizes_fail_validation() {
        let mut overrides = with_families(&[FamilyKind::Bqx]);
        overrides.start_month = Some("2020-05".parse().unwrap());
        overrides.end_month = Some("2020-01".parse().unwrap());
        assert!(matches!(
            BackfillConfig::load(None, overrides).unwrap_err(),
            ConfigError::Calendar(_)
        ));

        let mut overrides = with_families(&[FamilyKind::Bqx]);
        overrides.batch_size = Some(0);
        assert!(matches!(
            BackfillConfig::load(None, overrides).unwrap_err(),
            ConfigError::TooSmall {
                field: "batch_size",
                ..
            }
        ));
    }

    #[test]
    fn list_parsers() {
        assert_eq!(
            parse_family_list("reg, cov").unwrap(),
            vec![FamilyKind::Regression, FamilyKind::Covariance]
        );
        assert!(parse_family_list(" , ").is_err());
        assert_eq!(parse_pair_list("all").unwrap().len(), 28);
        assert_eq!(parse_pair_list("EURUSD").unwrap(), vec![Pair::Eurusd]);
        assert!(parse_pair_list("eurxyz").is_err());
        assert!(parse_date("2020-13-01").is_err());
    }
}
