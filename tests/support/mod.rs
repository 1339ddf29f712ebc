#![allow(dead_code)]

use std::path::{Path, PathBuf};

use bqx_backfill::{
    BaselineRate, BaselineRates, FeatureRow, Pair, SourceBar, SqliteStore, StoreConfig,
    YearMonth, MINUTE_MS,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("forex.sqlite");
        Self { dir, path }
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::at(self.path.clone())
    }

    pub fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.config()).expect("store should open")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn month(year: i32, month: u32) -> YearMonth {
    YearMonth::new(year, month).expect("valid month")
}

pub fn bar(ts_ms_utc: i64, rate: f64) -> SourceBar {
    SourceBar {
        ts_ms_utc,
        rate,
        high: rate,
        low: rate,
        open: rate,
        volume: 1.0,
    }
}

/// Minute bars starting at the first minute of `month`.
pub fn bars_from_month_start(month: YearMonth, rates: &[f64]) -> Vec<SourceBar> {
    rates
        .iter()
        .enumerate()
        .map(|(i, rate)| bar(month.start_ms() + i as i64 * MINUTE_MS, *rate))
        .collect()
}

/// A seeded random walk around `start`.
pub fn random_walk(seed: u64, start: f64, len: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut level = start;
    (0..len)
        .map(|_| {
            level *= 1.0 + rng.gen_range(-0.0005..0.0005);
            level
        })
        .collect()
}

pub fn baselines(rates: &[(Pair, f64)]) -> BaselineRates {
    BaselineRates::from_rates(rates.iter().map(|(pair, rate)| BaselineRate {
        pair: *pair,
        baseline_ts_ms: 0,
        rate: *rate,
    }))
    .expect("baselines should be valid")
}

pub fn value(row: &FeatureRow, position: usize) -> f64 {
    row.values[position]
        .unwrap_or_else(|| panic!("column {position} at ts {} is null", row.ts_ms_utc))
}

pub fn assert_close(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() < tolerance,
        "expected {expected}, got {actual} (tolerance {tolerance})"
    );
}
