//! Per-pair baseline rates and the base-100 rate index.
//!
//! A baseline is written once, from the first bar of the baseline date, and
//! never mutated. After loading, the map is read-only and shared by all jobs.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};

use crate::calendar::day_start_ms;
use crate::pairs::{parse_pair, Pair, PairError};
use crate::store::{SqliteStore, StoreError};

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("stored baseline has unknown pair: {0}")]
    UnknownPair(#[from] PairError),
    #[error("no baseline rate for {0}")]
    Missing(Pair),
    #[error("baseline rate for {pair} must be finite and positive, got {rate}")]
    InvalidRate { pair: Pair, rate: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineRate {
    pub pair: Pair,
    pub baseline_ts_ms: i64,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineRates {
    rates: HashMap<Pair, BaselineRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineInitReport {
    pub inserted: Vec<Pair>,
    pub existing: Vec<Pair>,
    pub missing_source: Vec<Pair>,
}

/// `rate / baseline * 100`; a null (`NaN`) rate stays null.
pub fn rate_index(rate: f64, baseline: f64) -> f64 {
    rate / baseline * 100.0
}

impl BaselineRates {
    pub fn from_rates(
        rates: impl IntoIterator<Item = BaselineRate>,
    ) -> Result<Self, BaselineError> {
        let mut map = HashMap::new();
        for rate in rates {
            validate_rate(rate.pair, rate.rate)?;
            map.insert(rate.pair, rate);
        }
        Ok(Self { rates: map })
    }

    pub fn load(store: &mut SqliteStore) -> Result<Self, BaselineError> {
        let mut rates = Vec::new();
        for (code, baseline_ts_ms, rate) in store.load_baseline_rows()? {
            rates.push(BaselineRate {
                pair: parse_pair(&code)?,
                baseline_ts_ms,
                rate,
            });
        }
        Self::from_rates(rates)
    }

    pub fn get(&self, pair: Pair) -> Option<&BaselineRate> {
        self.rates.get(&pair)
    }

    pub fn rate(&self, pair: Pair) -> Result<f64, BaselineError> {
        self.rates
            .get(&pair)
            .map(|baseline| baseline.rate)
            .ok_or(BaselineError::Missing(pair))
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn index_series(&self, pair: Pair, rates: &[f64]) -> Result<Vec<f64>, BaselineError> {
        let baseline = self.rate(pair)?;
        Ok(rates.iter().map(|rate| rate_index(*rate, baseline)).collect())
    }
}

fn validate_rate(pair: Pair, rate: f64) -> Result<(), BaselineError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(BaselineError::InvalidRate { pair, rate });
    }
    Ok(())
}

/// Records the first bar of `date` as the baseline for every pair that lacks one.
pub fn init_baseline_rates(
    store: &mut SqliteStore,
    pairs: &[Pair],
    date: NaiveDate,
) -> Result<BaselineInitReport, BaselineError> {
    let existing: HashSet<Pair> = BaselineRates::load(store)?.rates.into_keys().collect();
    let day_start = day_start_ms(date);
    let mut report = BaselineInitReport::default();

    for pair in pairs {
        if existing.contains(pair) {
            report.existing.push(*pair);
            continue;
        }

        let Some((ts, rate)) = store.first_bar_between(*pair, day_start, day_start + DAY_MS)? else {
            warn!(
                component = "baseline",
                event = "baseline.source_missing",
                pair = pair.as_str(),
                date = %date
            );
            report.missing_source.push(*pair);
            continue;
        };
        validate_rate(*pair, rate)?;

        if store.insert_baseline(*pair, ts, rate)? {
            info!(
                component = "baseline",
                event = "baseline.initialized",
                pair = pair.as_str(),
                baseline_ts_ms = ts,
                rate
            );
            report.inserted.push(*pair);
        } else {
            report.existing.push(*pair);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MINUTE_MS;
    use crate::store::{SourceBar, StoreConfig};
    use tempfile::tempdir;

    fn bar(ts_ms_utc: i64, rate: f64) -> SourceBar {
        SourceBar {
            ts_ms_utc,
            rate,
            high: rate,
            low: rate,
            open: rate,
            volume: 1.0,
        }
    }

    #[test]
    fn index_is_exactly_100_at_the_baseline() {
        for rate in [1.1, 0.6543, 151.234, 1e-4] {
            assert_eq!(rate_index(rate, rate), 100.0);
        }
        assert!(rate_index(f64::NAN, 1.1).is_nan());

        let rates = BaselineRates::from_rates([BaselineRate {
            pair: Pair::Usdjpy,
            baseline_ts_ms: 0,
            rate: 110.0,
        }])
        .unwrap();
        let index = rates.index_series(Pair::Usdjpy, &[110.0, 121.0]).unwrap();
        assert_eq!(index[0], 100.0);
        assert!((index[1] - 110.0).abs() < 1e-12);
        assert!(matches!(
            rates.index_series(Pair::Eurusd, &[1.0]),
            Err(BaselineError::Missing(Pair::Eurusd))
        ));
    }

    #[test]
    fn non_positive_baselines_are_rejected() {
        let err = BaselineRates::from_rates([BaselineRate {
            pair: Pair::Eurgbp,
            baseline_ts_ms: 0,
            rate: 0.0,
        }]);
        assert!(matches!(err, Err(BaselineError::InvalidRate { .. })));
    }

    #[test]
    fn init_uses_first_bar_of_the_day_and_never_overwrites() {
        let dir = tempdir().unwrap();
        let mut store = SqliteStore::open(&StoreConfig::at(dir.path().join("b.sqlite"))).unwrap();
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let day = day_start_ms(date);
        store
            .ingest_source_bars(
                Pair::Eurusd,
                &[
                    bar(day - MINUTE_MS, 1.0),
                    bar(day + 5 * MINUTE_MS, 1.12),
                    bar(day + 6 * MINUTE_MS, 1.13),
                ],
            )
            .unwrap();

        let report = init_baseline_rates(&mut store, &[Pair::Eurusd, Pair::Gbpusd], date).unwrap();
        assert_eq!(report.inserted, vec![Pair::Eurusd]);
        assert_eq!(report.missing_source, vec![Pair::Gbpusd]);

        store
            .ingest_source_bars(Pair::Eurusd, &[bar(day + MINUTE_MS, 9.0)])
            .unwrap();
        let again = init_baseline_rates(&mut store, &[Pair::Eurusd], date).unwrap();
        assert_eq!(again.existing, vec![Pair::Eurusd]);

        let rates = BaselineRates::load(&mut store).unwrap();
        let eurusd = rates.get(Pair::Eurusd).unwrap();
        assert_eq!(eurusd.rate, 1.12);
        assert_eq!(eurusd.baseline_ts_ms, day + 5 * MINUTE_MS);
        assert_eq!(rates.len(), 1);
    }
}
