//! Read-only post-run checks over the produced partitions.

use thiserror::Error;
use tracing::{info, warn};

use crate::calendar::YearMonth;
use crate::family::{
    assert_schema_compatible, FamilyError, FamilyKind, FamilySet, FeatureFamily, FeatureSchema,
};
use crate::job::PartitionUnit;
use crate::pairs::Pair;
use crate::store::{SqliteStore, StoreError};

pub const CHECK_PARTITION_COVERAGE: &str = "partition_coverage";
pub const CHECK_SCHEMA_CONSISTENCY: &str = "schema_consistency";
pub const CHECK_ROW_COUNT_SANITY: &str = "row_count_sanity";
pub const CHECK_CRITICAL_NON_NULL: &str = "critical_non_null";
pub const CHECK_TERM_IDENTITY: &str = "term_identity";
pub const CHECK_TS_WITHIN_MONTH: &str = "ts_within_month";
pub const CHECK_CROSS_FAMILY_ALIGNMENT: &str = "cross_family_alignment";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorConfig {
    pub min_row_ratio: f64,
    pub sample_size: usize,
    pub tolerance: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_row_ratio: 0.99,
            sample_size: 200,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Family(#[from] FamilyError),
    #[error("nothing to validate: no families, pairs or months configured")]
    EmptyScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offender {
    pub unit: PartitionUnit,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub family: FamilyKind,
    pub check: &'static str,
    pub partitions_checked: usize,
    pub offenders: Vec<Offender>,
}

impl CheckResult {
    fn new(family: FamilyKind, check: &'static str) -> Self {
        Self {
            family,
            check,
            partitions_checked: 0,
            offenders: Vec::new(),
        }
    }

    pub fn status(&self) -> CheckStatus {
        if self.offenders.is_empty() {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        }
    }

    fn offend(&mut self, unit: PartitionUnit, detail: String) {
        self.offenders.push(Offender { unit, detail });
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.status() == CheckStatus::Pass)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|check| check.status() == CheckStatus::Fail)
    }

    pub fn check(&self, family: FamilyKind, name: &str) -> Option<&CheckResult> {
        self.checks
            .iter()
            .find(|check| check.family == family && check.check == name)
    }
}

/// Runs every check for each family in `kinds` over `pairs × months`.
///
/// A month whose source table holds no bars is not expected to have an
/// output partition; it is skipped by every check.
pub fn validate(
    store: &mut SqliteStore,
    families: &FamilySet,
    kinds: &[FamilyKind],
    pairs: &[Pair],
    months: &[YearMonth],
    config: &ValidatorConfig,
) -> Result<ValidationReport, ValidateError> {
    let Some(earliest) = months.iter().min().copied() else {
        return Err(ValidateError::EmptyScope);
    };
    if pairs.is_empty() || kinds.is_empty() {
        return Err(ValidateError::EmptyScope);
    }
    let mut kinds = kinds.to_vec();
    kinds.sort_by_key(|kind| (kind.stage(), *kind));
    kinds.dedup();

    let mut report = ValidationReport::default();
    for kind in kinds {
        let family = families.get(kind)?;
        let edge_depth = families.edge_depth(family.kind)?;
        let checks = validate_family(store, family, edge_depth, pairs, months, earliest, config)?;
        for check in &checks {
            if check.status() == CheckStatus::Pass {
                info!(
                    component = "validate",
                    event = "validate.check",
                    family = family.name(),
                    check = check.check,
                    status = check.status().as_str(),
                    partitions_checked = check.partitions_checked
                );
            } else {
                warn!(
                    component = "validate",
                    event = "validate.check",
                    family = family.name(),
                    check = check.check,
                    status = check.status().as_str(),
                    partitions_checked = check.partitions_checked,
                    offenders = check.offenders.len()
                );
            }
        }
        report.checks.extend(checks);
    }
    Ok(report)
}

fn validate_family(
    store: &mut SqliteStore,
    family: &FeatureFamily,
    edge_depth: usize,
    pairs: &[Pair],
    months: &[YearMonth],
    earliest: YearMonth,
    config: &ValidatorConfig,
) -> Result<Vec<CheckResult>, ValidateError> {
    let kind = family.kind;
    let schema = family.schema();
    let required = family.required_columns();

    let mut coverage = CheckResult::new(kind, CHECK_PARTITION_COVERAGE);
    let mut schema_check = CheckResult::new(kind, CHECK_SCHEMA_CONSISTENCY);
    let mut row_counts = CheckResult::new(kind, CHECK_ROW_COUNT_SANITY);
    let mut non_null = CheckResult::new(kind, CHECK_CRITICAL_NON_NULL);
    let mut terms = CheckResult::new(kind, CHECK_TERM_IDENTITY);
    let mut within_month = CheckResult::new(kind, CHECK_TS_WITHIN_MONTH);
    let mut alignment = CheckResult::new(kind, CHECK_CROSS_FAMILY_ALIGNMENT);

    for pair in pairs {
        for month in months {
            let unit = PartitionUnit {
                family: kind,
                pair: *pair,
                month: *month,
            };
            let source_rows = store.source_row_count(*pair, *month)?;
            if source_rows == 0 {
                continue;
            }

            coverage.partitions_checked += 1;
            if !store.partition_exists(kind, *pair, *month)? {
                coverage.offend(unit, "partition missing".to_string());
                continue;
            }

            schema_check.partitions_checked += 1;
            if let Some(detail) = schema_difference(store, &schema, unit)? {
                schema_check.offend(unit, detail);
            }

            row_counts.partitions_checked += 1;
            let rows = store.partition_row_count(kind, *pair, *month)?;
            let floor = config.min_row_ratio * source_rows as f64;
            if rows == 0 || rows > source_rows || (rows as f64) < floor {
                row_counts.offend(unit, format!("rows={rows} source_rows={source_rows}"));
            }

            non_null.partitions_checked += 1;
            let skip = if *month == earliest { edge_depth } else { 0 };
            let null_rows = store.count_null_rows_after(kind, *pair, *month, &required, skip)?;
            if null_rows > 0 {
                non_null.offend(unit, format!("null_rows={null_rows} after skipping {skip}"));
            }

            if kind == FamilyKind::Regression {
                terms.partitions_checked += 1;
                if let Some(detail) = term_identity_violation(store, family, unit, config)? {
                    terms.offend(unit, detail);
                }
            }

            within_month.partitions_checked += 1;
            if let Some((min_ts, max_ts)) = store.ts_bounds(kind, *pair, *month)? {
                if !month.contains(min_ts) || !month.contains(max_ts) {
                    within_month.offend(
                        unit,
                        format!("ts range [{min_ts}, {max_ts}] leaves {month}"),
                    );
                }
            }

            alignment.partitions_checked += 1;
            let unmatched = store.count_unmatched_ts(kind, *pair, *month)?;
            if unmatched.missing_from_partition > 0 || unmatched.absent_from_source > 0 {
                alignment.offend(
                    unit,
                    format!(
                        "missing_from_partition={} absent_from_source={}",
                        unmatched.missing_from_partition, unmatched.absent_from_source
                    ),
                );
            }
        }
    }

    let mut checks = vec![coverage, schema_check, row_counts, non_null];
    if kind == FamilyKind::Regression {
        checks.push(terms);
    }
    checks.push(within_month);
    checks.push(alignment);
    Ok(checks)
}

fn schema_difference(
    store: &mut SqliteStore,
    schema: &FeatureSchema,
    unit: PartitionUnit,
) -> Result<Option<String>, ValidateError> {
    let mut expected: Vec<(String, String)> = vec![("ts".to_string(), "INTEGER".to_string())];
    expected.extend(
        schema
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.dtype.sql_type().to_string())),
    );
    let mut actual = store.partition_columns(unit.family, unit.pair, unit.month)?;
    for (_, decl) in actual.iter_mut() {
        *decl = decl.to_ascii_uppercase();
    }
    expected.sort();
    actual.sort();

    if expected != actual {
        let missing: Vec<&str> = expected
            .iter()
            .filter(|column| !actual.contains(column))
            .map(|(name, _)| name.as_str())
            .collect();
        let unexpected: Vec<&str> = actual
            .iter()
            .filter(|column| !expected.contains(column))
            .map(|(name, _)| name.as_str())
            .collect();
        return Ok(Some(format!("missing={missing:?} unexpected={unexpected:?}")));
    }

    let Some((version, fingerprint)) =
        store.catalog_schema(unit.family, unit.pair, unit.month)?
    else {
        return Ok(Some("partition missing from the catalog".to_string()));
    };
    Ok(assert_schema_compatible(version, &fingerprint, schema)
        .err()
        .map(|err| format!("catalog {err}")))
}

fn term_identity_violation(
    store: &mut SqliteStore,
    family: &FeatureFamily,
    unit: PartitionUnit,
    config: &ValidatorConfig,
) -> Result<Option<String>, ValidateError> {
    let mut columns = Vec::new();
    for window in family.windows() {
        for feature in ["prediction", "quadratic_term", "linear_term", "constant_term"] {
            columns.push(FeatureFamily::column_name(*window, feature));
        }
    }
    let sample =
        store.sample_rows(unit.family, unit.pair, unit.month, &columns, config.sample_size)?;

    let mut violations = 0usize;
    let mut worst = 0.0f64;
    for row in &sample {
        for group in row.values.chunks(4) {
            if let [Some(prediction), Some(q), Some(l), Some(c)] = group {
                let gap = (prediction - (q + l + c)).abs();
                if gap >= config.tolerance {
                    violations += 1;
                    worst = worst.max(gap);
                }
            }
        }
    }

    Ok((violations > 0).then(|| {
        format!(
            "{violations} of {} sampled rows off by up to {worst:e}",
            sample.len()
        )
    }))
}
