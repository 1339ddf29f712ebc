//! Feature family descriptors: inputs, windows, columns and schema.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::bqx::{bqx_kernel, BQX_FEATURES};
use crate::calendar::YearMonth;
use crate::covariance::{covariance_kernel, COVARIANCE_FEATURES, COVARIANCE_TERMS};
use crate::pairs::Pair;
use crate::regression::{regression_kernel, REGRESSION_FEATURES};
use crate::window::{KernelError, KernelOutput};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const RATE_INDEX_COLUMN: &str = "rate_index";
pub const DEFAULT_WINDOWS: [usize; 7] = [45, 90, 180, 360, 720, 1440, 2880];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FamilyKind {
    #[serde(rename = "bqx")]
    Bqx,
    #[serde(rename = "reg", alias = "regression")]
    Regression,
    #[serde(rename = "cov", alias = "covariance")]
    Covariance,
}

pub const ALL_FAMILIES: [FamilyKind; 3] = [
    FamilyKind::Bqx,
    FamilyKind::Regression,
    FamilyKind::Covariance,
];

/// Where a family's kernel input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyInput {
    /// Source `rate` normalized by the pair baseline.
    RateIndex,
    /// Output columns of an earlier family.
    Upstream(FamilyKind),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FamilyError {
    #[error("unknown feature family: {0}")]
    UnknownFamily(String),
    #[error("family {family} has no windows configured")]
    NoWindows { family: &'static str },
    #[error("family {family} window {window} is below the minimum of {min}")]
    WindowTooSmall {
        family: &'static str,
        window: usize,
        min: usize,
    },
    #[error("family {family} lists window {window} more than once")]
    DuplicateWindow { family: &'static str, window: usize },
    #[error("family {family} window {window} has no matching {upstream} window")]
    MissingUpstreamWindow {
        family: &'static str,
        upstream: &'static str,
        window: usize,
    },
    #[error("family {0} is configured more than once")]
    DuplicateFamily(&'static str),
    #[error("family {0} is not configured")]
    NotConfigured(&'static str),
    #[error("{family} schema version {recorded} does not match current version {current}")]
    SchemaVersionMismatch {
        family: &'static str,
        recorded: u32,
        current: u32,
    },
    #[error("{family} schema fingerprint {recorded} does not match current {current}")]
    SchemaFingerprintMismatch {
        family: &'static str,
        recorded: String,
        current: String,
    },
}

impl FamilyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bqx => "bqx",
            Self::Regression => "reg",
            Self::Covariance => "cov",
        }
    }

    pub fn features(self) -> &'static [&'static str] {
        match self {
            Self::Bqx => &BQX_FEATURES,
            Self::Regression => &REGRESSION_FEATURES,
            Self::Covariance => &COVARIANCE_FEATURES,
        }
    }

    pub fn input(self) -> FamilyInput {
        match self {
            Self::Bqx | Self::Regression => FamilyInput::RateIndex,
            Self::Covariance => FamilyInput::Upstream(Self::Regression),
        }
    }

    pub fn pass_through(self) -> Option<&'static str> {
        match self {
            Self::Bqx | Self::Regression => Some(RATE_INDEX_COLUMN),
            Self::Covariance => None,
        }
    }

    pub fn min_window(self) -> usize {
        match self {
            Self::Bqx => 1,
            Self::Regression => 3,
            Self::Covariance => 2,
        }
    }

    /// Dependency depth; families run in ascending stage order.
    pub fn stage(self) -> usize {
        match self.input() {
            FamilyInput::RateIndex => 0,
            FamilyInput::Upstream(upstream) => upstream.stage() + 1,
        }
    }

    pub fn parent_table(self, pair: Pair) -> String {
        format!("{}_{}", self.as_str(), pair.as_str())
    }

    pub fn partition_table(self, pair: Pair, month: YearMonth) -> String {
        format!("{}_{}_{}", self.as_str(), pair.as_str(), month.table_suffix())
    }

    pub fn run_kernel(
        self,
        inputs: &[Vec<f64>],
        window: usize,
    ) -> Result<KernelOutput, KernelError> {
        match self {
            Self::Bqx => bqx_kernel(inputs, window),
            Self::Regression => regression_kernel(inputs, window),
            Self::Covariance => covariance_kernel(inputs, window),
        }
    }
}

impl std::fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_family_kind(input: &str) -> Result<FamilyKind, FamilyError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "bqx" => Ok(FamilyKind::Bqx),
        "reg" | "regression" => Ok(FamilyKind::Regression),
        "cov" | "covariance" => Ok(FamilyKind::Covariance),
        other => Err(FamilyError::UnknownFamily(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

impl FeatureDType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::F64 => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

/// Column layout of every partition of one family. `ts` is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub family: FamilyKind,
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFamily {
    pub kind: FamilyKind,
    windows: Vec<usize>,
}

impl FeatureFamily {
    /// Windows are validated against the family minimum and stored ascending.
    pub fn new(kind: FamilyKind, windows: &[usize]) -> Result<Self, FamilyError> {
        if windows.is_empty() {
            return Err(FamilyError::NoWindows {
                family: kind.as_str(),
            });
        }
        let mut seen = HashSet::new();
        for window in windows {
            if *window < kind.min_window() {
                return Err(FamilyError::WindowTooSmall {
                    family: kind.as_str(),
                    window: *window,
                    min: kind.min_window(),
                });
            }
            if !seen.insert(*window) {
                return Err(FamilyError::DuplicateWindow {
                    family: kind.as_str(),
                    window: *window,
                });
            }
        }
        let mut windows = windows.to_vec();
        windows.sort_unstable();
        Ok(Self { kind, windows })
    }

    pub fn with_default_windows(kind: FamilyKind) -> Self {
        Self {
            kind,
            windows: DEFAULT_WINDOWS.to_vec(),
        }
    }

    pub fn windows(&self) -> &[usize] {
        &self.windows
    }

    pub fn max_window(&self) -> usize {
        self.windows.last().copied().unwrap_or(0)
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn column_name(window: usize, feature: &str) -> String {
        format!("w{window}_{feature}")
    }

    /// Pass-through column first, then window-major feature columns.
    pub fn feature_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        if let Some(pass_through) = self.kind.pass_through() {
            columns.push(pass_through.to_string());
        }
        for window in &self.windows {
            for feature in self.kind.features() {
                columns.push(Self::column_name(*window, feature));
            }
        }
        columns
    }

    /// Columns that must be non-null past the edge effect.
    pub fn required_columns(&self) -> Vec<String> {
        self.feature_columns()
    }

    /// Upstream columns one kernel call consumes, in kernel input order.
    pub fn upstream_columns(&self, window: usize) -> Vec<String> {
        match self.kind.input() {
            FamilyInput::RateIndex => Vec::new(),
            FamilyInput::Upstream(_) => COVARIANCE_TERMS
                .iter()
                .map(|term| Self::column_name(window, term))
                .collect(),
        }
    }

    pub fn schema(&self) -> FeatureSchema {
        let columns: Vec<FeatureColumn> = self
            .feature_columns()
            .into_iter()
            .map(|name| FeatureColumn {
                name,
                dtype: FeatureDType::F64,
            })
            .collect();
        let fingerprint = schema_fingerprint(self.kind, &self.windows, &columns);

        debug!(
            component = "family",
            event = "family.schema.built",
            family = self.name(),
            version = FEATURE_SCHEMA_VERSION,
            windows = ?self.windows,
            column_count = columns.len(),
            fingerprint = %fingerprint
        );

        FeatureSchema {
            family: self.kind,
            version: FEATURE_SCHEMA_VERSION,
            fingerprint,
            columns,
        }
    }

    pub fn parent_table(&self, pair: Pair) -> String {
        self.kind.parent_table(pair)
    }

    pub fn partition_table(&self, pair: Pair, month: YearMonth) -> String {
        self.kind.partition_table(pair, month)
    }
}

/// The configured descriptor of every family, consistent across dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilySet {
    families: Vec<FeatureFamily>,
}

impl FamilySet {
    pub fn new(families: Vec<FeatureFamily>) -> Result<Self, FamilyError> {
        let mut seen = HashSet::new();
        for family in &families {
            if !seen.insert(family.kind) {
                return Err(FamilyError::DuplicateFamily(family.name()));
            }
        }
        let set = Self { families };
        for family in &set.families {
            if let FamilyInput::Upstream(upstream_kind) = family.kind.input() {
                let upstream = set.get(upstream_kind)?;
                for window in family.windows() {
                    if !upstream.windows().contains(window) {
                        return Err(FamilyError::MissingUpstreamWindow {
                            family: family.name(),
                            upstream: upstream.name(),
                            window: *window,
                        });
                    }
                }
            }
        }
        Ok(set)
    }

    pub fn with_default_windows() -> Self {
        Self {
            families: ALL_FAMILIES
                .iter()
                .map(|kind| FeatureFamily::with_default_windows(*kind))
                .collect(),
        }
    }

    pub fn get(&self, kind: FamilyKind) -> Result<&FeatureFamily, FamilyError> {
        self.families
            .iter()
            .find(|family| family.kind == kind)
            .ok_or(FamilyError::NotConfigured(kind.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureFamily> {
        self.families.iter()
    }

    /// Leading rows of the earliest month that may legitimately be null.
    pub fn edge_depth(&self, kind: FamilyKind) -> Result<usize, FamilyError> {
        let family = self.get(kind)?;
        let upstream_depth = match kind.input() {
            FamilyInput::RateIndex => 0,
            FamilyInput::Upstream(upstream) => self.edge_depth(upstream)?,
        };
        Ok(upstream_depth + family.max_window())
    }
}

/// Compares the layout recorded for an existing partition with the layout the
/// current family configuration would write.
pub fn assert_schema_compatible(
    recorded_version: u32,
    recorded_fingerprint: &str,
    current: &FeatureSchema,
) -> Result<(), FamilyError> {
    if recorded_version != current.version {
        return Err(FamilyError::SchemaVersionMismatch {
            family: current.family.as_str(),
            recorded: recorded_version,
            current: current.version,
        });
    }
    if recorded_fingerprint != current.fingerprint {
        return Err(FamilyError::SchemaFingerprintMismatch {
            family: current.family.as_str(),
            recorded: recorded_fingerprint.to_string(),
            current: current.fingerprint.clone(),
        });
    }
    Ok(())
}

fn schema_fingerprint(kind: FamilyKind, windows: &[usize], columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("family:{};", kind.as_str()));
    hasher.update("windows:");
    for window in windows {
        hasher.update(format!("{window},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
