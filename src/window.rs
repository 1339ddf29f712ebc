//! Contract shared by the rolling-window kernels.
//!
//! Kernels take dense `f64` inputs (a null input is `NaN`) and return one
//! nullable column per feature, the same length as the input. Index `i` reads
//! the past slice `series[i - window..i]`, so indices below `window` are null.

use thiserror::Error;

pub type NullableSeries = Vec<Option<f64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct KernelOutput {
    pub window: usize,
    pub columns: Vec<(&'static str, NullableSeries)>,
}

impl KernelOutput {
    pub fn with_features(window: usize, features: &[&'static str], len: usize) -> Self {
        Self {
            window,
            columns: features
                .iter()
                .map(|feature| (*feature, vec![None; len]))
                .collect(),
        }
    }

    pub fn column(&self, feature: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|(name, _)| *name == feature)
            .map(|(_, values)| values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.columns.first().map(|(_, v)| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes one row; values are coerced so that non-finite becomes null.
    pub(crate) fn set_row(&mut self, index: usize, values: &[f64]) {
        for ((_, column), value) in self.columns.iter_mut().zip(values) {
            column[index] = finite(*value);
        }
    }

    /// Fails if any value escaped coercion.
    pub fn ensure_finite(&self) -> Result<(), KernelError> {
        for (feature, column) in &self.columns {
            if let Some(index) = column
                .iter()
                .position(|v| matches!(v, Some(x) if !x.is_finite()))
            {
                return Err(KernelError::NonFinite {
                    feature: (*feature).to_string(),
                    index,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    #[error("window must be >= {min}, got {window}")]
    InvalidWindow { window: usize, min: usize },
    #[error("kernel expects {expected} input series, got {found}")]
    InputArity { expected: usize, found: usize },
    #[error("input series length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("non-finite value in feature {feature} at index {index}")]
    NonFinite { feature: String, index: usize },
}

pub fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

pub fn check_window(window: usize, min: usize) -> Result<(), KernelError> {
    if window < min.max(1) {
        return Err(KernelError::InvalidWindow {
            window,
            min: min.max(1),
        });
    }
    Ok(())
}

pub fn check_arity(inputs: &[Vec<f64>], expected: usize) -> Result<usize, KernelError> {
    if inputs.len() != expected {
        return Err(KernelError::InputArity {
            expected,
            found: inputs.len(),
        });
    }
    let len = inputs.first().map(Vec::len).unwrap_or(0);
    for series in inputs {
        if series.len() != len {
            return Err(KernelError::LengthMismatch {
                expected: len,
                found: series.len(),
            });
        }
    }
    Ok(len)
}

pub fn all_finite(slice: &[f64]) -> bool {
    slice.iter().all(|v| v.is_finite())
}

pub fn mean(slice: &[f64]) -> f64 {
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Sample covariance with divisor `n - 1`; zero for a single observation.
pub fn sample_covariance(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a = mean(&a[..n]);
    let mean_b = mean(&b[..n]);
    let cross = a[..n]
        .iter()
        .zip(&b[..n])
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>();
    cross / (n - 1) as f64
}

pub fn sample_std(slice: &[f64]) -> f64 {
    sample_covariance(slice, slice).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_coerces_nan_and_infinities() {
        assert_eq!(finite(1.5), Some(1.5));
        assert_eq!(finite(f64::NAN), None);
        assert_eq!(finite(f64::INFINITY), None);
        assert_eq!(finite(f64::NEG_INFINITY), None);
    }

    #[test]
    fn sample_statistics_use_n_minus_one() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let expected_var = 32.0 / 7.0;
        assert!((sample_covariance(&values, &values) - expected_var).abs() < 1e-12);
        assert!((sample_std(&values) - expected_var.sqrt()).abs() < 1e-12);
        assert_eq!(sample_std(&[3.0]), 0.0);
    }

    #[test]
    fn set_row_coerces_and_ensure_finite_flags_leaks() {
        let mut out = KernelOutput::with_features(2, &["x", "y"], 3);
        out.set_row(2, &[1.0, f64::INFINITY]);
        assert_eq!(out.column("x").unwrap(), &[None, None, Some(1.0)]);
        assert_eq!(out.column("y").unwrap(), &[None, None, None]);
        assert!(out.ensure_finite().is_ok());

        out.columns[0].1[0] = Some(f64::NAN);
        assert!(matches!(
            out.ensure_finite(),
            Err(KernelError::NonFinite { index: 0, .. })
        ));
    }

    #[test]
    fn arity_and_length_are_checked() {
        let ok = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert_eq!(check_arity(&ok, 2), Ok(2));
        assert!(matches!(
            check_arity(&ok, 4),
            Err(KernelError::InputArity { .. })
        ));
        let ragged = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            check_arity(&ragged, 2),
            Err(KernelError::LengthMismatch { .. })
        ));
        assert!(check_window(0, 1).is_err());
        assert!(check_window(2, 3).is_err());
        assert!(check_window(3, 3).is_ok());
    }
}
