//! Rolling pairwise covariances between the regression terms.

use crate::window::{
    all_finite, check_arity, check_window, sample_covariance, KernelError, KernelOutput,
};

/// Regression outputs the covariance family consumes, in input order.
pub const COVARIANCE_TERMS: [&str; 4] =
    ["quadratic_term", "linear_term", "constant_term", "residual"];

/// One feature per unordered term pair `(a, b)` with `a < b`.
pub const COVARIANCE_FEATURES: [&str; 6] =
    ["cov_ql", "cov_qc", "cov_qr", "cov_lc", "cov_lr", "cov_cr"];

const TERM_PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Sample covariance of each term pair over `terms[_][i - window..i]`.
pub fn covariance_window(terms: &[Vec<f64>], window: usize) -> Result<KernelOutput, KernelError> {
    check_window(window, 1)?;
    let len = check_arity(terms, COVARIANCE_TERMS.len())?;
    let mut out = KernelOutput::with_features(window, &COVARIANCE_FEATURES, len);

    let mut row = [0.0f64; 6];
    for i in window..len {
        for (slot, (a, b)) in row.iter_mut().zip(TERM_PAIRS) {
            let xs = &terms[a][i - window..i];
            let ys = &terms[b][i - window..i];
            *slot = if all_finite(xs) && all_finite(ys) {
                sample_covariance(xs, ys)
            } else {
                f64::NAN
            };
        }
        out.set_row(i, &row);
    }

    Ok(out)
}

pub(crate) fn covariance_kernel(
    inputs: &[Vec<f64>],
    window: usize,
) -> Result<KernelOutput, KernelError> {
    covariance_window(inputs, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(len: usize) -> Vec<Vec<f64>> {
        let q: Vec<f64> = (0..len).map(|i| (i as f64 * 0.5).sin()).collect();
        let l: Vec<f64> = (0..len).map(|i| 2.0 * (i as f64 * 0.5).sin() + 1.0).collect();
        let c: Vec<f64> = (0..len).map(|i| 100.0 + (i as f64 * 0.2).cos()).collect();
        let r: Vec<f64> = (0..len).map(|i| if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        vec![q, l, c, r]
    }

    #[test]
    fn perfectly_correlated_terms_match_scaled_variance() {
        let input = terms(30);
        let out = covariance_window(&input, 10).unwrap();
        let i = 20;
        let var_q = sample_covariance(&input[0][i - 10..i], &input[0][i - 10..i]);
        let cov_ql = out.column("cov_ql").unwrap()[i].unwrap();
        assert!((cov_ql - 2.0 * var_q).abs() < 1e-12);
    }

    #[test]
    fn zero_term_yields_zero_covariance_everywhere_filled() {
        let mut input = terms(40);
        input[1] = vec![0.0; 40];
        let out = covariance_window(&input, 8).unwrap();
        for feature in ["cov_ql", "cov_lc", "cov_lr"] {
            let column = out.column(feature).unwrap();
            assert!(column[..8].iter().all(Option::is_none));
            assert!(column[8..].iter().all(|v| *v == Some(0.0)), "{feature}");
        }
        assert!(out.column("cov_qc").unwrap()[8..].iter().any(|v| *v != Some(0.0)));
    }

    #[test]
    fn null_terms_propagate_as_null_rows() {
        let mut input = terms(12);
        input[3][2] = f64::NAN;
        let out = covariance_window(&input, 3).unwrap();
        assert!(out.column("cov_qr").unwrap()[4].is_none());
        assert!(out.column("cov_ql").unwrap()[4].is_some());
        assert!(out.column("cov_qr").unwrap()[6].is_some());
    }

    #[test]
    fn requires_four_aligned_series() {
        let input = vec![vec![1.0; 5]; 3];
        assert!(matches!(
            covariance_window(&input, 2),
            Err(KernelError::InputArity { expected: 4, found: 3 })
        ));
    }
}
