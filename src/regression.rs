//! Rolling degree-2 least-squares fit over the past window.
//!
//! The abscissa of a window is `x = 0..window`. Fitting happens in the scaled
//! abscissa `t = x / (window - 1)`, which keeps the normal equations well
//! conditioned for multi-day windows; coefficients are reported in `x` units.

use crate::window::{all_finite, check_arity, check_window, mean, KernelError, KernelOutput};

pub const REGRESSION_FEATURES: [&str; 10] = [
    "a_coef",
    "b_coef",
    "c_coef",
    "quadratic_term",
    "linear_term",
    "constant_term",
    "prediction",
    "residual",
    "r2",
    "rmse",
];

const PIVOT_EPSILON: f64 = 1e-12;

/// Precomputed least-squares projection for one window length.
#[derive(Debug, Clone)]
struct QuadraticDesign {
    t: Vec<f64>,
    /// Rows of `(X^T X)^-1 X^T` for the coefficients `(a_t, b_t, c_t)`.
    weights: [Vec<f64>; 3],
}

impl QuadraticDesign {
    fn new(window: usize) -> Option<Self> {
        if window < 3 {
            return None;
        }
        let span = (window - 1) as f64;
        let t: Vec<f64> = (0..window).map(|k| k as f64 / span).collect();

        let mut power_sums = [0.0f64; 5];
        for tk in &t {
            let mut p = 1.0;
            for sum in power_sums.iter_mut() {
                *sum += p;
                p *= tk;
            }
        }
        let gram = [
            [power_sums[4], power_sums[3], power_sums[2]],
            [power_sums[3], power_sums[2], power_sums[1]],
            [power_sums[2], power_sums[1], power_sums[0]],
        ];
        let inverse = invert3(gram)?;

        let mut weights = [
            Vec::with_capacity(window),
            Vec::with_capacity(window),
            Vec::with_capacity(window),
        ];
        for tk in &t {
            let basis = [tk * tk, *tk, 1.0];
            for (row, out) in inverse.iter().zip(weights.iter_mut()) {
                out.push(row[0] * basis[0] + row[1] * basis[1] + row[2] * basis[2]);
            }
        }

        Some(Self { t, weights })
    }

    fn fit(&self, y: &[f64]) -> [f64; 3] {
        let mut coef = [0.0f64; 3];
        for (c, w) in coef.iter_mut().zip(&self.weights) {
            *c = w.iter().zip(y).map(|(wk, yk)| wk * yk).sum();
        }
        coef
    }
}

fn invert3(m: [[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let scale = m
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    let mut a = m;
    let mut inv = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    for col in 0..3 {
        let pivot_row = (col..3)
            .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
            .unwrap_or(col);
        if a[pivot_row][col].abs() < PIVOT_EPSILON * scale {
            return None;
        }
        a.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = a[col][col];
        for k in 0..3 {
            a[col][k] /= pivot;
            inv[col][k] /= pivot;
        }
        for row in 0..3 {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            for k in 0..3 {
                a[row][k] -= factor * a[col][k];
                inv[row][k] -= factor * inv[col][k];
            }
        }
    }
    Some(inv)
}

/// Fits `y = a*x^2 + b*x + c` to `series[i - window..i]` for every `i >= window`.
///
/// Singular designs (`window < 3`) and windows holding non-finite inputs emit
/// null rows rather than failing.
pub fn regression_window(series: &[f64], window: usize) -> Result<KernelOutput, KernelError> {
    check_window(window, 1)?;
    let mut out = KernelOutput::with_features(window, &REGRESSION_FEATURES, series.len());
    let Some(design) = QuadraticDesign::new(window) else {
        return Ok(out);
    };

    let span = (window - 1) as f64;
    for i in window..series.len() {
        let y = &series[i - window..i];
        if !all_finite(y) {
            continue;
        }

        let [a_t, b_t, c_t] = design.fit(y);
        let a_coef = a_t / (span * span);
        let b_coef = b_t / span;
        let c_coef = c_t;

        let quadratic_term = a_coef * span * span;
        let linear_term = b_coef * span;
        let constant_term = c_coef;
        let prediction = quadratic_term + linear_term + constant_term;
        let residual = series[i - 1] - prediction;

        let y_mean = mean(y);
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        let mut sum_sq = 0.0;
        for (yk, tk) in y.iter().zip(&design.t) {
            let fitted = (a_t * tk + b_t) * tk + c_t;
            ss_res += (yk - fitted) * (yk - fitted);
            ss_tot += (yk - y_mean) * (yk - y_mean);
            sum_sq += yk * yk;
        }
        let r2 = if ss_tot <= f64::EPSILON * sum_sq {
            0.0
        } else {
            1.0 - ss_res / ss_tot
        };
        let rmse = (ss_res / window as f64).sqrt();

        out.set_row(
            i,
            &[
                a_coef,
                b_coef,
                c_coef,
                quadratic_term,
                linear_term,
                constant_term,
                prediction,
                residual,
                r2,
                rmse,
            ],
        );
    }

    Ok(out)
}

pub(crate) fn regression_kernel(
    inputs: &[Vec<f64>],
    window: usize,
) -> Result<KernelOutput, KernelError> {
    check_arity(inputs, 1)?;
    regression_window(&inputs[0], window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(out: &KernelOutput, feature: &str, index: usize) -> f64 {
        out.column(feature).unwrap()[index].unwrap_or_else(|| panic!("{feature}[{index}] null"))
    }

    #[test]
    fn exact_quadratic_is_recovered() {
        let series: Vec<f64> = (0..20)
            .map(|x| {
                let x = x as f64;
                -0.25 * x * x + 3.0 * x + 7.0
            })
            .collect();
        let out = regression_window(&series, 8).unwrap();
        // window at i = 8 starts at x = 0
        assert!((value(&out, "a_coef", 8) + 0.25).abs() < 1e-9);
        assert!((value(&out, "b_coef", 8) - 3.0).abs() < 1e-9);
        assert!((value(&out, "c_coef", 8) - 7.0).abs() < 1e-9);
        assert!((value(&out, "r2", 8) - 1.0).abs() < 1e-9);
        assert!(value(&out, "rmse", 8) < 1e-9);
        assert!(value(&out, "residual", 8).abs() < 1e-9);
    }

    #[test]
    fn term_identity_holds_on_noisy_input() {
        let series: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.37).sin() * 0.8 + (i % 7) as f64 * 0.01)
            .collect();
        let out = regression_window(&series, 30).unwrap();
        for i in 30..series.len() {
            let sum = value(&out, "quadratic_term", i)
                + value(&out, "linear_term", i)
                + value(&out, "constant_term", i);
            assert!((value(&out, "prediction", i) - sum).abs() < 1e-6);
            let r2 = value(&out, "r2", i);
            assert!((-1e-9..=1.0 + 1e-9).contains(&r2), "r2={r2}");
        }
    }

    #[test]
    fn constant_window_has_zero_r2_and_zero_rmse() {
        let series = vec![1.1; 12];
        let out = regression_window(&series, 5).unwrap();
        assert_eq!(value(&out, "r2", 5), 0.0);
        assert!(value(&out, "rmse", 5) < 1e-12);
        assert!((value(&out, "prediction", 5) - 1.1).abs() < 1e-12);
    }

    #[test]
    fn singular_windows_emit_nulls_instead_of_failing() {
        let series: Vec<f64> = (0..10).map(|i| i as f64).collect();
        for window in [1, 2] {
            let out = regression_window(&series, window).unwrap();
            assert!(out
                .columns
                .iter()
                .all(|(_, column)| column.iter().all(Option::is_none)));
        }
    }

    #[test]
    fn nan_in_window_nulls_that_index_only() {
        let mut series: Vec<f64> = (0..12).map(|i| i as f64).collect();
        series[4] = f64::NAN;
        let out = regression_window(&series, 3).unwrap();
        assert!(out.column("prediction").unwrap()[5].is_none());
        assert!(out.column("prediction").unwrap()[7].is_none());
        assert!(out.column("prediction").unwrap()[8].is_some());
    }

    #[test]
    fn singular_gram_matrix_is_detected() {
        assert!(invert3([[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 2.0]]).is_none());
        let inv = invert3([[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 0.5]]).unwrap();
        assert_eq!(inv[0][0], 0.5);
        assert_eq!(inv[1][1], 0.25);
        assert_eq!(inv[2][2], 2.0);
    }
}
