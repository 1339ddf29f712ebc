//! Retrospective aggregates over the past window (BQX family).

use crate::window::{
    all_finite, check_arity, check_window, mean, sample_std, KernelError, KernelOutput,
};

pub const BQX_FEATURES: [&str; 6] = [
    "bqx_return",
    "bqx_max",
    "bqx_min",
    "bqx_avg",
    "bqx_stdev",
    "bqx_endpoint",
];

/// For index `i` with reference `v = series[i]` and past slice
/// `P = series[i - window..i]`:
///
/// - `bqx_return = sum(P - v) / v`
/// - `bqx_max`, `bqx_min`, `bqx_avg` over `P`
/// - `bqx_stdev`: sample standard deviation of `P`
/// - `bqx_endpoint = (P[0] - v) / v`
pub fn bqx_window(series: &[f64], window: usize) -> Result<KernelOutput, KernelError> {
    check_window(window, 1)?;
    let mut out = KernelOutput::with_features(window, &BQX_FEATURES, series.len());

    for i in window..series.len() {
        let v = series[i];
        let past = &series[i - window..i];
        if !v.is_finite() || !all_finite(past) {
            continue;
        }

        let sum_diff = past.iter().map(|p| p - v).sum::<f64>();
        let max = past.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = past.iter().copied().fold(f64::INFINITY, f64::min);

        out.set_row(
            i,
            &[
                sum_diff / v,
                max,
                min,
                mean(past),
                sample_std(past),
                (past[0] - v) / v,
            ],
        );
    }

    Ok(out)
}

pub(crate) fn bqx_kernel(inputs: &[Vec<f64>], window: usize) -> Result<KernelOutput, KernelError> {
    check_arity(inputs, 1)?;
    bqx_window(&inputs[0], window)
}
