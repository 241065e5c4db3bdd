//! Log-space reductions over weight vectors.
//!
//! NaN entries are treated as negative infinity throughout.

use core::f64::consts::PI;

#[inline]
fn clean(x: f64) -> f64 {
    if x.is_nan() {
        f64::NEG_INFINITY
    } else {
        x
    }
}

/// Maximum of a slice, `-inf` when empty or when every entry is `-inf`/NaN.
pub fn max_reduce(xs: &[f64]) -> f64 {
    xs.iter()
        .map(|&x| clean(x))
        .fold(f64::NEG_INFINITY, f64::max)
}

/// `log(sum(exp(xs)))`, shifted by the maximum for stability.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let mx = max_reduce(xs);
    if !mx.is_finite() {
        // -inf: nothing to sum. +inf: the sum is infinite.
        return mx;
    }
    let sum: f64 = xs.iter().map(|&x| (clean(x) - mx).exp()).sum();
    mx + sum.ln()
}

/// Components of the effective sample size: the linear sums `(Σw, Σw²)`
/// with `w = exp(lw - shift)`.
///
/// Split out so distributed callers can all-reduce the sums before combining.
pub fn ess_parts(lws: &[f64], shift: f64) -> (f64, f64) {
    if !shift.is_finite() {
        return (0.0, 0.0);
    }
    lws.iter().fold((0.0, 0.0), |(s1, s2), &lw| {
        let w = (clean(lw) - shift).exp();
        (s1 + w, s2 + w * w)
    })
}

/// Combine shifted sums into an ESS. Zero mass gives ESS 0.
pub fn ess_from_parts(sum_w: f64, sum_w2: f64) -> f64 {
    if sum_w <= 0.0 || sum_w2 <= 0.0 || !sum_w.is_finite() || !sum_w2.is_finite() {
        0.0
    } else {
        sum_w * sum_w / sum_w2
    }
}

/// Effective sample size `1 / sum(normalised_w^2)` computed from log-weights.
///
/// Returns `0.0` for an empty or fully degenerate (all `-inf`) vector.
pub fn ess(lws: &[f64]) -> f64 {
    let mx = max_reduce(lws);
    let (s1, s2) = ess_parts(lws, mx);
    ess_from_parts(s1, s2)
}

/// Normalised (linear-scale) weights. All zero when the vector is degenerate.
pub fn normalised_weights(lws: &[f64]) -> Vec<f64> {
    let lse = logsumexp(lws);
    if !lse.is_finite() {
        return vec![0.0; lws.len()];
    }
    lws.iter().map(|&lw| (clean(lw) - lse).exp()).collect()
}

/// Log-density of `N(mean, sd^2)` at `x`.
pub fn log_normal_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    if sd <= 0.0 || !sd.is_finite() {
        return f64::NEG_INFINITY;
    }
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - 0.5 * (2.0 * PI).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logsumexp_matches_naive() {
        let xs = [-1.0, 0.5, 2.0];
        let naive = xs.iter().map(|x: &f64| x.exp()).sum::<f64>().ln();
        assert!((logsumexp(&xs) - naive).abs() < 1e-12);
    }

    #[test]
    fn test_logsumexp_large_values() {
        let xs = [1000.0, 1000.0];
        assert!((logsumexp(&xs) - (1000.0 + 2f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn test_logsumexp_degenerate() {
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY, f64::NAN]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_ess_uniform_is_population_size() {
        let lws = vec![0.0; 16];
        assert!((ess(&lws) - 16.0).abs() < 1e-9);
        let shifted = vec![-42.0; 16];
        assert!((ess(&shifted) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_ess_concentrated_is_one() {
        let lws = [0.0, f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert!((ess(&lws) - 1.0).abs() < 1e-12);
        let nearly = [0.0, -50.0, -50.0, -50.0];
        let e = ess(&nearly);
        assert!(e >= 1.0 && e < 1.0 + 1e-9);
    }

    #[test]
    fn test_ess_bounds() {
        let lws = [0.3, -1.2, 2.5, -0.7, 0.0, 1.1];
        let e = ess(&lws);
        assert!(e >= 1.0 && e <= lws.len() as f64);
    }

    #[test]
    fn test_ess_parts_are_linear_sums() {
        let (s1, s2) = ess_parts(&[0.0, 2f64.ln(), f64::NEG_INFINITY], 0.0);
        assert!((s1 - 3.0).abs() < 1e-12);
        assert!((s2 - 5.0).abs() < 1e-12);
        assert_eq!(ess_parts(&[0.0], f64::NEG_INFINITY), (0.0, 0.0));
    }

    #[test]
    fn test_ess_degenerate_policy() {
        assert_eq!(ess(&[]), 0.0);
        assert_eq!(ess(&[f64::NEG_INFINITY; 3]), 0.0);
        assert_eq!(ess(&[f64::NAN, f64::NAN]), 0.0);
    }

    #[test]
    fn test_normalised_weights_sum_to_one() {
        let w = normalised_weights(&[0.0, 1.0, -2.0]);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(normalised_weights(&[f64::NEG_INFINITY; 2]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_log_normal_pdf() {
        let v = log_normal_pdf(0.0, 0.0, 1.0);
        assert!((v + 0.5 * (2.0 * PI).ln()).abs() < 1e-12);
        assert_eq!(log_normal_pdf(0.0, 0.0, 0.0), f64::NEG_INFINITY);
    }
}
