//! Numeric helpers for log-space probability computations.

use std::f64::consts::PI;

use rand::{Rng, RngCore};

/// Tolerance used by numeric equivalence checks.
pub const NUMERIC_EPSILON: f64 = 1e-9;

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function (Lanczos approximation).
///
/// Uses the reflection formula below 0.5, so it is defined for every
/// non-integer negative argument as well.
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        return (PI / (PI * x).sin()).abs().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = LANCZOS_COEFFICIENTS[0];
    let t = x + LANCZOS_G + 0.5;
    for (i, c) in LANCZOS_COEFFICIENTS.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// `ln(sum(exp(xs)))`, stable for large magnitudes. Empty input gives `-inf`.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let m = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    m + xs.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

/// Samples an index with probability proportional to `exp(weights[i])`.
///
/// Returns `None` when every weight is `-inf` or the slice is empty.
pub fn sample_log_categorical(weights: &[f64], rng: &mut dyn RngCore) -> Option<usize> {
    let m = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if m == f64::NEG_INFINITY || m.is_nan() {
        return None;
    }
    let probs: Vec<f64> = weights.iter().map(|w| (w - m).exp()).collect();
    let total: f64 = probs.iter().sum();
    let mut u = rng.random::<f64>() * total;
    for (i, p) in probs.iter().enumerate() {
        if u < *p {
            return Some(i);
        }
        u -= p;
    }
    probs.iter().rposition(|p| *p > 0.0)
}

pub fn normal_log_density(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
}

pub fn beta_log_density(x: f64, a: f64, b: f64) -> f64 {
    if !(0.0..=1.0).contains(&x) {
        return f64::NEG_INFINITY;
    }
    (a - 1.0) * x.ln() + (b - 1.0) * (1.0 - x).ln() - ln_beta(a, b)
}

/// Gamma density with shape `alpha` and rate `beta`.
pub fn gamma_log_density(x: f64, alpha: f64, beta: f64) -> f64 {
    if x <= 0.0 {
        return f64::NEG_INFINITY;
    }
    alpha * beta.ln() - ln_gamma(alpha) + (alpha - 1.0) * x.ln() - beta * x
}

/// Dirichlet density of the weights `x` under concentrations `alpha`.
pub fn dirichlet_log_density(x: &[f64], alpha: &[f64]) -> f64 {
    if x.len() != alpha.len() || x.iter().any(|xi| *xi < 0.0) {
        return f64::NEG_INFINITY;
    }
    let total: f64 = alpha.iter().sum();
    let mut ld = ln_gamma(total);
    for (xi, a) in x.iter().zip(alpha) {
        ld += (a - 1.0) * xi.ln() - ln_gamma(*a);
    }
    ld
}

pub fn bernoulli_log_density(value: bool, p: f64) -> f64 {
    if value {
        p.ln()
    } else {
        (1.0 - p).ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_close(lhs: f64, rhs: f64, eps: f64) {
        let diff = (lhs - rhs).abs();
        assert!(
            diff <= eps,
            "difference too large: |{} - {}| = {} (eps={})",
            lhs,
            rhs,
            diff,
            eps
        );
    }

    #[test]
    fn two_category_dirichlet_is_a_beta() {
        for x in [0.1, 0.35, 0.8] {
            assert_close(
                dirichlet_log_density(&[x, 1.0 - x], &[2.0, 3.5]),
                beta_log_density(x, 2.0, 3.5),
                1e-9,
            );
        }
        assert_eq!(dirichlet_log_density(&[0.5, 0.5], &[1.0]), f64::NEG_INFINITY);
    }

    #[test]
    fn ln_gamma_matches_factorials() {
        assert_close(ln_gamma(1.0), 0.0, NUMERIC_EPSILON);
        assert_close(ln_gamma(2.0), 0.0, NUMERIC_EPSILON);
        assert_close(ln_gamma(5.0), 24.0_f64.ln(), NUMERIC_EPSILON);
        assert_close(ln_gamma(0.5), PI.sqrt().ln(), NUMERIC_EPSILON);
    }

    #[test]
    fn logsumexp_handles_infinities() {
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_close(logsumexp(&[0.0, 0.0]), 2.0_f64.ln(), NUMERIC_EPSILON);
        assert_close(logsumexp(&[1000.0, 1000.0]), 1000.0 + 2.0_f64.ln(), NUMERIC_EPSILON);
    }

    #[test]
    fn log_categorical_skips_impossible_entries() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let i = sample_log_categorical(&[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY], &mut rng);
            assert_eq!(i, Some(1));
        }
        assert_eq!(sample_log_categorical(&[f64::NEG_INFINITY], &mut rng), None);
    }

    #[test]
    fn densities_integrate_sensibly() {
        assert_close(normal_log_density(0.0, 0.0, 1.0), -0.5 * (2.0 * PI).ln(), NUMERIC_EPSILON);
        assert_close(beta_log_density(0.5, 1.0, 1.0), 0.0, NUMERIC_EPSILON);
        assert_close(gamma_log_density(1.0, 1.0, 1.0), -1.0, NUMERIC_EPSILON);
        assert_eq!(beta_log_density(1.5, 2.0, 2.0), f64::NEG_INFINITY);
    }
}
