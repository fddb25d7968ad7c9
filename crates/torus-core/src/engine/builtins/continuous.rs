//! Continuous distributions: `normal`, `uniform_continuous`, `beta`, `gamma`.
//!
//! All four advertise support bounds, so the slice kernel can target them.
//! `normal` additionally offers a prior-preserving drift kernel and a
//! variational family with its gradient.

use std::sync::Arc;

use rand::{Rng, RngCore};
use rand_distr::{Beta, Distribution, Gamma, Normal};

use crate::engine::errors::ExecError;
use crate::engine::numeric::{beta_log_density, gamma_log_density, normal_log_density};
use crate::engine::procedure::{
    Args, DeltaKernel, NumericDensity, ParamScope, Procedure, Psp, SimpleSp,
};
use crate::engine::value::Value;

/// Mixing weight of the autoregressive drift proposal.
const DRIFT_MIX: f64 = 0.5;

fn positive(x: f64, what: &str) -> Result<f64, ExecError> {
    if x > 0.0 && x.is_finite() {
        Ok(x)
    } else {
        Err(ExecError::Evaluation(format!("{} must be positive, got {}", what, x)))
    }
}

fn sample_normal(mu: f64, sigma: f64, rng: &mut dyn RngCore) -> Result<f64, ExecError> {
    let dist = Normal::new(mu, sigma)
        .map_err(|e| ExecError::Evaluation(format!("normal({}, {}): {}", mu, sigma, e)))?;
    Ok(dist.sample(rng))
}

// ---- normal -------------------------------------------------------------

#[derive(Debug)]
pub struct NormalOutputPsp;

impl NormalOutputPsp {
    fn params(args: &Args) -> Result<(f64, f64), ExecError> {
        args.check_arity("normal", 2, 2)?;
        let mu = args.number(0, "normal mean")?;
        let sigma = positive(args.number(1, "normal sigma")?, "normal sigma")?;
        Ok((mu, sigma))
    }
}

impl Psp for NormalOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (mu, sigma) = Self::params(args)?;
        sample_normal(mu, sigma, rng).map(Value::Number)
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (mu, sigma) = Self::params(args)?;
        Ok(normal_log_density(value.expect_number("normal value")?, mu, sigma))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn delta_kernel(&self) -> Option<Arc<dyn DeltaKernel>> {
        Some(Arc::new(NormalDriftKernel))
    }

    fn support(&self, _args: &Args) -> Option<(f64, f64)> {
        Some((f64::NEG_INFINITY, f64::INFINITY))
    }

    fn variational(&self) -> Option<&dyn NumericDensity> {
        Some(self)
    }
}

impl NumericDensity for NormalOutputPsp {
    fn simulate_numeric(&self, params: &[f64], rng: &mut dyn RngCore) -> Result<f64, ExecError> {
        match params {
            [mu, sigma] => sample_normal(*mu, *sigma, rng),
            _ => Err(ExecError::Internal("normal takes two parameters".into())),
        }
    }

    fn log_density_numeric(&self, x: f64, params: &[f64]) -> f64 {
        match params {
            [mu, sigma] => normal_log_density(x, *mu, *sigma),
            _ => f64::NAN,
        }
    }

    fn gradient_of_log_density_numeric(&self, x: f64, params: &[f64]) -> (f64, Vec<f64>) {
        let (mu, sigma) = match params {
            [mu, sigma] => (*mu, *sigma),
            _ => return (f64::NAN, vec![f64::NAN; params.len()]),
        };
        let d = x - mu;
        let var = sigma * sigma;
        let grad_x = -d / var;
        let grad_mu = d / var;
        let grad_sigma = -1.0 / sigma + d * d / (var * sigma);
        (grad_x, vec![grad_mu, grad_sigma])
    }

    fn parameter_scopes(&self) -> &[ParamScope] {
        &[ParamScope::Real, ParamScope::PositiveReal]
    }
}

/// `x' = mu + sqrt(1 - b^2) (x - mu) + b e` with `e ~ N(0, sigma)`.
///
/// The proposal leaves the prior invariant, so both weights are zero and the
/// acceptance ratio reduces to the likelihood ratio.
#[derive(Debug)]
struct NormalDriftKernel;

impl DeltaKernel for NormalDriftKernel {
    fn simulate(&self, old: &Value, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (mu, sigma) = NormalOutputPsp::params(args)?;
        let x = old.expect_number("normal value")?;
        let e = sample_normal(0.0, sigma, rng)?;
        let keep = (1.0 - DRIFT_MIX * DRIFT_MIX).sqrt();
        Ok(Value::Number(mu + keep * (x - mu) + DRIFT_MIX * e))
    }

    fn weight(&self, _new: &Value, _old: &Value, _args: &Args) -> Result<f64, ExecError> {
        Ok(0.0)
    }

    fn reverse_weight(&self, _old: &Value, _args: &Args) -> Result<f64, ExecError> {
        Ok(0.0)
    }
}

// ---- uniform_continuous -------------------------------------------------

#[derive(Debug)]
pub struct UniformOutputPsp;

impl UniformOutputPsp {
    fn params(args: &Args) -> Result<(f64, f64), ExecError> {
        args.check_arity("uniform_continuous", 2, 2)?;
        let low = args.number(0, "uniform lower bound")?;
        let high = args.number(1, "uniform upper bound")?;
        if low.is_nan() || high.is_nan() || low >= high {
            return Err(ExecError::Evaluation(format!(
                "uniform_continuous needs low < high, got {} and {}",
                low, high
            )));
        }
        Ok((low, high))
    }
}

impl Psp for UniformOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (low, high) = Self::params(args)?;
        Ok(Value::Number(low + (high - low) * rng.random::<f64>()))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (low, high) = Self::params(args)?;
        let x = value.expect_number("uniform value")?;
        if (low..=high).contains(&x) {
            Ok(-(high - low).ln())
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }

    fn is_random(&self) -> bool {
        true
    }

    fn support(&self, args: &Args) -> Option<(f64, f64)> {
        Self::params(args).ok()
    }
}

// ---- beta ---------------------------------------------------------------

#[derive(Debug)]
pub struct BetaOutputPsp;

impl BetaOutputPsp {
    fn params(args: &Args) -> Result<(f64, f64), ExecError> {
        args.check_arity("beta", 2, 2)?;
        let a = positive(args.number(0, "beta alpha")?, "beta alpha")?;
        let b = positive(args.number(1, "beta beta")?, "beta beta")?;
        Ok((a, b))
    }
}

impl Psp for BetaOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (a, b) = Self::params(args)?;
        sample_beta(a, b, rng).map(Value::Number)
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (a, b) = Self::params(args)?;
        Ok(beta_log_density(value.expect_number("beta value")?, a, b))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn support(&self, _args: &Args) -> Option<(f64, f64)> {
        Some((0.0, 1.0))
    }
}

pub(super) fn sample_beta(a: f64, b: f64, rng: &mut dyn RngCore) -> Result<f64, ExecError> {
    let dist = Beta::new(a, b)
        .map_err(|e| ExecError::Evaluation(format!("beta({}, {}): {}", a, b, e)))?;
    Ok(dist.sample(rng))
}

// ---- gamma --------------------------------------------------------------

/// Gamma with shape and rate.
#[derive(Debug)]
pub struct GammaOutputPsp;

impl GammaOutputPsp {
    fn params(args: &Args) -> Result<(f64, f64), ExecError> {
        args.check_arity("gamma", 2, 2)?;
        let shape = positive(args.number(0, "gamma shape")?, "gamma shape")?;
        let rate = positive(args.number(1, "gamma rate")?, "gamma rate")?;
        Ok((shape, rate))
    }
}

impl Psp for GammaOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (shape, rate) = Self::params(args)?;
        let dist = Gamma::new(shape, 1.0 / rate)
            .map_err(|e| ExecError::Evaluation(format!("gamma({}, {}): {}", shape, rate, e)))?;
        Ok(Value::Number(dist.sample(rng)))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (shape, rate) = Self::params(args)?;
        Ok(gamma_log_density(value.expect_number("gamma value")?, shape, rate))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn support(&self, _args: &Args) -> Option<(f64, f64)> {
        Some((0.0, f64::INFINITY))
    }
}

pub(super) fn procedures() -> Vec<(&'static str, Arc<dyn Procedure>)> {
    let normal: Arc<dyn Procedure> =
        Arc::new(SimpleSp::output_only("normal", Arc::new(NormalOutputPsp)));
    let uniform: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "uniform_continuous",
        Arc::new(UniformOutputPsp),
    ));
    let beta: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only("beta", Arc::new(BetaOutputPsp)));
    let gamma: Arc<dyn Procedure> =
        Arc::new(SimpleSp::output_only("gamma", Arc::new(GammaOutputPsp)));
    vec![
        ("normal", normal),
        ("uniform_continuous", uniform),
        ("beta", beta),
        ("gamma", gamma),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::env::Env;
    use crate::engine::node::NodeId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use smallvec::SmallVec;

    fn args(operands: &[f64]) -> Args {
        Args {
            node: NodeId(0),
            operand_nodes: SmallVec::new(),
            operands: operands.iter().copied().map(Value::Number).collect(),
            env: Env::root(),
            request: None,
            esr_nodes: SmallVec::new(),
            esr_values: Vec::new(),
            aux: None,
            made_aux: None,
        }
    }

    #[test]
    fn normal_gradient_matches_finite_differences() {
        let psp = NormalOutputPsp;
        let (x, mu, sigma) = (0.7, 0.2, 1.3);
        let (_, grad) = psp.gradient_of_log_density_numeric(x, &[mu, sigma]);
        let h = 1e-6;
        let numeric_mu = (psp.log_density_numeric(x, &[mu + h, sigma])
            - psp.log_density_numeric(x, &[mu - h, sigma]))
            / (2.0 * h);
        let numeric_sigma = (psp.log_density_numeric(x, &[mu, sigma + h])
            - psp.log_density_numeric(x, &[mu, sigma - h]))
            / (2.0 * h);
        assert!((grad[0] - numeric_mu).abs() < 1e-5);
        assert!((grad[1] - numeric_sigma).abs() < 1e-5);
    }

    #[test]
    fn samples_stay_inside_support() {
        let mut rng = StdRng::seed_from_u64(3);
        let unit = args(&[2.0, 3.0]);
        for _ in 0..200 {
            let x = BetaOutputPsp.simulate(&unit, &mut rng).unwrap();
            let x = x.as_number().unwrap();
            assert!((0.0..=1.0).contains(&x));
            let g = GammaOutputPsp.simulate(&unit, &mut rng).unwrap();
            assert!(g.as_number().unwrap() > 0.0);
        }
        assert_eq!(UniformOutputPsp.support(&args(&[-1.0, 4.0])), Some((-1.0, 4.0)));
    }

    #[test]
    fn invalid_parameters_are_evaluation_errors() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            NormalOutputPsp.simulate(&args(&[0.0, -1.0]), &mut rng),
            Err(ExecError::Evaluation(_))
        ));
        assert!(matches!(
            UniformOutputPsp.simulate(&args(&[1.0, 1.0]), &mut rng),
            Err(ExecError::Evaluation(_))
        ));
    }
}
