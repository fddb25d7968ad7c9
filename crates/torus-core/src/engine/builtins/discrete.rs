//! Bernoulli- and category-valued procedures.
//!
//! `make_beta_bernoulli` makes a collapsed coin: the bias is integrated out
//! and the made procedure keeps only head/tail counts, which lets its maker
//! be absorbed at applications. `make_ubeta_bernoulli` samples the bias
//! explicitly and keeps it current with an auxiliary Gibbs step.
//!
//! `make_sym_dir_mult` and `make_uc_sym_dir_mult` are the same pair for a
//! die with `n` faces under a symmetric Dirichlet prior. Faces are the
//! numbers `0..n`.

use std::any::Any;
use std::sync::Arc;

use rand::{Rng, RngCore};
use rand_distr::{Distribution, Gamma};

use crate::engine::errors::ExecError;
use crate::engine::numeric::{
    bernoulli_log_density, beta_log_density, dirichlet_log_density, ln_gamma,
    sample_log_categorical,
};
use crate::engine::procedure::{
    new_aux, with_aux, Args, AuxHandle, Procedure, Psp, SimpleSp, SpAux,
};
use crate::engine::value::{MadeSp, Value};

use super::continuous::sample_beta;

fn probability(x: f64, what: &str) -> Result<f64, ExecError> {
    if (0.0..=1.0).contains(&x) {
        Ok(x)
    } else {
        Err(ExecError::Evaluation(format!("{} must lie in [0, 1], got {}", what, x)))
    }
}

fn hyperparameters(args: &Args, name: &str) -> Result<(f64, f64), ExecError> {
    args.check_arity(name, 2, 2)?;
    let alpha = args.number(0, name)?;
    let beta = args.number(1, name)?;
    if alpha <= 0.0 || beta <= 0.0 {
        return Err(ExecError::Evaluation(format!(
            "{} needs positive pseudo-counts, got {} and {}",
            name, alpha, beta
        )));
    }
    Ok((alpha, beta))
}

// ---- flip ---------------------------------------------------------------

#[derive(Debug)]
pub struct FlipOutputPsp;

impl FlipOutputPsp {
    fn weight(args: &Args) -> Result<f64, ExecError> {
        args.check_arity("flip", 0, 1)?;
        if args.operands.is_empty() {
            return Ok(0.5);
        }
        probability(args.number(0, "flip weight")?, "flip weight")
    }
}

impl Psp for FlipOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let p = Self::weight(args)?;
        Ok(Value::Bool(rng.random::<f64>() < p))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let p = Self::weight(args)?;
        Ok(bernoulli_log_density(value.expect_bool("flip value")?, p))
    }

    fn is_random(&self) -> bool {
        true
    }
}

/// Head and tail counts of a coin.
#[derive(Debug, Clone, Default)]
pub struct CoinAux {
    pub heads: u64,
    pub tails: u64,
    /// Explicit bias, for uncollapsed coins.
    pub p: f64,
}

impl CoinAux {
    fn record(&mut self, heads: bool, delta: i64) -> Result<(), ExecError> {
        let count = if heads { &mut self.heads } else { &mut self.tails };
        *count = count
            .checked_add_signed(delta)
            .ok_or_else(|| ExecError::Internal("coin count went negative".into()))?;
        Ok(())
    }
}

impl SpAux for CoinAux {
    fn clone_aux(&self) -> Box<dyn SpAux> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn statistics(&self) -> Vec<f64> {
        vec![self.heads as f64, self.tails as f64, self.p]
    }
}

fn record_flip(args: &Args, value: &Value, delta: i64) -> Result<(), ExecError> {
    let heads = value.expect_bool("coin value")?;
    with_aux::<CoinAux, _>(args.aux()?, |aux| aux.record(heads, delta))?
}

fn coin_state(aux: &AuxHandle) -> Result<CoinAux, ExecError> {
    with_aux::<CoinAux, _>(aux, |aux| aux.clone())
}

// ---- make_beta_bernoulli ------------------------------------------------

#[derive(Debug)]
struct MakeBetaBernoulliOutputPsp;

impl Psp for MakeBetaBernoulliOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (alpha, beta) = hyperparameters(args, "make_beta_bernoulli")?;
        Ok(Value::Procedure(MadeSp::new(Arc::new(CollapsedCoinSp {
            output: Arc::new(CollapsedCoinOutputPsp { alpha, beta }),
        }))))
    }

    fn children_can_aaa(&self) -> bool {
        true
    }
}

struct CollapsedCoinSp {
    output: Arc<CollapsedCoinOutputPsp>,
}

impl Procedure for CollapsedCoinSp {
    fn name(&self) -> &str {
        "beta_bernoulli"
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        Arc::new(crate::engine::procedure::NullRequestPsp)
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        self.output.clone()
    }

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        Some(Box::new(CoinAux::default()))
    }
}

#[derive(Debug)]
struct CollapsedCoinOutputPsp {
    alpha: f64,
    beta: f64,
}

impl CollapsedCoinOutputPsp {
    fn predictive(&self, args: &Args) -> Result<f64, ExecError> {
        let state = coin_state(args.aux()?)?;
        let a = self.alpha + state.heads as f64;
        let b = self.beta + state.tails as f64;
        Ok(a / (a + b))
    }
}

impl Psp for CollapsedCoinOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let p = self.predictive(args)?;
        Ok(Value::Bool(rng.random::<f64>() < p))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let p = self.predictive(args)?;
        Ok(bernoulli_log_density(value.expect_bool("coin value")?, p))
    }

    fn incorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_flip(args, value, 1)
    }

    fn unincorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_flip(args, value, -1)
    }

    fn is_random(&self) -> bool {
        true
    }

    fn log_density_of_counts(&self, aux: &dyn SpAux) -> Result<f64, ExecError> {
        let state = aux
            .as_any()
            .downcast_ref::<CoinAux>()
            .ok_or_else(|| ExecError::Internal("beta_bernoulli state has unexpected type".into()))?;
        let heads = state.heads as f64;
        let tails = state.tails as f64;
        let n = heads + tails;
        let a = self.alpha + self.beta;
        Ok(ln_gamma(a) - ln_gamma(n + a) + ln_gamma(self.alpha + heads) - ln_gamma(self.alpha)
            + ln_gamma(self.beta + tails)
            - ln_gamma(self.beta))
    }
}

// ---- make_ubeta_bernoulli -----------------------------------------------

#[derive(Debug)]
struct MakeUBetaBernoulliOutputPsp;

impl Psp for MakeUBetaBernoulliOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (alpha, beta) = hyperparameters(args, "make_ubeta_bernoulli")?;
        let p = sample_beta(alpha, beta, rng)?;
        let sp = UncollapsedCoinSp {
            alpha,
            beta,
            output: Arc::new(UncollapsedCoinOutputPsp),
        };
        let aux = new_aux(Box::new(CoinAux {
            p,
            ..CoinAux::default()
        }));
        Ok(Value::Procedure(MadeSp::with_aux(Arc::new(sp), aux)))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (alpha, beta) = hyperparameters(args, "make_ubeta_bernoulli")?;
        let aux = match value {
            Value::Procedure(made) => made.aux.as_ref().or(args.made_aux.as_ref()),
            _ => args.made_aux.as_ref(),
        }
        .ok_or_else(|| ExecError::Internal("uncollapsed coin without a bias".into()))?;
        Ok(beta_log_density(coin_state(aux)?.p, alpha, beta))
    }

    fn is_random(&self) -> bool {
        true
    }
}

struct UncollapsedCoinSp {
    alpha: f64,
    beta: f64,
    output: Arc<UncollapsedCoinOutputPsp>,
}

impl Procedure for UncollapsedCoinSp {
    fn name(&self) -> &str {
        "ubeta_bernoulli"
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        Arc::new(crate::engine::procedure::NullRequestPsp)
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        self.output.clone()
    }

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        Some(Box::new(CoinAux::default()))
    }

    fn has_ae_kernel(&self) -> bool {
        true
    }

    /// Gibbs step on the bias given the current counts.
    fn ae_infer(&self, aux: &AuxHandle, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let state = coin_state(aux)?;
        let p = sample_beta(
            self.alpha + state.heads as f64,
            self.beta + state.tails as f64,
            rng,
        )?;
        with_aux::<CoinAux, _>(aux, |aux| aux.p = p)
    }
}

#[derive(Debug)]
struct UncollapsedCoinOutputPsp;

impl Psp for UncollapsedCoinOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let p = coin_state(args.aux()?)?.p;
        Ok(Value::Bool(rng.random::<f64>() < p))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let p = coin_state(args.aux()?)?.p;
        Ok(bernoulli_log_density(value.expect_bool("coin value")?, p))
    }

    fn incorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_flip(args, value, 1)
    }

    fn unincorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_flip(args, value, -1)
    }

    fn is_random(&self) -> bool {
        true
    }
}

// ---- make_sym_dir_mult --------------------------------------------------

fn die_hyperparameters(args: &Args, name: &str) -> Result<(f64, usize), ExecError> {
    args.check_arity(name, 2, 2)?;
    let alpha = args.number(0, name)?;
    let n = args.number(1, name)?;
    if alpha <= 0.0 {
        return Err(ExecError::Evaluation(format!(
            "{} needs a positive concentration, got {}",
            name, alpha
        )));
    }
    if n < 1.0 || n.fract() != 0.0 || n > u32::MAX as f64 {
        return Err(ExecError::Evaluation(format!(
            "{} needs a whole number of faces, got {}",
            name, n
        )));
    }
    Ok((alpha, n as usize))
}

fn face(value: &Value, n: usize) -> Result<usize, ExecError> {
    let x = value.expect_number("die face")?;
    if x >= 0.0 && x.fract() == 0.0 && x < n as f64 {
        Ok(x as usize)
    } else {
        Err(ExecError::Evaluation(format!(
            "{} is not a face of a {}-sided die",
            x, n
        )))
    }
}

fn sample_face(weights: &[f64], rng: &mut dyn RngCore) -> Result<Value, ExecError> {
    let logs: Vec<f64> = weights.iter().map(|w| w.ln()).collect();
    sample_log_categorical(&logs, rng)
        .map(|i| Value::Number(i as f64))
        .ok_or_else(|| ExecError::Numerical(format!("no face has positive weight in {:?}", weights)))
}

/// Normalised independent gamma draws.
fn sample_dirichlet(alpha: &[f64], rng: &mut dyn RngCore) -> Result<Vec<f64>, ExecError> {
    let mut draws = Vec::with_capacity(alpha.len());
    for a in alpha {
        let dist = Gamma::new(*a, 1.0)
            .map_err(|e| ExecError::Evaluation(format!("dirichlet({}): {}", a, e)))?;
        draws.push(dist.sample(&mut *rng));
    }
    let total: f64 = draws.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(ExecError::Numerical(format!(
            "dirichlet draw summed to {}",
            total
        )));
    }
    for x in &mut draws {
        *x /= total;
    }
    Ok(draws)
}

/// Face counts of a die, and its weights when they are explicit.
#[derive(Debug, Clone, Default)]
pub struct DieAux {
    pub counts: Vec<u64>,
    pub weights: Vec<f64>,
}

impl DieAux {
    fn new(n: usize) -> Self {
        Self {
            counts: vec![0; n],
            weights: Vec::new(),
        }
    }

    fn record(&mut self, face: usize, delta: i64) -> Result<(), ExecError> {
        let count = self
            .counts
            .get_mut(face)
            .ok_or_else(|| ExecError::Internal(format!("die has no face {}", face)))?;
        *count = count
            .checked_add_signed(delta)
            .ok_or_else(|| ExecError::Internal("die count went negative".into()))?;
        Ok(())
    }

    fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl SpAux for DieAux {
    fn clone_aux(&self) -> Box<dyn SpAux> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn statistics(&self) -> Vec<f64> {
        self.counts
            .iter()
            .map(|c| *c as f64)
            .chain(self.weights.iter().copied())
            .collect()
    }
}

fn record_roll(args: &Args, value: &Value, n: usize, delta: i64) -> Result<(), ExecError> {
    let face = face(value, n)?;
    with_aux::<DieAux, _>(args.aux()?, |aux| aux.record(face, delta))?
}

fn die_state(aux: &AuxHandle) -> Result<DieAux, ExecError> {
    with_aux::<DieAux, _>(aux, |aux| aux.clone())
}

#[derive(Debug)]
struct MakeSymDirMultOutputPsp;

impl Psp for MakeSymDirMultOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (alpha, n) = die_hyperparameters(args, "make_sym_dir_mult")?;
        Ok(Value::Procedure(MadeSp::new(Arc::new(CollapsedDieSp {
            n,
            output: Arc::new(CollapsedDieOutputPsp { alpha, n }),
        }))))
    }

    fn children_can_aaa(&self) -> bool {
        true
    }
}

struct CollapsedDieSp {
    n: usize,
    output: Arc<CollapsedDieOutputPsp>,
}

impl Procedure for CollapsedDieSp {
    fn name(&self) -> &str {
        "sym_dir_mult"
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        Arc::new(crate::engine::procedure::NullRequestPsp)
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        self.output.clone()
    }

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        Some(Box::new(DieAux::new(self.n)))
    }
}

#[derive(Debug)]
struct CollapsedDieOutputPsp {
    alpha: f64,
    n: usize,
}

impl CollapsedDieOutputPsp {
    /// Posterior pseudo-counts of each face.
    fn predictive(&self, args: &Args) -> Result<Vec<f64>, ExecError> {
        let state = die_state(args.aux()?)?;
        Ok(state.counts.iter().map(|c| self.alpha + *c as f64).collect())
    }
}

impl Psp for CollapsedDieOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("sym_dir_mult", 0, 0)?;
        sample_face(&self.predictive(args)?, rng)
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let weights = self.predictive(args)?;
        let total: f64 = weights.iter().sum();
        Ok((weights[face(value, self.n)?] / total).ln())
    }

    fn incorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_roll(args, value, self.n, 1)
    }

    fn unincorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_roll(args, value, self.n, -1)
    }

    fn is_random(&self) -> bool {
        true
    }

    fn log_density_of_counts(&self, aux: &dyn SpAux) -> Result<f64, ExecError> {
        let state = aux
            .as_any()
            .downcast_ref::<DieAux>()
            .ok_or_else(|| ExecError::Internal("sym_dir_mult state has unexpected type".into()))?;
        let a = self.alpha * self.n as f64;
        let mut ld = ln_gamma(a) - ln_gamma(state.total() as f64 + a);
        for count in &state.counts {
            ld += ln_gamma(self.alpha + *count as f64) - ln_gamma(self.alpha);
        }
        Ok(ld)
    }
}

// ---- make_uc_sym_dir_mult -----------------------------------------------

#[derive(Debug)]
struct MakeUcSymDirMultOutputPsp;

impl Psp for MakeUcSymDirMultOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (alpha, n) = die_hyperparameters(args, "make_uc_sym_dir_mult")?;
        let weights = sample_dirichlet(&vec![alpha; n], rng)?;
        let sp = UncollapsedDieSp {
            alpha,
            n,
            output: Arc::new(UncollapsedDieOutputPsp { n }),
        };
        let aux = new_aux(Box::new(DieAux {
            weights,
            ..DieAux::new(n)
        }));
        Ok(Value::Procedure(MadeSp::with_aux(Arc::new(sp), aux)))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (alpha, n) = die_hyperparameters(args, "make_uc_sym_dir_mult")?;
        let aux = match value {
            Value::Procedure(made) => made.aux.as_ref().or(args.made_aux.as_ref()),
            _ => args.made_aux.as_ref(),
        }
        .ok_or_else(|| ExecError::Internal("uncollapsed die without weights".into()))?;
        Ok(dirichlet_log_density(&die_state(aux)?.weights, &vec![alpha; n]))
    }

    fn is_random(&self) -> bool {
        true
    }
}

struct UncollapsedDieSp {
    alpha: f64,
    n: usize,
    output: Arc<UncollapsedDieOutputPsp>,
}

impl Procedure for UncollapsedDieSp {
    fn name(&self) -> &str {
        "uc_sym_dir_mult"
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        Arc::new(crate::engine::procedure::NullRequestPsp)
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        self.output.clone()
    }

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        Some(Box::new(DieAux {
            weights: vec![1.0 / self.n as f64; self.n],
            ..DieAux::new(self.n)
        }))
    }

    fn has_ae_kernel(&self) -> bool {
        true
    }

    /// Gibbs step on the weights given the current counts.
    fn ae_infer(&self, aux: &AuxHandle, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let state = die_state(aux)?;
        let posterior: Vec<f64> = state
            .counts
            .iter()
            .map(|c| self.alpha + *c as f64)
            .collect();
        let weights = sample_dirichlet(&posterior, rng)?;
        with_aux::<DieAux, _>(aux, |aux| aux.weights = weights)
    }
}

#[derive(Debug)]
struct UncollapsedDieOutputPsp {
    n: usize,
}

impl Psp for UncollapsedDieOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("uc_sym_dir_mult", 0, 0)?;
        sample_face(&die_state(args.aux()?)?.weights, rng)
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let weights = die_state(args.aux()?)?.weights;
        let face = face(value, self.n)?;
        weights
            .get(face)
            .map(|w| w.ln())
            .ok_or_else(|| ExecError::Internal(format!("die has no weight for face {}", face)))
    }

    fn incorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_roll(args, value, self.n, 1)
    }

    fn unincorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        record_roll(args, value, self.n, -1)
    }

    fn is_random(&self) -> bool {
        true
    }
}

pub(super) fn procedures() -> Vec<(&'static str, Arc<dyn Procedure>)> {
    let flip: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only("flip", Arc::new(FlipOutputPsp)));
    let bernoulli: Arc<dyn Procedure> =
        Arc::new(SimpleSp::output_only("bernoulli", Arc::new(FlipOutputPsp)));
    let collapsed: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "make_beta_bernoulli",
        Arc::new(MakeBetaBernoulliOutputPsp),
    ));
    let uncollapsed: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "make_ubeta_bernoulli",
        Arc::new(MakeUBetaBernoulliOutputPsp),
    ));
    let collapsed_die: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "make_sym_dir_mult",
        Arc::new(MakeSymDirMultOutputPsp),
    ));
    let uncollapsed_die: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "make_uc_sym_dir_mult",
        Arc::new(MakeUcSymDirMultOutputPsp),
    ));
    vec![
        ("flip", flip),
        ("bernoulli", bernoulli),
        ("make_beta_bernoulli", collapsed),
        ("make_ubeta_bernoulli", uncollapsed),
        ("make_sym_dir_mult", collapsed_die),
        ("make_uc_sym_dir_mult", uncollapsed_die),
    ]
}
