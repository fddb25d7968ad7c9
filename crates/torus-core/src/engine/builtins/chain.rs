//! `make_latent_chain`: a two-state hidden Markov chain of unbounded length.
//!
//! `(make_latent_chain init stay emit)` makes a procedure that, applied to a
//! time step `n`, emits a noisy reading of the hidden state `x_n`. The hidden
//! states are latents: they live in the procedure's auxiliary state, are
//! extended on demand through latent requests, and are resampled jointly by a
//! forward-filter backward-sample sweep.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, RngCore};

use crate::engine::errors::{invariant, ExecError};
use crate::engine::numeric::bernoulli_log_density;
use crate::engine::procedure::{
    with_aux, Args, AuxHandle, LatentDb, Procedure, Psp, SimpleSp, SpAux,
};
use crate::engine::value::{MadeSp, RequestValue, Value};

/// Hidden states detached into a DB, by time step.
type DetachedStates = BTreeMap<usize, bool>;

fn probability(x: f64, what: &str) -> Result<f64, ExecError> {
    if (0.0..=1.0).contains(&x) {
        Ok(x)
    } else {
        Err(ExecError::Evaluation(format!("{} must lie in [0, 1], got {}", what, x)))
    }
}

fn time_step(value: &Value) -> Result<usize, ExecError> {
    let n = value.expect_number("chain time step")?;
    if n < 0.0 || n.fract() != 0.0 || !n.is_finite() {
        return Err(ExecError::Evaluation(format!(
            "chain time step must be a non-negative integer, got {}",
            n
        )));
    }
    Ok(n as usize)
}

fn coin(p: f64, rng: &mut dyn RngCore) -> bool {
    rng.random::<f64>() < p
}

/// Hidden trajectory plus the readings incorporated at each step.
#[derive(Debug, Clone, Default)]
pub struct ChainAux {
    pub xs: Vec<bool>,
    pub os: BTreeMap<usize, Vec<bool>>,
}

impl SpAux for ChainAux {
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
        let mut stats: Vec<f64> = self.xs.iter().map(|&x| f64::from(u8::from(x))).collect();
        for (n, readings) in &self.os {
            stats.push(*n as f64);
            stats.extend(readings.iter().map(|&o| f64::from(u8::from(o))));
        }
        stats
    }
}

#[derive(Debug)]
struct MakeLatentChainOutputPsp;

impl Psp for MakeLatentChainOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("make_latent_chain", 3, 3)?;
        let chain = LatentChainSp {
            init: probability(args.number(0, "chain init")?, "chain init")?,
            stay: probability(args.number(1, "chain stay")?, "chain stay")?,
            emit: probability(args.number(2, "chain emit")?, "chain emit")?,
        };
        Ok(Value::Procedure(MadeSp::new(Arc::new(chain))))
    }
}

#[derive(Debug, Clone, Copy)]
struct LatentChainSp {
    /// Probability that `x_0` is true.
    init: f64,
    /// Probability that the state persists between steps.
    stay: f64,
    /// Probability that a reading matches the hidden state.
    emit: f64,
}

impl LatentChainSp {
    fn transition(&self, from: bool, to: bool) -> f64 {
        if from == to {
            self.stay
        } else {
            1.0 - self.stay
        }
    }

    fn likelihood(&self, state: bool, readings: &[bool]) -> f64 {
        readings
            .iter()
            .map(|&o| if o == state { self.emit } else { 1.0 - self.emit })
            .product()
    }

    fn forward_filter(&self, aux: &ChainAux) -> Vec<[f64; 2]> {
        let mut filtered = Vec::with_capacity(aux.xs.len());
        let mut prior = [1.0 - self.init, self.init];
        for i in 0..aux.xs.len() {
            if i > 0 {
                let prev: [f64; 2] = filtered[i - 1];
                prior = [false, true].map(|to| {
                    prev[0] * self.transition(false, to) + prev[1] * self.transition(true, to)
                });
            }
            let readings = aux.os.get(&i).map(Vec::as_slice).unwrap_or(&[]);
            let mut f = [
                prior[0] * self.likelihood(false, readings),
                prior[1] * self.likelihood(true, readings),
            ];
            let total = f[0] + f[1];
            if total > 0.0 {
                f = [f[0] / total, f[1] / total];
            } else {
                f = [0.5, 0.5];
            }
            filtered.push(f);
        }
        filtered
    }
}

impl Procedure for LatentChainSp {
    fn name(&self) -> &str {
        "latent_chain"
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        Arc::new(ChainRequestPsp)
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        Arc::new(ChainOutputPsp { emit: self.emit })
    }

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        Some(Box::new(ChainAux::default()))
    }

    fn construct_latent_db(&self) -> Option<LatentDb> {
        Some(Box::new(DetachedStates::new()))
    }

    fn simulate_latents(
        &self,
        aux: &AuxHandle,
        lsr: &Value,
        restore: bool,
        latent_db: Option<&mut LatentDb>,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let n = time_step(lsr)?;
        let detached = match latent_db {
            Some(db) => (**db).downcast_mut::<DetachedStates>(),
            None => None,
        };
        if restore && detached.is_none() {
            return Err(invariant("restoring chain states without a record"));
        }
        let chain = *self;
        with_aux::<ChainAux, _>(aux, |aux| {
            for i in aux.xs.len()..=n {
                let x = match (restore, detached.as_ref()) {
                    (true, Some(db)) => *db.get(&i).ok_or_else(|| {
                        invariant(format!("chain state {} was never detached", i))
                    })?,
                    _ if i == 0 => coin(chain.init, &mut *rng),
                    _ => {
                        let prev = aux.xs[i - 1];
                        coin(chain.transition(prev, true), &mut *rng)
                    }
                };
                aux.xs.push(x);
            }
            Ok(0.0)
        })?
    }

    fn detach_latents(
        &self,
        aux: &AuxHandle,
        lsr: &Value,
        latent_db: &mut LatentDb,
    ) -> Result<f64, ExecError> {
        let n = time_step(lsr)?;
        let detached = (**latent_db)
            .downcast_mut::<DetachedStates>()
            .ok_or_else(|| ExecError::Internal("chain latent record has unexpected type".into()))?;
        with_aux::<ChainAux, _>(aux, |aux| {
            // Only the tail beyond the last reading is released.
            if aux.xs.len() != n + 1 || aux.os.contains_key(&n) {
                return;
            }
            let keep = aux.os.keys().next_back().map_or(0, |last| last + 1);
            while aux.xs.len() > keep {
                let i = aux.xs.len() - 1;
                if let Some(x) = aux.xs.pop() {
                    detached.insert(i, x);
                }
            }
        })?;
        Ok(0.0)
    }

    fn has_ae_kernel(&self) -> bool {
        true
    }

    /// Resamples the whole trajectory given the readings.
    fn ae_infer(&self, aux: &AuxHandle, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        with_aux::<ChainAux, _>(aux, |aux| {
            if aux.os.is_empty() || aux.xs.is_empty() {
                return;
            }
            let filtered = self.forward_filter(aux);
            let last = aux.xs.len() - 1;
            aux.xs[last] = coin(filtered[last][1], &mut *rng);
            for i in (0..last).rev() {
                let next = aux.xs[i + 1];
                let f = [
                    filtered[i][0] * self.transition(false, next),
                    filtered[i][1] * self.transition(true, next),
                ];
                let total = f[0] + f[1];
                let p_true = if total > 0.0 { f[1] / total } else { 0.5 };
                aux.xs[i] = coin(p_true, &mut *rng);
            }
        })
    }
}

/// Asks for the hidden state at the requested step.
#[derive(Debug)]
struct ChainRequestPsp;

impl Psp for ChainRequestPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("latent_chain", 1, 1)?;
        let n = time_step(&args.operands[0])?;
        Ok(Value::Request(Arc::new(RequestValue {
            esrs: Vec::new(),
            lsrs: vec![Value::Number(n as f64)],
        })))
    }
}

#[derive(Debug)]
struct ChainOutputPsp {
    emit: f64,
}

impl ChainOutputPsp {
    fn reading_probability(&self, args: &Args) -> Result<(usize, f64), ExecError> {
        args.check_arity("latent_chain", 1, 1)?;
        let n = time_step(&args.operands[0])?;
        let state = with_aux::<ChainAux, _>(args.aux()?, |aux| aux.xs.get(n).copied())?
            .ok_or_else(|| invariant(format!("chain state {} was never simulated", n)))?;
        let p = if state { self.emit } else { 1.0 - self.emit };
        Ok((n, p))
    }

    fn record(&self, value: &Value, args: &Args, add: bool) -> Result<(), ExecError> {
        let n = time_step(&args.operands[0])?;
        let reading = value.expect_bool("chain reading")?;
        with_aux::<ChainAux, _>(args.aux()?, |aux| {
            if add {
                aux.os.entry(n).or_default().push(reading);
                return Ok(());
            }
            let readings = aux
                .os
                .get_mut(&n)
                .ok_or_else(|| invariant(format!("no readings at step {}", n)))?;
            let at = readings
                .iter()
                .position(|&o| o == reading)
                .ok_or_else(|| invariant(format!("reading {} not recorded at {}", reading, n)))?;
            readings.remove(at);
            if readings.is_empty() {
                aux.os.remove(&n);
            }
            Ok(())
        })?
    }
}

impl Psp for ChainOutputPsp {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let (_, p) = self.reading_probability(args)?;
        Ok(Value::Bool(coin(p, rng)))
    }

    fn log_density(&self, value: &Value, args: &Args) -> Result<f64, ExecError> {
        let (_, p) = self.reading_probability(args)?;
        Ok(bernoulli_log_density(value.expect_bool("chain reading")?, p))
    }

    fn incorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        self.record(value, args, true)
    }

    fn unincorporate(&self, value: &Value, args: &Args) -> Result<(), ExecError> {
        self.record(value, args, false)
    }

    fn is_random(&self) -> bool {
        true
    }
}

pub(super) fn procedures() -> Vec<(&'static str, Arc<dyn Procedure>)> {
    let maker: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "make_latent_chain",
        Arc::new(MakeLatentChainOutputPsp),
    ));
    vec![("make_latent_chain", maker)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::procedure::new_aux;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const CHAIN: LatentChainSp = LatentChainSp {
        init: 0.5,
        stay: 0.9,
        emit: 0.95,
    };

    fn states(aux: &AuxHandle) -> Vec<bool> {
        with_aux::<ChainAux, _>(aux, |aux| aux.xs.clone()).unwrap()
    }

    #[test]
    fn latents_extend_on_demand_and_restore_exactly() {
        let mut rng = StdRng::seed_from_u64(3);
        let aux = new_aux(Box::new(ChainAux::default()));
        CHAIN
            .simulate_latents(&aux, &Value::Number(4.0), false, None, &mut rng)
            .unwrap();
        let before = states(&aux);
        assert_eq!(before.len(), 5);

        let mut db = CHAIN.construct_latent_db().unwrap();
        CHAIN
            .detach_latents(&aux, &Value::Number(4.0), &mut db)
            .unwrap();
        assert!(states(&aux).is_empty());

        CHAIN
            .simulate_latents(&aux, &Value::Number(4.0), true, Some(&mut db), &mut rng)
            .unwrap();
        assert_eq!(states(&aux), before);
    }

    #[test]
    fn detach_keeps_states_up_to_the_last_reading() {
        let mut rng = StdRng::seed_from_u64(5);
        let aux = new_aux(Box::new(ChainAux::default()));
        CHAIN
            .simulate_latents(&aux, &Value::Number(6.0), false, None, &mut rng)
            .unwrap();
        with_aux::<ChainAux, _>(&aux, |aux| aux.os.insert(2, vec![true])).unwrap();

        let mut db = CHAIN.construct_latent_db().unwrap();
        CHAIN
            .detach_latents(&aux, &Value::Number(6.0), &mut db)
            .unwrap();
        assert_eq!(states(&aux).len(), 3);
    }

    #[test]
    fn sweep_follows_confident_readings() {
        let mut rng = StdRng::seed_from_u64(9);
        let chain = LatentChainSp {
            init: 0.5,
            stay: 0.5,
            emit: 0.999,
        };
        let aux = new_aux(Box::new(ChainAux {
            xs: vec![false; 4],
            os: (0..4).map(|i| (i, vec![i % 2 == 0; 3])).collect(),
        }));
        chain.ae_infer(&aux, &mut rng).unwrap();
        assert_eq!(states(&aux), vec![true, false, true, false]);
    }
}
