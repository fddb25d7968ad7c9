//! Conditional sequential Monte Carlo (particle Gibbs) over a multi-stage
//! scaffold.
//!
//! Every border stage is detached from the trace, then `P` fresh particles
//! and one particle that replays the old state are regenerated stage by
//! stage, resampling ancestors between stages. Particles only read the base
//! trace, so fresh particles can be regenerated in parallel.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::engine::db::Db;
use crate::engine::detach::detach_and_extract;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::NodeId;
use crate::engine::numeric::{logsumexp, sample_log_categorical};
use crate::engine::particle::{Particle, TraceDelta};
use crate::engine::regen::regen_and_attach;
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::Trace;

use super::Operator;

struct Pending {
    rho_dbs: Vec<Db>,
    chosen: TraceDelta,
    old: TraceDelta,
}

pub struct PGibbsOperator {
    particles: usize,
    parallel: bool,
    pending: Option<Pending>,
}

impl PGibbsOperator {
    pub fn new(particles: usize, parallel: bool) -> Result<Self, ExecError> {
        if particles == 0 {
            return Err(ExecError::ValidationError(
                "pgibbs needs at least one particle".into(),
            ));
        }
        Ok(Self {
            particles,
            parallel,
            pending: None,
        })
    }
}

/// Index drawn in proportion to `exp(weights)`, uniform when every weight is
/// impossible.
fn choose(weights: &[f64], rng: &mut dyn RngCore) -> usize {
    sample_log_categorical(weights, rng).unwrap_or_else(|| rng.random_range(0..weights.len()))
}

/// Regenerates `border` into each particle with a fresh record and its own
/// seeded generator.
fn regen_fresh<'a>(
    particles: Vec<Particle<'a>>,
    border: &[NodeId],
    scaffold: &Scaffold,
    seeds: Vec<u64>,
    parallel: bool,
) -> Result<Vec<(Particle<'a>, f64)>, ExecError> {
    let regen_one = |(mut particle, seed): (Particle<'a>, u64)| -> Result<(Particle<'a>, f64), ExecError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut db = Db::new();
        let weight = regen_and_attach(&mut particle, border, scaffold, false, &mut db, None, &mut rng)?;
        Ok((particle, weight))
    };

    #[cfg(feature = "parallel")]
    if parallel {
        return particles
            .into_par_iter()
            .zip(seeds.into_par_iter())
            .map(&regen_one)
            .collect();
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;

    particles.into_iter().zip(seeds).map(&regen_one).collect()
}

impl Operator for PGibbsOperator {
    fn name(&self) -> &'static str {
        "pgibbs"
    }

    fn propose(
        &mut self,
        trace: &mut Trace,
        scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let stages = scaffold.num_stages();
        let p = self.particles;

        let mut rho_dbs = Vec::with_capacity(stages);
        for t in (0..stages).rev() {
            let border = scaffold.border_stage(t)?.to_vec();
            let (_, db) = detach_and_extract(trace, &border, &scaffold)?;
            rho_dbs.push(db);
        }
        rho_dbs.reverse();
        scaffold.check_torus()?;

        let base: &Trace = trace;
        let border = scaffold.border_stage(0)?;
        let seeds = (0..p).map(|_| rng.next_u64()).collect();
        let fresh = (0..p).map(|_| Particle::new(base)).collect();
        let mut weighted = regen_fresh(fresh, border, &scaffold, seeds, self.parallel)?;
        let mut old = Particle::new(base);
        let mut old_weight =
            regen_and_attach(&mut old, border, &scaffold, true, &mut rho_dbs[0], None, rng)?;

        for (t, rho_db) in rho_dbs.iter_mut().enumerate().skip(1) {
            let weights: Vec<f64> = weighted
                .iter()
                .map(|(_, w)| *w)
                .chain(std::iter::once(old_weight))
                .collect();
            let ancestors: Vec<Particle<'_>> = (0..p)
                .map(|_| match choose(&weights, &mut *rng) {
                    i if i == p => old.fork(),
                    i => weighted[i].0.fork(),
                })
                .collect();
            let border = scaffold.border_stage(t)?;
            let seeds = (0..p).map(|_| rng.next_u64()).collect();
            weighted = regen_fresh(ancestors, border, &scaffold, seeds, self.parallel)?;
            let mut next_old = old.fork();
            old_weight = regen_and_attach(&mut next_old, border, &scaffold, true, rho_db, None, rng)?;
            old = next_old;
        }

        let fresh_weights: Vec<f64> = weighted.iter().map(|(_, w)| *w).collect();
        let chosen = choose(&fresh_weights, rng);
        let mut all_weights = fresh_weights.clone();
        all_weights.push(old_weight);
        let without_old = logsumexp(&fresh_weights);
        let without_chosen = {
            let mut rest = all_weights;
            rest.remove(chosen);
            logsumexp(&rest)
        };
        let alpha = without_old - without_chosen;

        #[cfg(feature = "tracing")]
        tracing::debug!(particles = p, stages, chosen, alpha, "pgibbs proposal");

        let chosen_delta = weighted.swap_remove(chosen).0.into_delta();
        let old_delta = old.into_delta();
        self.pending = Some(Pending {
            rho_dbs,
            chosen: chosen_delta,
            old: old_delta,
        });
        Ok(if alpha.is_nan() { f64::NEG_INFINITY } else { alpha })
    }

    fn accept(&mut self, trace: &mut Trace) -> Result<(), ExecError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| invariant("pgibbs: accept without a proposal"))?;
        trace.commit(pending.chosen)?;
        for db in &pending.rho_dbs {
            trace.reclaim(db);
        }
        Ok(())
    }

    fn reject(&mut self, trace: &mut Trace, _rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| invariant("pgibbs: reject without a proposal"))?;
        trace.commit(pending.old)
    }

    fn pending(&self) -> Option<&TraceDelta> {
        self.pending.as_ref().map(|p| &p.chosen)
    }
}
