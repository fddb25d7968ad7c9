//! Mean-field variational proposals.
//!
//! Resampled output nodes whose procedure offers a variational family get a
//! [`VariationalLKernel`] initialised from their operands. The kernels are
//! trained by stochastic gradient ascent on the regeneration weight, then
//! used as an independence proposal inside an ordinary MH step.

use rand::RngCore;

use crate::engine::db::Db;
use crate::engine::detach::detach_and_extract;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::lkernel::{LKernel, VariationalLKernel};
use crate::engine::node::NodeId;
use crate::engine::regen::{regen_and_attach, Gradients};
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{Trace, TraceOps};

use super::mh::single_stage_border;
use super::{mh_weight, Operator};

pub struct MeanFieldOperator {
    iterations: usize,
    step_size: f64,
    pending: Option<(Scaffold, Db)>,
}

impl MeanFieldOperator {
    pub fn new(iterations: usize, step_size: f64) -> Self {
        Self {
            iterations,
            step_size,
            pending: None,
        }
    }

    /// Installs a variational kernel on every eligible node and returns the
    /// nodes that received one.
    fn register_kernels(
        trace: &mut Trace,
        scaffold: &mut Scaffold,
    ) -> Result<Vec<NodeId>, ExecError> {
        let mut registered = Vec::new();
        for node in scaffold.resampling_nodes() {
            let entry = trace.node(node)?;
            let Some(operator) = entry.operator().filter(|_| entry.is_output()) else {
                continue;
            };
            if scaffold.is_resampling(operator) {
                continue;
            }
            let psp = trace.psp_at(node)?;
            if psp.variational().is_none() {
                continue;
            }
            let args = trace.args_at(node)?;
            scaffold.set_lkernel(node, LKernel::Variational(VariationalLKernel::new(psp, &args)?));
            registered.push(node);
        }
        Ok(registered)
    }

    fn train(
        &self,
        trace: &mut Trace,
        border: &[NodeId],
        scaffold: &mut Scaffold,
        kernels: &[NodeId],
        rng: &mut dyn RngCore,
    ) -> Result<(), ExecError> {
        for _ in 0..self.iterations {
            let mut gradients = Gradients::default();
            let mut db = Db::new();
            let gain = regen_and_attach(trace, border, scaffold, false, &mut db, Some(&mut gradients), rng)?;
            let (_, fresh_db) = detach_and_extract(trace, border, scaffold)?;
            scaffold.check_torus()?;
            trace.reclaim(&fresh_db);

            if !gain.is_finite() {
                #[cfg(feature = "tracing")]
                tracing::trace!(gain, "skipping mean-field update");
                continue;
            }
            for node in kernels {
                let (Some(gradient), Some(kernel)) = (
                    gradients.get(node),
                    scaffold.lkernel_mut(*node).and_then(LKernel::as_variational_mut),
                ) else {
                    continue;
                };
                kernel.update_parameters(gradient, gain, self.step_size);
            }
        }
        Ok(())
    }
}

impl Operator for MeanFieldOperator {
    fn name(&self) -> &'static str {
        "meanfield"
    }

    fn propose(
        &mut self,
        trace: &mut Trace,
        mut scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let border = single_stage_border(&scaffold, self.name())?;
        let kernels = Self::register_kernels(trace, &mut scaffold)?;

        let (_, mut first_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        let trained = self.train(trace, &border, &mut scaffold, &kernels, rng);
        regen_and_attach(trace, &border, &scaffold, true, &mut first_db, None, rng)?;
        trained?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            kernels = kernels.len(),
            iterations = self.iterations,
            "mean-field kernels trained"
        );

        let (rho, mut rho_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        let xi = regen_and_attach(trace, &border, &scaffold, false, &mut rho_db, None, rng)?;
        self.pending = Some((scaffold, rho_db));
        Ok(mh_weight(xi, rho))
    }

    fn accept(&mut self, trace: &mut Trace) -> Result<(), ExecError> {
        let (_, rho_db) = self
            .pending
            .take()
            .ok_or_else(|| invariant("meanfield: accept without a proposal"))?;
        trace.reclaim(&rho_db);
        Ok(())
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let (scaffold, mut rho_db) = self
            .pending
            .take()
            .ok_or_else(|| invariant("meanfield: reject without a proposal"))?;
        let border = scaffold.border_stage(0)?.to_vec();
        let (_, xi_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        regen_and_attach(trace, &border, &scaffold, true, &mut rho_db, None, rng)?;
        trace.reclaim(&xi_db);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::driver::Engine;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    #[test]
    fn training_leaves_the_scaffold_on_its_torus() {
        let mut engine = Engine::with_seed(17);
        let mu = engine.assume("mu", "(normal 0 1)").unwrap();
        engine.observe("(normal mu 1)", 0.4).unwrap();
        engine.make_consistent().unwrap();
        let mu = engine.directive_root(mu).unwrap();
        let trace = engine.trace_mut();
        let before = trace.value(mu);
        let live = trace.live_node_count();

        let mut scaffold = Scaffold::build(trace, vec![BTreeSet::from([mu])], false).unwrap();
        let border = scaffold.border_stage(0).unwrap().to_vec();
        let kernels = MeanFieldOperator::register_kernels(trace, &mut scaffold).unwrap();
        assert_eq!(kernels, vec![mu]);

        let (_, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let operator = MeanFieldOperator::new(15, 0.01);
        operator
            .train(trace, &border, &mut scaffold, &kernels, &mut rng)
            .unwrap();
        assert!(scaffold.is_torus());

        regen_and_attach(trace, &border, &scaffold, true, &mut db, None, &mut rng).unwrap();
        assert_eq!(trace.value(mu), before);
        assert_eq!(trace.live_node_count(), live);
    }
}
