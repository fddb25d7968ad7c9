//! Functional Metropolis-Hastings: the proposal is regenerated into a
//! [`Particle`] and only merged into the trace on acceptance.

use rand::RngCore;

use crate::engine::db::Db;
use crate::engine::detach::detach_and_extract;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::particle::{Particle, TraceDelta};
use crate::engine::regen::regen_and_attach;
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::Trace;

use super::mh::single_stage_border;
use super::{mh_weight, Operator};

struct Pending {
    scaffold: Scaffold,
    rho_db: Db,
    proposal: TraceDelta,
}

#[derive(Default)]
pub struct FuncMhOperator {
    pending: Option<Pending>,
}

impl FuncMhOperator {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_pending(&mut self) -> Result<Pending, ExecError> {
        self.pending
            .take()
            .ok_or_else(|| invariant("func_mh: accept or reject without a proposal"))
    }
}

impl Operator for FuncMhOperator {
    fn name(&self) -> &'static str {
        "func_mh"
    }

    fn propose(
        &mut self,
        trace: &mut Trace,
        scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let border = single_stage_border(&scaffold, self.name())?;
        let (rho, mut rho_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;

        let mut particle = Particle::new(trace);
        let xi = regen_and_attach(&mut particle, &border, &scaffold, false, &mut rho_db, None, rng)?;
        let proposal = particle.into_delta();

        #[cfg(feature = "tracing")]
        tracing::trace!(new_nodes = proposal.num_new_nodes(), xi, rho, "func_mh proposal");

        self.pending = Some(Pending {
            scaffold,
            rho_db,
            proposal,
        });
        Ok(mh_weight(xi, rho))
    }

    fn accept(&mut self, trace: &mut Trace) -> Result<(), ExecError> {
        let pending = self.take_pending()?;
        trace.commit(pending.proposal)?;
        trace.reclaim(&pending.rho_db);
        Ok(())
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let mut pending = self.take_pending()?;
        let border = pending.scaffold.border_stage(0)?.to_vec();
        regen_and_attach(
            trace,
            &border,
            &pending.scaffold,
            true,
            &mut pending.rho_db,
            None,
            rng,
        )?;
        Ok(())
    }

    fn pending(&self) -> Option<&TraceDelta> {
        self.pending.as_ref().map(|p| &p.proposal)
    }
}
