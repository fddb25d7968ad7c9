//! Resimulation Metropolis-Hastings, in place on the trace.

use rand::RngCore;

use crate::engine::db::Db;
use crate::engine::detach::detach_and_extract;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::NodeId;
use crate::engine::regen::regen_and_attach;
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::Trace;

use super::{mh_weight, Operator};

/// Proposes by detaching the scaffold and resimulating it.
#[derive(Debug, Default)]
pub struct MhOperator {
    pending: Option<(Scaffold, Db)>,
}

impl MhOperator {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_pending(&mut self) -> Result<(Scaffold, Db), ExecError> {
        self.pending
            .take()
            .ok_or_else(|| invariant("mh: accept or reject without a proposal"))
    }
}

/// Border of a single-stage scaffold; multi-stage scaffolds are for
/// particle methods.
pub(super) fn single_stage_border(
    scaffold: &Scaffold,
    kernel: &str,
) -> Result<Vec<NodeId>, ExecError> {
    if scaffold.num_stages() != 1 {
        return Err(ExecError::CapabilityMissing(format!(
            "{} needs a single-stage block selector, got {} stages",
            kernel,
            scaffold.num_stages()
        )));
    }
    Ok(scaffold.border_stage(0)?.to_vec())
}

impl Operator for MhOperator {
    fn name(&self) -> &'static str {
        "mh"
    }

    fn propose(
        &mut self,
        trace: &mut Trace,
        scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let border = single_stage_border(&scaffold, self.name())?;
        let (rho, mut db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        let xi = regen_and_attach(trace, &border, &scaffold, false, &mut db, None, rng)?;
        self.pending = Some((scaffold, db));
        Ok(mh_weight(xi, rho))
    }

    fn accept(&mut self, trace: &mut Trace) -> Result<(), ExecError> {
        let (_, rho_db) = self.take_pending()?;
        trace.reclaim(&rho_db);
        Ok(())
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let (scaffold, mut rho_db) = self.take_pending()?;
        let border = scaffold.border_stage(0)?.to_vec();
        let (_, xi_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        regen_and_attach(trace, &border, &scaffold, true, &mut rho_db, None, rng)?;
        trace.reclaim(&xi_db);
        Ok(())
    }
}
