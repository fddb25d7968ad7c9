//! Univariate slice sampling (step-out and shrink) over one continuous
//! principal node.
//!
//! The log-density oracle pins the principal node to a candidate value with a
//! deterministic local kernel and regenerates the scaffold into a throwaway
//! [`Particle`]; the trace itself is only touched by the initial detach and
//! the final regeneration at the accepted value.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::engine::db::Db;
use crate::engine::detach::detach_and_extract;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::lkernel::LKernel;
use crate::engine::node::NodeId;
use crate::engine::particle::Particle;
use crate::engine::procedure::Psp;
use crate::engine::regen::regen_and_attach;
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{Trace, TraceOps};
use crate::engine::value::Value;

use super::Operator;

/// Step-out and shrink budgets.
#[derive(Debug, Clone, Copy)]
pub struct SliceParams {
    /// Step-out width.
    pub width: f64,
    /// Maximum number of step-out steps, split between the two ends.
    pub max_steps: u64,
    /// Maximum number of shrink draws before keeping the current value.
    pub max_shrinks: u64,
}

impl Default for SliceParams {
    fn default() -> Self {
        Self {
            width: 0.5,
            max_steps: 1_000_000,
            max_shrinks: 1_000,
        }
    }
}

struct Target {
    pnode: NodeId,
    psp: Arc<dyn Psp>,
    x0: f64,
    low: f64,
    high: f64,
}

pub struct SliceOperator {
    params: SliceParams,
    pending: Option<(Scaffold, Db)>,
}

impl SliceOperator {
    pub fn new(params: SliceParams) -> Self {
        Self {
            params,
            pending: None,
        }
    }

    /// Checks the principal node before anything is detached.
    fn target(trace: &mut Trace, scaffold: &Scaffold) -> Result<Target, ExecError> {
        let pnode = scaffold.single_principal()?;
        let psp = trace.psp_at(pnode)?;
        let args = trace.args_at(pnode)?;
        let (low, high) = psp.support(&args).ok_or_else(|| {
            ExecError::CapabilityMissing(format!(
                "slice sampling needs a continuous node with support bounds; {:?} has none",
                psp
            ))
        })?;
        let x0 = match trace.value(pnode) {
            Some(Value::Number(x)) => x,
            other => {
                return Err(ExecError::CapabilityMissing(format!(
                    "slice sampling needs a numeric value at {}, found {:?}",
                    pnode, other
                )))
            }
        };
        if scaffold.is_brush(pnode) {
            return Err(ExecError::CapabilityMissing(format!(
                "cannot pin {} whose existence is conditional",
                pnode
            )));
        }
        Ok(Target {
            pnode,
            psp,
            x0,
            low,
            high,
        })
    }
}

/// Log-density of the detached scaffold with the principal node pinned to
/// `x`, evaluated without touching the trace.
struct Oracle<'t> {
    trace: &'t Trace,
    border: &'t [NodeId],
    seed: u64,
}

impl Oracle<'_> {
    fn log_density(&self, scaffold: &mut Scaffold, target: &Target, x: f64) -> Result<f64, ExecError> {
        scaffold.set_lkernel(
            target.pnode,
            LKernel::Deterministic {
                psp: target.psp.clone(),
                value: Value::Number(x),
            },
        );
        let mut particle = Particle::new(self.trace);
        let mut db = Db::new();
        let mut rng = StdRng::seed_from_u64(self.seed);
        regen_and_attach(&mut particle, self.border, scaffold, false, &mut db, None, &mut rng)
    }
}

impl SliceOperator {
    fn sample(
        &self,
        oracle: &Oracle<'_>,
        scaffold: &mut Scaffold,
        target: &Target,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let SliceParams {
            width,
            max_steps,
            max_shrinks,
        } = self.params;
        let x0 = target.x0;
        let log_y = oracle.log_density(scaffold, target, x0)? + rng.random::<f64>().ln();

        let mut left = x0 - width * rng.random::<f64>();
        let mut right = left + width;
        let mut j = (max_steps as f64 * rng.random::<f64>()).floor() as u64;
        let mut k = max_steps.saturating_sub(1).saturating_sub(j);
        while j > 0 && left > target.low && oracle.log_density(scaffold, target, left)? > log_y {
            left -= width;
            j -= 1;
        }
        while k > 0 && right < target.high && oracle.log_density(scaffold, target, right)? > log_y {
            right += width;
            k -= 1;
        }
        left = left.max(target.low);
        right = right.min(target.high);

        for _ in 0..max_shrinks {
            let x1 = left + rng.random::<f64>() * (right - left);
            if oracle.log_density(scaffold, target, x1)? >= log_y {
                return Ok(x1);
            }
            if x1 < x0 {
                left = x1;
            } else {
                right = x1;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(node = %target.pnode, x0, "slice shrink budget exhausted");

        Ok(x0)
    }
}

impl Operator for SliceOperator {
    fn name(&self) -> &'static str {
        "slice"
    }

    fn propose(
        &mut self,
        trace: &mut Trace,
        mut scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        let border = super::mh::single_stage_border(&scaffold, self.name())?;
        let target = Self::target(trace, &scaffold)?;

        let (_, mut rho_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;

        let seed = rng.next_u64();
        let sampled = {
            let oracle = Oracle {
                trace: &*trace,
                border: &border,
                seed,
            };
            self.sample(&oracle, &mut scaffold, &target, rng)
        };
        let x1 = match sampled {
            Ok(x1) => x1,
            Err(err) => {
                scaffold.remove_lkernel(target.pnode);
                regen_and_attach(trace, &border, &scaffold, true, &mut rho_db, None, rng)?;
                return Err(err);
            }
        };

        scaffold.set_lkernel(
            target.pnode,
            LKernel::Deterministic {
                psp: target.psp.clone(),
                value: Value::Number(x1),
            },
        );
        regen_and_attach(trace, &border, &scaffold, false, &mut rho_db, None, rng)?;
        // Rejection has to restore the old value rather than re-pin the new one.
        scaffold.remove_lkernel(target.pnode);
        self.pending = Some((scaffold, rho_db));
        Ok(0.0)
    }

    fn accept(&mut self, trace: &mut Trace) -> Result<(), ExecError> {
        let (_, rho_db) = self
            .pending
            .take()
            .ok_or_else(|| invariant("slice: accept without a proposal"))?;
        trace.reclaim(&rho_db);
        Ok(())
    }

    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) -> Result<(), ExecError> {
        let (scaffold, mut rho_db) = self
            .pending
            .take()
            .ok_or_else(|| invariant("slice: reject without a proposal"))?;
        let border = scaffold.border_stage(0)?.to_vec();
        let (_, xi_db) = detach_and_extract(trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        regen_and_attach(trace, &border, &scaffold, true, &mut rho_db, None, rng)?;
        trace.reclaim(&xi_db);
        Ok(())
    }
}
