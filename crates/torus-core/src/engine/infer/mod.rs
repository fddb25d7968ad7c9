//! # Inference Kernels
//!
//! Every kernel follows the same protocol: an [`Operator`] proposes a change
//! to the trace along a [`Scaffold`] and reports a log weight, [`mix_mh`]
//! applies the Metropolis criterion, and the operator either accepts or
//! restores the trace exactly.
//!
//! Scaffolds are chosen by a [`ScaffoldIndexer`]: a scope plus a
//! [`BlockSelector`].

pub mod func_mh;
pub mod meanfield;
pub mod mh;
pub mod pgibbs;
pub mod slice;

use std::collections::BTreeSet;
use std::fmt;

use rand::{Rng, RngCore};

use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::{BlockId, NodeId, ScopeId};
use crate::engine::particle::TraceDelta;
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{Trace, TraceOps};

pub use func_mh::FuncMhOperator;
pub use meanfield::MeanFieldOperator;
pub use mh::MhOperator;
pub use pgibbs::PGibbsOperator;
pub use slice::SliceOperator;

/// Which blocks of a scope become principal nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockSelector {
    /// One block, chosen uniformly.
    One,
    /// Every block at once, as a single stage.
    All,
    /// Nothing; the transition is a no-op.
    None,
    /// Every block, one stage per block in block order.
    Ordered,
    /// Blocks in `[min, max]`, one stage each.
    OrderedRange(BlockId, BlockId),
    /// A specific block.
    Block(BlockId),
}

impl fmt::Display for BlockSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSelector::One => write!(f, "one"),
            BlockSelector::All => write!(f, "all"),
            BlockSelector::None => write!(f, "none"),
            BlockSelector::Ordered => write!(f, "ordered"),
            BlockSelector::OrderedRange(min, max) => write!(f, "(ordered_range {} {})", min, max),
            BlockSelector::Block(block) => write!(f, "{}", block),
        }
    }
}

/// Builds the scaffold for one transition.
#[derive(Debug, Clone)]
pub struct ScaffoldIndexer {
    pub scope: ScopeId,
    pub block: BlockSelector,
    pub use_delta_kernels: bool,
}

impl ScaffoldIndexer {
    pub fn new(scope: ScopeId, block: BlockSelector) -> Result<Self, ExecError> {
        let custom = matches!(
            block,
            BlockSelector::Block(_) | BlockSelector::OrderedRange(..)
        );
        if scope == ScopeId::Default && custom {
            return Err(ExecError::ValidationError(format!(
                "the default scope does not admit custom blocks ({})",
                block
            )));
        }
        Ok(Self {
            scope,
            block,
            use_delta_kernels: false,
        })
    }

    pub fn with_delta_kernels(mut self, enabled: bool) -> Self {
        self.use_delta_kernels = enabled;
        self
    }

    /// Principal node sets, one per stage, or `None` when there is nothing
    /// to resample.
    pub fn principal_sets(
        &self,
        trace: &Trace,
        rng: &mut dyn RngCore,
    ) -> Result<Option<Vec<BTreeSet<NodeId>>>, ExecError> {
        let sets = match &self.block {
            BlockSelector::None => return Ok(None),
            BlockSelector::One => match trace.sample_block(&self.scope, rng) {
                Some(block) => vec![trace.nodes_in_block(&self.scope, &block)?],
                None => return Ok(None),
            },
            BlockSelector::All => vec![trace.all_nodes_in_scope(&self.scope)?],
            BlockSelector::Ordered => trace.ordered_sets_in_scope(&self.scope, None)?,
            BlockSelector::OrderedRange(min, max) => {
                trace.ordered_sets_in_scope(&self.scope, Some((min, max)))?
            }
            BlockSelector::Block(block) => vec![trace.nodes_in_block(&self.scope, block)?],
        };
        let sets: Vec<_> = sets.into_iter().filter(|s| !s.is_empty()).collect();
        Ok(if sets.is_empty() { None } else { Some(sets) })
    }

    pub fn sample_index(
        &self,
        trace: &Trace,
        rng: &mut dyn RngCore,
    ) -> Result<Option<Scaffold>, ExecError> {
        match self.principal_sets(trace, rng)? {
            Some(sets) => Scaffold::build(trace, sets, self.use_delta_kernels).map(Some),
            None => Ok(None),
        }
    }

    /// Log-probability of having chosen the index. Only `one` is random.
    pub fn log_density_of_index(&self, trace: &Trace, pending: Option<&TraceDelta>) -> f64 {
        if self.block != BlockSelector::One {
            return 0.0;
        }
        let blocks = match pending {
            Some(delta) => trace.num_blocks_with(&self.scope, delta),
            None => trace.num_blocks(&self.scope),
        };
        -(blocks as f64).ln()
    }
}

/// Propose/accept/reject protocol shared by all kernels.
pub trait Operator {
    fn name(&self) -> &'static str;

    /// Mutates `trace` along `scaffold` and returns the log acceptance
    /// weight of the proposal.
    fn propose(
        &mut self,
        trace: &mut Trace,
        scaffold: Scaffold,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError>;

    fn accept(&mut self, trace: &mut Trace) -> Result<(), ExecError>;

    /// Restores the state from before [`Operator::propose`].
    fn reject(&mut self, trace: &mut Trace, rng: &mut dyn RngCore) -> Result<(), ExecError>;

    /// Proposed state not yet visible in the trace, if the operator
    /// proposes into an overlay.
    fn pending(&self) -> Option<&TraceDelta> {
        None
    }
}

/// Outcome of one [`mix_mh`] step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// No principal nodes were selected.
    Skipped,
    Accepted { alpha: f64 },
    Rejected { alpha: f64 },
}

impl Transition {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Transition::Accepted { .. })
    }
}

/// One Metropolis-Hastings step over a scaffold chosen by `indexer`.
pub fn mix_mh(
    trace: &mut Trace,
    indexer: &ScaffoldIndexer,
    operator: &mut dyn Operator,
    rng: &mut dyn RngCore,
) -> Result<Transition, ExecError> {
    let Some(scaffold) = indexer.sample_index(trace, rng)? else {
        return Ok(Transition::Skipped);
    };
    let rho_mix = indexer.log_density_of_index(trace, None);
    let weight = operator.propose(trace, scaffold, rng)?;
    let xi_mix = indexer.log_density_of_index(trace, operator.pending());
    let alpha = xi_mix + weight - rho_mix;

    if alpha.is_nan() {
        operator.reject(trace, rng)?;
        return Err(ExecError::Numerical(format!(
            "{} produced a NaN acceptance ratio",
            operator.name()
        )));
    }

    let log_u = rng.random::<f64>().ln();
    let transition = if log_u < alpha {
        operator.accept(trace)?;
        Transition::Accepted { alpha }
    } else {
        operator.reject(trace, rng)?;
        Transition::Rejected { alpha }
    };

    #[cfg(feature = "tracing")]
    tracing::trace!(
        operator = operator.name(),
        scope = %indexer.scope,
        block = %indexer.block,
        alpha,
        accepted = transition.is_accepted(),
        "transition"
    );

    Ok(transition)
}

/// Runs the auxiliary kernel of every registered maker once.
pub fn run_ae_kernels(trace: &Trace, rng: &mut dyn RngCore) -> Result<(), ExecError> {
    for maker in trace.ae_kernels() {
        let sp = trace
            .made_sp(maker)
            .ok_or_else(|| invariant(format!("auxiliary kernel at {} without a procedure", maker)))?;
        let Some(aux) = trace.aux_handle(maker) else {
            continue;
        };
        sp.ae_infer(&aux, rng)?;
    }
    Ok(())
}

/// Metropolis-Hastings weight of moving from a state of weight `rho` to one
/// of weight `xi`.
///
/// Moving between two impossible states is accepted so that chains can
/// leave them; moving between two infinite-density states is rejected.
pub fn mh_weight(xi: f64, rho: f64) -> f64 {
    if xi == f64::NEG_INFINITY && rho == f64::NEG_INFINITY {
        f64::INFINITY
    } else if xi == f64::INFINITY && rho == f64::INFINITY {
        f64::NEG_INFINITY
    } else {
        xi - rho
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impossible_moves_between_impossible_states_are_accepted() {
        assert_eq!(mh_weight(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::INFINITY);
        assert_eq!(mh_weight(f64::INFINITY, f64::INFINITY), f64::NEG_INFINITY);
        assert_eq!(mh_weight(-1.0, -3.0), 2.0);
    }

    #[test]
    fn default_scope_rejects_custom_blocks() {
        let err = ScaffoldIndexer::new(ScopeId::Default, BlockSelector::Block(BlockId::Index(0)));
        assert!(matches!(err, Err(ExecError::ValidationError(_))));
        assert!(ScaffoldIndexer::new(ScopeId::Default, BlockSelector::One).is_ok());
    }

    #[test]
    fn index_density_is_uniform_over_blocks_only_for_one() {
        let trace = Trace::new();
        let all = ScaffoldIndexer::new(ScopeId::Default, BlockSelector::All).unwrap();
        assert_eq!(all.log_density_of_index(&trace, None), 0.0);
    }
}
