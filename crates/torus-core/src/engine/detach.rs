//! # Detach and Extract
//!
//! The inverse of [regen](crate::engine::regen): walks a border backwards,
//! unincorporating absorbing nodes and extracting resampling ones. Every
//! value, family and latent that leaves the trace is recorded in the returned
//! [`Db`] so that a restoring regen can put the trace back exactly.
//!
//! Detach only removes things, so it runs against the committed
//! [`Trace`](crate::engine::trace::Trace). Against a particle overlay the
//! removal operations fail with `Unsupported`.

use crate::engine::db::Db;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::{NodeId, NodeKind};
use crate::engine::procedure::PspKind;
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{scope_and_block, TraceOps};
use crate::engine::value::{Esr, MadeSp, Value};

/// Detaches `border` in reverse order and returns the weight with the record
/// of everything removed.
pub fn detach_and_extract<T: TraceOps + ?Sized>(
    trace: &mut T,
    border: &[NodeId],
    scaffold: &Scaffold,
) -> Result<(f64, Db), ExecError> {
    let mut db = Db::new();
    let mut detach = Detach::new(scaffold, &mut db);
    let mut weight = 0.0;
    for node in border.iter().rev() {
        if scaffold.is_absorbing(*node) {
            weight += detach.detach(trace, *node)?;
        } else {
            if trace.observation(*node).is_some() {
                let app = trace.outermost_non_reference_application(*node)?;
                weight += unconstrain(trace, app)?;
            }
            weight += detach.extract(trace, *node)?;
        }
    }
    Ok((weight, db))
}

/// Removes the family rooted at `root`, outside of any scaffold.
pub fn uneval<T: TraceOps + ?Sized>(trace: &mut T, root: NodeId) -> Result<Db, ExecError> {
    let scaffold = Scaffold::empty();
    let mut db = Db::new();
    Detach::new(&scaffold, &mut db).uneval_family(trace, root)?;
    Ok(db)
}

/// Lifts the constraint on `node`, returning the log-density of its value.
pub fn unconstrain<T: TraceOps + ?Sized>(trace: &mut T, node: NodeId) -> Result<f64, ExecError> {
    let psp = trace.psp_at(node)?;
    let args = trace.args_at(node)?;
    let value = trace
        .value(node)
        .ok_or_else(|| invariant(format!("unconstraining {} without a value", node)))?;
    trace.unregister_constrained_choice(node)?;
    psp.unincorporate(&value, &args)?;
    let weight = psp.log_density(&value, &args)?;
    psp.incorporate(&value, &args)?;
    Ok(weight)
}

/// State threaded through one detach pass.
pub(crate) struct Detach<'a> {
    scaffold: &'a Scaffold,
    db: &'a mut Db,
}

impl<'a> Detach<'a> {
    pub(crate) fn new(scaffold: &'a Scaffold, db: &'a mut Db) -> Self {
        Self { scaffold, db }
    }

    fn detach<T: TraceOps + ?Sized>(&mut self, trace: &mut T, node: NodeId) -> Result<f64, ExecError> {
        let psp = trace.psp_at(node)?;
        let args = trace.args_at(node)?;
        let value = trace.ground_value(node)?;
        psp.unincorporate(&value, &args)?;
        let mut weight = psp.log_density(&value, &args)?;
        weight += self.extract_parents(trace, node)?;
        Ok(weight)
    }

    fn extract_parents<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        let mut weight = self.extract_esr_parents(trace, node)?;
        for parent in trace.node(node)?.definite_parents().into_iter().rev() {
            weight += self.extract(trace, parent)?;
        }
        Ok(weight)
    }

    fn extract_esr_parents<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        for parent in trace.esr_parents(node).into_iter().rev() {
            weight += self.extract(trace, parent)?;
        }
        Ok(weight)
    }

    pub(crate) fn extract<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        if let Some(Value::SpRef(maker)) = trace.value(node) {
            if maker != node && self.scaffold.is_aaa(maker) {
                weight += self.extract(trace, maker)?;
            }
        }

        if self.scaffold.is_resampling(node) {
            trace.dec_regen_count(self.scaffold, node)?;
            if trace.regen_count(self.scaffold, node)? == 0 {
                match trace.node(node)?.kind {
                    NodeKind::Lookup { .. } => trace.clear_value(node)?,
                    NodeKind::Request { .. } => {
                        weight += self.uneval_requests(trace, node)?;
                        weight += self.unapply_psp(trace, node)?;
                    }
                    _ => weight += self.unapply_psp(trace, node)?,
                }
                weight += self.extract_parents(trace, node)?;
            }
        }
        Ok(weight)
    }

    pub(crate) fn uneval_family<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        match trace.node(node)?.kind.clone() {
            NodeKind::Constant => Ok(0.0),
            NodeKind::Lookup { .. } => {
                trace.disconnect_lookup(node)?;
                trace.clear_value(node)?;
                self.extract_parents(trace, node)
            }
            NodeKind::Output {
                operator, operands, ..
            } => {
                let mut weight = self.unapply(trace, node)?;
                for operand in operands.into_iter().rev() {
                    weight += self.uneval_family(trace, operand)?;
                }
                weight += self.uneval_family(trace, operator)?;
                Ok(weight)
            }
            NodeKind::Request { .. } => Err(invariant(format!(
                "family root {} is a request node",
                node
            ))),
        }
    }

    fn unapply<T: TraceOps + ?Sized>(&mut self, trace: &mut T, output: NodeId) -> Result<f64, ExecError> {
        let request = trace
            .node(output)?
            .request_node()
            .ok_or_else(|| invariant(format!("{} is not an output node", output)))?;
        let mut weight = self.unapply_psp(trace, output)?;
        weight += self.extract_esr_parents(trace, output)?;
        weight += self.uneval_requests(trace, request)?;
        weight += self.unapply_psp(trace, request)?;
        Ok(weight)
    }

    fn teardown_made_sp<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        is_aaa: bool,
    ) -> Result<(), ExecError> {
        let sp = trace
            .made_sp(node)
            .ok_or_else(|| invariant(format!("no procedure made at {}", node)))?;
        trace.set_value(node, Value::Procedure(MadeSp::new(sp.clone())))?;
        trace.set_made_sp(node, None)?;
        if !is_aaa {
            if sp.has_ae_kernel() {
                trace.unregister_ae_kernel(node)?;
            }
            if let Some(aux) = trace.made_aux(node) {
                self.db.set_made_aux(node, aux);
            }
            trace.set_made_aux(node, None)?;
            trace.clear_families(node)?;
        }
        Ok(())
    }

    pub(crate) fn unapply_psp<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        let psp = trace.psp_at(node)?;
        let args = trace.args_at(node)?;

        if psp.kind() == PspKind::ScopeInclude {
            let (scope, block) = match args.operands.as_slice() {
                [scope, block, _] => scope_and_block(scope, block)?,
                _ => return Err(invariant("scope_include takes three operands")),
            };
            trace.unregister_in_scope(&scope, &block, args.operand_nodes[2])?;
        }
        if psp.is_random() && !trace.is_constrained(node) {
            trace.unregister_random_choice(node)?;
        }
        if trace.value(node) == Some(Value::SpRef(node)) {
            self.teardown_made_sp(trace, node, self.scaffold.is_aaa(node))?;
        }

        let value = trace
            .value(node)
            .ok_or_else(|| invariant(format!("extracting {} without a value", node)))?;
        psp.unincorporate(&value, &args)?;
        let weight = match self.scaffold.lkernel(node) {
            Some(kernel) => kernel.reverse_weight(&value, &args)?,
            None => 0.0,
        };
        self.db.extract_value(node, value)?;
        trace.clear_value(node)?;
        Ok(weight)
    }

    pub(crate) fn uneval_requests<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        let request = match trace.value(node) {
            Some(Value::Request(request)) => request,
            other => {
                return Err(invariant(format!(
                    "request node {} holds {:?}",
                    node, other
                )))
            }
        };
        self.release_requests(trace, node, &request.esrs, &request.lsrs)
    }

    /// Releases the given fulfilled requests of `node`, latents first and
    /// families newest first. The families must be the leading ESR parents
    /// of the output node.
    pub(crate) fn release_requests<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        esrs: &[Esr],
        lsrs: &[Value],
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        let output = trace
            .node(node)?
            .output_node()
            .ok_or_else(|| invariant(format!("{} is not a request node", node)))?;
        let maker = trace.sp_ref(node)?;

        if !lsrs.is_empty() {
            let sp = trace.sp_at(node)?;
            if !self.db.has_latent_db(maker) {
                let latent_db = sp.construct_latent_db().unwrap_or_else(|| Box::new(()));
                self.db.register_latent_db(maker, latent_db);
            }
            let aux = trace
                .made_aux(maker)
                .ok_or_else(|| invariant(format!("latent request to {} without state", maker)))?;
            let latent_db = self
                .db
                .latent_db_mut(maker)
                .ok_or_else(|| invariant(format!("no latent record for {}", maker)))?;
            for lsr in lsrs.iter().rev() {
                weight += sp.detach_latents(&aux, lsr, latent_db)?;
            }
        }

        for esr in esrs.iter().rev() {
            let root = trace.pop_last_esr_parent(output)?;
            if trace.num_requests(root) == 0 {
                trace.unregister_family(maker, &esr.id)?;
                self.db.register_family(maker, esr.id.clone(), root);
                weight += self.uneval_family(trace, root)?;
            }
        }
        Ok(weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::driver::Engine;
    use crate::engine::db::Db;
    use crate::engine::regen::Regen;
    use crate::engine::scaffold::Scaffold;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn conjugate_engine() -> (Engine, NodeId, NodeId, NodeId) {
        let mut engine = Engine::with_seed(11);
        let a = engine.assume("a", "(gamma 1 1)").unwrap();
        let coin = engine.assume("coin", "(make_beta_bernoulli a 1)").unwrap();
        let c = engine.assume("c", "(coin)").unwrap();
        let roots = (
            engine.directive_root(a).unwrap(),
            engine.directive_root(coin).unwrap(),
            engine.directive_root(c).unwrap(),
        );
        (engine, roots.0, roots.1, roots.2)
    }

    #[test]
    fn collapsed_maker_is_counted_by_its_applications() {
        let (engine, a, maker, c) = conjugate_engine();
        let trace = engine.trace();
        let scaffold = Scaffold::build(trace, vec![BTreeSet::from([a, c])], false).unwrap();
        assert!(scaffold.is_aaa(maker));
        assert_eq!(scaffold.regen_count(maker), Some(2));
        assert!(scaffold.border_stage(0).unwrap().contains(&maker));
    }

    #[test]
    fn collapsed_maker_is_extracted_after_its_applications() {
        let (mut engine, a, maker, c) = conjugate_engine();
        let trace = engine.trace_mut();
        let scaffold = Scaffold::build(trace, vec![BTreeSet::from([a, c])], false).unwrap();
        let mut db = Db::new();
        let mut detach = Detach::new(&scaffold, &mut db);

        detach.extract(trace, c).unwrap();
        assert_eq!(scaffold.regen_count(maker), Some(1));
        assert!(trace.value(maker).is_some());

        detach.extract(trace, maker).unwrap();
        assert_eq!(scaffold.regen_count(maker), Some(0));
        assert!(matches!(trace.value(maker), None));
    }

    #[test]
    fn collapsed_maker_is_regenerated_before_its_applications() {
        let (mut engine, a, maker, c) = conjugate_engine();
        let trace = engine.trace_mut();
        let scaffold = Scaffold::build(trace, vec![BTreeSet::from([a, c])], false).unwrap();
        let border = scaffold.border_stage(0).unwrap().to_vec();
        let (_, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
        assert!(scaffold.regen_counts().values().all(|count| *count == 0));

        let mut rng = StdRng::seed_from_u64(5);
        let mut regen = Regen::new(&scaffold, &mut db, None, &mut rng);
        let request = trace.node(maker).unwrap().request_node().unwrap();
        regen.regen(trace, request, true).unwrap();
        regen.regen(trace, maker, true).unwrap();
        assert_eq!(scaffold.regen_count(maker), Some(1));
        regen.regen(trace, c, true).unwrap();
        assert_eq!(scaffold.regen_count(maker), Some(2));
    }

    #[test]
    fn detach_then_restore_reproduces_values() {
        let (mut engine, a, _, c) = conjugate_engine();
        let trace = engine.trace_mut();
        let before_a = trace.value(a);
        let before_c = trace.value(c);
        let scaffold = Scaffold::build(trace, vec![BTreeSet::from([a])], false).unwrap();
        let border = scaffold.border_stage(0).unwrap().to_vec();
        let (rho_weight, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
        assert!(trace.value(a).is_none());

        let mut rng = StdRng::seed_from_u64(5);
        let xi_weight = crate::engine::regen::regen_and_attach(
            trace, &border, &scaffold, true, &mut db, None, &mut rng,
        )
        .unwrap();
        assert_eq!(trace.value(a), before_a);
        assert_eq!(trace.value(c), before_c);
        assert!((rho_weight - xi_weight).abs() < 1e-9);
    }
}
