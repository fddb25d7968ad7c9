//! # Regen and Attach
//!
//! Walks a border forward, regenerating parents before children. Values come
//! from the node's local kernel, from the detach record when restoring, or
//! from the procedure's prior. Request nodes then evaluate their requests,
//! restoring or freshly evaluating families and simulating latents.
//!
//! Every function here is generic over [`TraceOps`], so the same code
//! regenerates into the committed trace and into particle overlays.

use std::collections::BTreeMap;

use rand::RngCore;
use rustc_hash::FxHashMap;

use crate::engine::db::Db;
use crate::engine::detach::Detach;
use crate::engine::env::Env;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::exp::Exp;
use crate::engine::lkernel::LKernel;
use crate::engine::node::{NodeId, NodeKind, Operands};
use crate::engine::procedure::{new_aux, PspKind};
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{scope_and_block, TraceOps};
use crate::engine::value::{Esr, MadeSp, Value};

/// Per-node gradients recorded by variational local kernels.
pub type Gradients = FxHashMap<NodeId, Vec<f64>>;

/// Regenerates `border` and returns the accumulated weight.
pub fn regen_and_attach<T: TraceOps + ?Sized>(
    trace: &mut T,
    border: &[NodeId],
    scaffold: &Scaffold,
    restore: bool,
    db: &mut Db,
    gradients: Option<&mut Gradients>,
    rng: &mut dyn RngCore,
) -> Result<f64, ExecError> {
    let mut regen = Regen::new(scaffold, db, gradients, rng);
    let mut weight = 0.0;
    let mut to_propagate: BTreeMap<NodeId, Value> = BTreeMap::new();
    for node in border {
        if scaffold.is_absorbing(*node) {
            weight += regen.attach(trace, *node, restore)?;
        } else {
            weight += regen.regen(trace, *node, restore)?;
            if let Some(observed) = trace.observation(*node) {
                let app = trace.outermost_non_reference_application(*node)?;
                weight += constrain(trace, app, &observed)?;
                to_propagate.insert(app, observed);
            }
        }
    }
    for app in to_propagate.keys() {
        for child in trace.children(*app) {
            propagate_constraint(trace, child, regen.rng)?;
        }
    }
    Ok(weight)
}

/// Evaluates `exp` in `env` into a new family outside of any scaffold.
pub fn evaluate<T: TraceOps + ?Sized>(
    trace: &mut T,
    exp: &Exp,
    env: &Env,
    rng: &mut dyn RngCore,
) -> Result<NodeId, ExecError> {
    let scaffold = Scaffold::empty();
    let mut db = Db::new();
    let mut regen = Regen::new(&scaffold, &mut db, None, rng);
    let (_, root) = regen.eval_family(trace, exp, env)?;
    Ok(root)
}

/// Forces `node` to `value`, returning the log-density of the forced value.
pub fn constrain<T: TraceOps + ?Sized>(
    trace: &mut T,
    node: NodeId,
    value: &Value,
) -> Result<f64, ExecError> {
    let psp = trace.psp_at(node)?;
    let args = trace.args_at(node)?;
    let old = trace
        .value(node)
        .ok_or_else(|| invariant(format!("constraining {} without a value", node)))?;
    psp.unincorporate(&old, &args)?;
    let weight = psp.log_density(value, &args)?;
    trace.set_value(node, value.clone())?;
    psp.incorporate(value, &args)?;
    trace.register_constrained_choice(node)?;
    Ok(weight)
}

/// Frees the families unevaluated into a scratch record.
fn discard_families<T: TraceOps + ?Sized>(trace: &mut T, db: &Db) {
    for root in db.family_roots() {
        trace.discard_family(root);
    }
}

/// Recomputes deterministic descendants of a freshly constrained node.
fn propagate_constraint<T: TraceOps + ?Sized>(
    trace: &mut T,
    node: NodeId,
    rng: &mut dyn RngCore,
) -> Result<(), ExecError> {
    match trace.node(node)?.kind.clone() {
        NodeKind::Constant => {}
        NodeKind::Lookup { source } => {
            let value = trace
                .value(source)
                .ok_or_else(|| invariant(format!("lookup source {} has no value", source)))?;
            trace.set_value(node, value)?;
        }
        NodeKind::Request { .. } => {
            if trace.psp_at(node)?.kind() != PspKind::NullRequest {
                return Err(ExecError::Evaluation(
                    "cannot make requests downstream of a node that is constrained during regen"
                        .into(),
                ));
            }
        }
        NodeKind::Output { .. } => {
            let psp = trace.psp_at(node)?;
            if psp.is_random() {
                return Err(ExecError::Evaluation(
                    "cannot make random choices downstream of a node that is constrained during regen"
                        .into(),
                ));
            }
            let args = trace.args_at(node)?;
            let value = psp.simulate(&args, rng)?;
            trace.set_value(node, value)?;
        }
    }
    for child in trace.children(node) {
        propagate_constraint(trace, child, rng)?;
    }
    Ok(())
}

/// State threaded through one regen pass.
pub(crate) struct Regen<'a> {
    scaffold: &'a Scaffold,
    db: &'a mut Db,
    gradients: Option<&'a mut Gradients>,
    rng: &'a mut dyn RngCore,
}

impl<'a> Regen<'a> {
    pub(crate) fn new(
        scaffold: &'a Scaffold,
        db: &'a mut Db,
        gradients: Option<&'a mut Gradients>,
        rng: &'a mut dyn RngCore,
    ) -> Self {
        Self {
            scaffold,
            db,
            gradients,
            rng,
        }
    }

    fn attach<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = self.regen_parents(trace, node, restore)?;
        let psp = trace.psp_at(node)?;
        let args = trace.args_at(node)?;
        let value = trace.ground_value(node)?;
        weight += psp.log_density(&value, &args)?;
        psp.incorporate(&value, &args)?;
        Ok(weight)
    }

    fn regen_parents<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        for parent in trace.node(node)?.definite_parents() {
            weight += self.regen(trace, parent, restore)?;
        }
        weight += self.regen_esr_parents(trace, node, restore)?;
        Ok(weight)
    }

    fn regen_esr_parents<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        for parent in trace.esr_parents(node) {
            weight += self.regen(trace, parent, restore)?;
        }
        Ok(weight)
    }

    pub(crate) fn regen<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        if self.scaffold.is_resampling(node) {
            if trace.regen_count(self.scaffold, node)? == 0 {
                weight += self.regen_parents(trace, node, restore)?;
                let kind = trace.node(node)?.kind.clone();
                match kind {
                    NodeKind::Lookup { source } => {
                        let value = trace.value(source).ok_or_else(|| {
                            invariant(format!("lookup source {} has no value", source))
                        })?;
                        trace.set_value(node, value)?;
                    }
                    NodeKind::Request { .. } => {
                        weight += self.apply_psp(trace, node, restore)?;
                        weight += self.eval_requests(trace, node, restore)?;
                    }
                    _ => {
                        weight += self.apply_psp(trace, node, restore)?;
                    }
                }
            }
            trace.inc_regen_count(self.scaffold, node)?;
        }

        if let Some(Value::SpRef(maker)) = trace.value(node) {
            if maker != node && self.scaffold.is_aaa(maker) {
                weight += self.regen(trace, maker, restore)?;
            }
        }
        Ok(weight)
    }

    pub(crate) fn eval_family<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        exp: &Exp,
        env: &Env,
    ) -> Result<(f64, NodeId), ExecError> {
        match exp {
            Exp::Symbol(name) => {
                let source = env
                    .lookup(name)
                    .ok_or_else(|| ExecError::UnboundSymbol(name.to_string()))?;
                let weight = self.regen(trace, source, false)?;
                Ok((weight, trace.create_lookup(source)?))
            }
            Exp::Value(value) => Ok((0.0, trace.create_constant(value.clone())?)),
            Exp::Apply(items) => {
                let (operator_exp, operand_exps) = items
                    .split_first()
                    .ok_or_else(|| ExecError::ValidationError("empty application".into()))?;
                let (mut weight, operator) = self.eval_family(trace, operator_exp, env)?;
                let mut operands = Operands::new();
                for operand_exp in operand_exps {
                    match self.eval_family(trace, operand_exp, env) {
                        Ok((w, operand)) => {
                            weight += w;
                            operands.push(operand);
                        }
                        Err(err) => {
                            let built: Vec<NodeId> =
                                std::iter::once(operator).chain(operands).collect();
                            return self.abandon(trace, &built, None, err);
                        }
                    }
                }
                let built: Vec<NodeId> =
                    std::iter::once(operator).chain(operands.iter().copied()).collect();
                let (request, output) = trace.create_application(operator, operands, env.clone())?;
                match self.apply(trace, request, output, false) {
                    Ok(w) => Ok((weight + w, output)),
                    Err(err) => self.abandon(trace, &built, Some(output), err),
                }
            }
        }
    }

    /// Unevaluates the operator and operand families built for an
    /// application whose evaluation failed, and frees their nodes together
    /// with the application's own when it was created.
    fn abandon<T: TraceOps + ?Sized, R>(
        &mut self,
        trace: &mut T,
        built: &[NodeId],
        application: Option<NodeId>,
        err: ExecError,
    ) -> Result<R, ExecError> {
        if !trace.unwinds_failures() {
            return Err(err);
        }
        let mut scratch = Db::new();
        let mut detach = Detach::new(self.scaffold, &mut scratch);
        for root in built.iter().rev() {
            detach.uneval_family(trace, *root)?;
        }
        discard_families(trace, &scratch);
        match application {
            Some(output) => trace.discard_family(output),
            None => {
                for root in built {
                    trace.discard_family(*root);
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(error = %err, families = built.len(), "abandoned a failed evaluation");

        Err(err)
    }

    /// Takes back the request half of a freshly evaluated application after
    /// a later stage failed. `requested` says whether its requests were
    /// fulfilled.
    fn take_back<T: TraceOps + ?Sized, R>(
        &mut self,
        trace: &mut T,
        request: NodeId,
        requested: bool,
        restore: bool,
        err: ExecError,
    ) -> Result<R, ExecError> {
        if restore || !trace.unwinds_failures() {
            return Err(err);
        }
        let mut scratch = Db::new();
        let mut detach = Detach::new(self.scaffold, &mut scratch);
        if requested {
            detach.uneval_requests(trace, request)?;
        }
        detach.unapply_psp(trace, request)?;
        discard_families(trace, &scratch);
        Err(err)
    }

    fn apply<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        request: NodeId,
        output: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = self.apply_psp(trace, request, restore)?;
        match self.eval_requests(trace, request, restore) {
            Ok(w) => weight += w,
            Err(err) => return self.take_back(trace, request, false, restore, err),
        }
        let num_esrs = trace
            .value(request)
            .as_ref()
            .and_then(Value::as_request)
            .map_or(0, |r| r.esrs.len());
        if trace.esr_parents(output).len() != num_esrs {
            return Err(invariant(format!(
                "{} has {} esr parents for {} requests",
                output,
                trace.esr_parents(output).len(),
                num_esrs
            )));
        }
        weight += self.regen_esr_parents(trace, output, restore)?;
        match self.apply_psp(trace, output, restore) {
            Ok(w) => weight += w,
            Err(err) => return self.take_back(trace, request, true, restore, err),
        }
        Ok(weight)
    }

    fn process_made_sp<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        made: MadeSp,
        is_aaa: bool,
        restore: bool,
    ) -> Result<(), ExecError> {
        trace.set_made_sp(node, Some(made.sp.clone()))?;
        trace.set_value(node, Value::SpRef(node))?;
        if !is_aaa {
            trace.init_families(node)?;
            let restored = if restore {
                self.db.made_aux(node).cloned()
            } else {
                None
            };
            let aux = restored
                .or(made.aux)
                .or_else(|| made.sp.construct_aux().map(new_aux));
            trace.set_made_aux(node, aux)?;
            if made.sp.has_ae_kernel() {
                trace.register_ae_kernel(node)?;
            }
        }
        Ok(())
    }

    fn apply_psp<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        let psp = trace.psp_at(node)?;
        let args = trace.args_at(node)?;
        let old = self.db.value(node).cloned();
        let scope_key = match (psp.kind(), args.operands.as_slice()) {
            (PspKind::ScopeInclude, [scope, block, _]) => Some(scope_and_block(scope, block)?),
            (PspKind::ScopeInclude, _) => {
                return Err(invariant("scope_include takes three operands"))
            }
            _ => None,
        };

        let new = if let Some(kernel) = self.scaffold.lkernel(node) {
            let new = if restore {
                old.clone()
                    .ok_or_else(|| invariant(format!("nothing to restore at {}", node)))?
            } else {
                kernel.simulate(old.as_ref(), &args, &mut *self.rng)?
            };
            weight += kernel.weight(&new, old.as_ref(), &args)?;
            if let (LKernel::Variational(variational), Some(gradients)) =
                (kernel, self.gradients.as_deref_mut())
            {
                gradients.insert(node, variational.gradient_of_log_density(&new)?);
            }
            new
        } else if restore {
            old.ok_or_else(|| invariant(format!("nothing to restore at {}", node)))?
        } else {
            psp.simulate(&args, &mut *self.rng)?
        };

        trace.set_value(node, new.clone())?;
        psp.incorporate(&new, &args)?;

        if let Value::Procedure(made) = new {
            self.process_made_sp(trace, node, made, self.scaffold.is_aaa(node), restore)?;
        }
        if psp.is_random() && !trace.is_constrained(node) {
            trace.register_random_choice(node)?;
        }
        if let Some((scope, block)) = scope_key {
            trace.register_in_scope(scope, block, args.operand_nodes[2])?;
        }
        Ok(weight)
    }

    fn eval_requests<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        let request = match trace.value(node) {
            Some(Value::Request(request)) => request,
            other => {
                return Err(invariant(format!(
                    "request node {} holds {:?}",
                    node, other
                )))
            }
        };
        let output = trace
            .node(node)?
            .output_node()
            .ok_or_else(|| invariant(format!("{} is not a request node", node)))?;
        let maker = trace.sp_ref(node)?;

        for (fulfilled, esr) in request.esrs.iter().enumerate() {
            match self.eval_request(trace, maker, output, esr, restore) {
                Ok(w) => weight += w,
                Err(err) => {
                    let esrs = &request.esrs[..fulfilled];
                    return self.release(trace, node, esrs, &[], restore, err);
                }
            }
        }

        if !request.lsrs.is_empty() {
            let sp = trace.sp_at(node)?;
            let aux = trace
                .made_aux(maker)
                .ok_or_else(|| invariant(format!("latent request to {} without state", maker)))?;
            for (simulated, lsr) in request.lsrs.iter().enumerate() {
                let result = sp.simulate_latents(
                    &aux,
                    lsr,
                    restore,
                    self.db.latent_db_mut(maker),
                    &mut *self.rng,
                );
                match result {
                    Ok(w) => weight += w,
                    Err(err) => {
                        let lsrs = &request.lsrs[..simulated];
                        return self.release(trace, node, &request.esrs, lsrs, restore, err);
                    }
                }
            }
        }
        Ok(weight)
    }

    fn eval_request<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        maker: NodeId,
        output: NodeId,
        esr: &Esr,
        restore: bool,
    ) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        let root = match trace.family(maker, &esr.id) {
            Some(root) => root,
            None => {
                let root = if restore {
                    let root = self.db.family(maker, &esr.id)?;
                    weight += self.restore(trace, root)?;
                    root
                } else {
                    let (w, root) = self.eval_family(trace, &esr.exp, &esr.env)?;
                    weight += w;
                    root
                };
                trace.register_family(maker, esr.id.clone(), root)?;
                root
            }
        };
        trace.add_esr_edge(root, output)?;
        Ok(weight)
    }

    /// Releases the requests of `node` fulfilled before a failure.
    fn release<T: TraceOps + ?Sized, R>(
        &mut self,
        trace: &mut T,
        node: NodeId,
        esrs: &[Esr],
        lsrs: &[Value],
        restore: bool,
        err: ExecError,
    ) -> Result<R, ExecError> {
        if restore || !trace.unwinds_failures() {
            return Err(err);
        }
        let mut scratch = Db::new();
        Detach::new(self.scaffold, &mut scratch).release_requests(trace, node, esrs, lsrs)?;
        discard_families(trace, &scratch);
        Err(err)
    }

    fn restore<T: TraceOps + ?Sized>(
        &mut self,
        trace: &mut T,
        node: NodeId,
    ) -> Result<f64, ExecError> {
        match trace.node(node)?.kind.clone() {
            NodeKind::Constant => Ok(0.0),
            NodeKind::Lookup { source } => {
                let weight = self.regen_parents(trace, node, true)?;
                trace.reconnect_lookup(node)?;
                let value = trace
                    .value(source)
                    .ok_or_else(|| invariant(format!("lookup source {} has no value", source)))?;
                trace.set_value(node, value)?;
                Ok(weight)
            }
            NodeKind::Output {
                operator,
                operands,
                request,
                ..
            } => {
                let mut weight = self.restore(trace, operator)?;
                for operand in operands {
                    weight += self.restore(trace, operand)?;
                }
                weight += self.apply(trace, request, node, true)?;
                Ok(weight)
            }
            NodeKind::Request { .. } => Err(invariant(format!(
                "family root {} is a request node",
                node
            ))),
        }
    }
}
