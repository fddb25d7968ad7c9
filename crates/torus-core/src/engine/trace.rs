//! # Execution Trace
//!
//! The trace is the single source of truth for committed state: a node arena
//! addressed by [`NodeId`], per-node mutable state (value, children, ESR
//! parents, request counts, made procedures), the random/constrained choice
//! registries, scope membership and the auxiliary-kernel registry.
//!
//! ## Design
//!
//! The attach/detach engine is written once against [`TraceOps`], which both
//! [`Trace`] and [`Particle`](crate::engine::particle::Particle) implement.
//! A particle is an additive overlay, so the removal half of the interface
//! fails there with [`ExecError::Unsupported`].
//!
//! Node slots are reused: once a detach record is discarded its detached
//! families are unreachable, and [`Trace::reclaim`] returns their slots to a
//! free list.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rand::{Rng, RngCore};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::engine::builtins;
use crate::engine::db::Db;
use crate::engine::env::Env;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::{BlockId, FamilyId, Node, NodeId, NodeKind, Operands, ScopeId};
use crate::engine::particle::TraceDelta;
use crate::engine::procedure::{new_aux, Args, AuxHandle, Procedure, Psp, PspKind};
use crate::engine::scaffold::Scaffold;
use crate::engine::value::{MadeSp, Value};

pub type EsrParents = SmallVec<[NodeId; 2]>;

/// scope → block → registered nodes.
pub type Scopes = BTreeMap<ScopeId, BTreeMap<BlockId, BTreeSet<NodeId>>>;

/// Read/write interface shared by the committed trace and particle overlays.
pub trait TraceOps {
    fn node(&self, id: NodeId) -> Result<&Node, ExecError>;

    fn value(&self, id: NodeId) -> Option<Value>;
    fn set_value(&mut self, id: NodeId, value: Value) -> Result<(), ExecError>;
    fn clear_value(&mut self, id: NodeId) -> Result<(), ExecError>;

    fn children(&self, id: NodeId) -> Vec<NodeId>;
    fn add_child(&mut self, id: NodeId, child: NodeId) -> Result<(), ExecError>;
    fn remove_child(&mut self, id: NodeId, child: NodeId) -> Result<(), ExecError>;

    fn esr_parents(&self, id: NodeId) -> EsrParents;
    fn append_esr_parent(&mut self, id: NodeId, parent: NodeId) -> Result<(), ExecError>;
    fn pop_esr_parent(&mut self, id: NodeId) -> Result<NodeId, ExecError>;

    fn num_requests(&self, id: NodeId) -> u32;
    fn inc_requests(&mut self, id: NodeId) -> Result<(), ExecError>;
    fn dec_requests(&mut self, id: NodeId) -> Result<(), ExecError>;

    fn regen_count(&self, scaffold: &Scaffold, id: NodeId) -> Result<i32, ExecError>;
    fn inc_regen_count(&mut self, scaffold: &Scaffold, id: NodeId) -> Result<(), ExecError>;
    fn dec_regen_count(&mut self, scaffold: &Scaffold, id: NodeId) -> Result<(), ExecError>;

    fn made_sp(&self, maker: NodeId) -> Option<Arc<dyn Procedure>>;
    fn set_made_sp(
        &mut self,
        maker: NodeId,
        sp: Option<Arc<dyn Procedure>>,
    ) -> Result<(), ExecError>;
    /// Auxiliary state of the procedure made at `maker`. Overlays copy the
    /// base state on first access.
    fn made_aux(&mut self, maker: NodeId) -> Option<AuxHandle>;
    fn set_made_aux(&mut self, maker: NodeId, aux: Option<AuxHandle>) -> Result<(), ExecError>;

    fn family(&self, maker: NodeId, id: &FamilyId) -> Option<NodeId>;
    fn init_families(&mut self, maker: NodeId) -> Result<(), ExecError>;
    fn clear_families(&mut self, maker: NodeId) -> Result<(), ExecError>;
    fn register_family(&mut self, maker: NodeId, id: FamilyId, root: NodeId)
        -> Result<(), ExecError>;
    fn unregister_family(&mut self, maker: NodeId, id: &FamilyId) -> Result<(), ExecError>;

    fn register_random_choice(&mut self, id: NodeId) -> Result<(), ExecError>;
    fn unregister_random_choice(&mut self, id: NodeId) -> Result<(), ExecError>;
    fn register_constrained_choice(&mut self, id: NodeId) -> Result<(), ExecError>;
    fn unregister_constrained_choice(&mut self, id: NodeId) -> Result<(), ExecError>;
    fn is_constrained(&self, id: NodeId) -> bool;
    fn register_in_scope(
        &mut self,
        scope: ScopeId,
        block: BlockId,
        id: NodeId,
    ) -> Result<(), ExecError>;
    fn unregister_in_scope(
        &mut self,
        scope: &ScopeId,
        block: &BlockId,
        id: NodeId,
    ) -> Result<(), ExecError>;
    fn register_ae_kernel(&mut self, maker: NodeId) -> Result<(), ExecError>;
    fn unregister_ae_kernel(&mut self, maker: NodeId) -> Result<(), ExecError>;

    fn create_constant(&mut self, value: Value) -> Result<NodeId, ExecError>;
    fn create_lookup(&mut self, source: NodeId) -> Result<NodeId, ExecError>;
    /// Creates a paired (request, output) application.
    fn create_application(
        &mut self,
        operator: NodeId,
        operands: Operands,
        env: Env,
    ) -> Result<(NodeId, NodeId), ExecError>;
    fn disconnect_lookup(&mut self, lookup: NodeId) -> Result<(), ExecError>;
    fn reconnect_lookup(&mut self, lookup: NodeId) -> Result<(), ExecError>;

    /// Observed value of a node whose observation has been propagated.
    fn observation(&self, id: NodeId) -> Option<Value>;

    /// Whether a failed evaluation is taken back in place. Overlays are
    /// dropped whole instead.
    fn unwinds_failures(&self) -> bool {
        true
    }

    /// Frees the slots of an unevaluated family.
    fn discard_family(&mut self, _root: NodeId) {}

    fn add_esr_edge(&mut self, parent: NodeId, output: NodeId) -> Result<(), ExecError> {
        self.inc_requests(parent)?;
        self.add_child(parent, output)?;
        self.append_esr_parent(output, parent)
    }

    fn pop_last_esr_parent(&mut self, output: NodeId) -> Result<NodeId, ExecError> {
        let parent = self.pop_esr_parent(output)?;
        self.remove_child(parent, output)?;
        self.dec_requests(parent)?;
        Ok(parent)
    }

    /// Maker node of the procedure applied at `id`.
    fn sp_ref(&self, id: NodeId) -> Result<NodeId, ExecError> {
        let operator = self
            .node(id)?
            .operator()
            .ok_or_else(|| invariant(format!("{} is not an application", id)))?;
        match self.value(operator) {
            Some(Value::SpRef(maker)) => Ok(maker),
            Some(other) => Err(ExecError::Evaluation(format!(
                "cannot apply non-procedure {}",
                other
            ))),
            None => Err(invariant(format!("operator {} of {} has no value", operator, id))),
        }
    }

    fn sp_at(&self, id: NodeId) -> Result<Arc<dyn Procedure>, ExecError> {
        let maker = self.sp_ref(id)?;
        self.made_sp(maker)
            .ok_or_else(|| invariant(format!("no procedure made at {}", maker)))
    }

    fn psp_at(&self, id: NodeId) -> Result<Arc<dyn Psp>, ExecError> {
        let sp = self.sp_at(id)?;
        match self.node(id)?.kind {
            NodeKind::Request { .. } => Ok(sp.request_psp()),
            NodeKind::Output { .. } => Ok(sp.output_psp()),
            _ => Err(invariant(format!("{} is not an application", id))),
        }
    }

    /// The value with procedure references resolved to the procedure itself.
    fn ground_value(&self, id: NodeId) -> Result<Value, ExecError> {
        match self.value(id) {
            Some(Value::SpRef(maker)) => self
                .made_sp(maker)
                .map(|sp| Value::Procedure(MadeSp::new(sp)))
                .ok_or_else(|| invariant(format!("dangling procedure reference at {}", id))),
            Some(value) => Ok(value),
            None => Err(invariant(format!("{} has no value", id))),
        }
    }

    fn parents(&self, id: NodeId) -> Result<Vec<NodeId>, ExecError> {
        let mut parents = self.node(id)?.definite_parents().to_vec();
        parents.extend(self.esr_parents(id));
        Ok(parents)
    }

    fn args_at(&mut self, id: NodeId) -> Result<Args, ExecError> {
        let node = self.node(id)?.clone();
        let env = node
            .env()
            .cloned()
            .ok_or_else(|| invariant(format!("{} is not an application", id)))?;
        let operand_nodes: Operands = node.operands().iter().copied().collect();
        let operands = operand_nodes
            .iter()
            .map(|o| {
                self.value(*o)
                    .ok_or_else(|| invariant(format!("operand {} of {} has no value", o, id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let request = node.request_node().and_then(|r| self.value(r));
        let esr_nodes = self.esr_parents(id);
        let esr_values = esr_nodes
            .iter()
            .map(|p| {
                self.value(*p)
                    .ok_or_else(|| invariant(format!("esr parent {} of {} has no value", p, id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let maker = self.sp_ref(id)?;
        let aux = self.made_aux(maker);
        let made_aux = self.made_aux(id);
        Ok(Args {
            node: id,
            operand_nodes,
            operands,
            env,
            request,
            esr_nodes,
            esr_values,
            aux,
            made_aux,
        })
    }

    /// Follows lookups, ESR references and `scope_include` wrappers down to
    /// the application that actually produces the value of `id`.
    fn outermost_non_reference_application(&self, id: NodeId) -> Result<NodeId, ExecError> {
        let node = self.node(id)?;
        if let Some(source) = node.lookup_source() {
            return self.outermost_non_reference_application(source);
        }
        if !node.is_output() {
            return Err(ExecError::Evaluation(format!(
                "{} is not the result of an application",
                id
            )));
        }
        let operand2 = node.operands().get(2).copied();
        match self.psp_at(id)?.kind() {
            PspKind::EsrReference => match self.esr_parents(id).first() {
                Some(parent) => self.outermost_non_reference_application(*parent),
                None => Err(invariant(format!("reference {} has no esr parent", id))),
            },
            PspKind::ScopeInclude => {
                let inner =
                    operand2.ok_or_else(|| invariant("scope_include without an expression"))?;
                self.outermost_non_reference_application(inner)
            }
            _ => Ok(id),
        }
    }
}

/// Converts evaluated `scope_include` operands into a (scope, block) key.
pub fn scope_and_block(scope: &Value, block: &Value) -> Result<(ScopeId, BlockId), ExecError> {
    let scope = match scope {
        Value::Symbol(s) => ScopeId::named(s),
        Value::Number(x) => ScopeId::named(&x.to_string()),
        other => {
            return Err(ExecError::Evaluation(format!(
                "scope must be a symbol or number, got {}",
                other
            )))
        }
    };
    if scope == ScopeId::Default {
        return Err(ExecError::Evaluation(
            "the default scope cannot be extended explicitly".into(),
        ));
    }
    let block = match block {
        Value::Number(x) => BlockId::from_number(*x).ok_or_else(|| {
            ExecError::ValidationError(format!("block index must be an integer, got {}", x))
        })?,
        Value::Symbol(s) => BlockId::Symbol(s.clone()),
        other => {
            return Err(ExecError::Evaluation(format!(
                "block must be a symbol or number, got {}",
                other
            )))
        }
    };
    Ok((scope, block))
}

struct NodeSlot {
    node: Node,
    value: Option<Value>,
    children: BTreeSet<NodeId>,
    esr_parents: EsrParents,
    num_requests: u32,
    made_sp: Option<Arc<dyn Procedure>>,
    made_aux: Option<AuxHandle>,
    families: Option<BTreeMap<FamilyId, NodeId>>,
    observed: Option<Value>,
}

impl NodeSlot {
    fn new(node: Node, value: Option<Value>) -> Self {
        Self {
            node,
            value,
            children: BTreeSet::new(),
            esr_parents: EsrParents::new(),
            num_requests: 0,
            made_sp: None,
            made_aux: None,
            families: None,
            observed: None,
        }
    }
}

pub struct Trace {
    slots: Vec<Option<NodeSlot>>,
    free: Vec<NodeId>,
    random_choices: BTreeSet<NodeId>,
    constrained: BTreeSet<NodeId>,
    ae_kernels: BTreeSet<NodeId>,
    scopes: Scopes,
    global_env: Env,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    /// A trace whose global environment binds the builtin procedures.
    ///
    /// Builtins live in a root frame; user bindings go to a child frame so
    /// that they can shadow builtins.
    pub fn new() -> Self {
        let mut trace = Self {
            slots: Vec::new(),
            free: Vec::new(),
            random_choices: BTreeSet::new(),
            constrained: BTreeSet::new(),
            ae_kernels: BTreeSet::new(),
            scopes: Scopes::new(),
            global_env: Env::root(),
        };
        let builtin_env = Env::root();
        for (name, sp) in builtins::procedures() {
            let id = trace.reserve_id();
            let mut slot = NodeSlot::new(Node::constant(), Some(Value::SpRef(id)));
            slot.made_aux = sp.construct_aux().map(new_aux);
            slot.families = Some(BTreeMap::new());
            if sp.has_ae_kernel() {
                trace.ae_kernels.insert(id);
            }
            slot.made_sp = Some(sp);
            trace.slots[id.index()] = Some(slot);
            builtin_env.bind(name, id);
        }
        trace.global_env = builtin_env.child();
        trace
    }

    pub fn global_env(&self) -> &Env {
        &self.global_env
    }

    /// Number of allocated slots, live or free. Particles allocate above it.
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slot(id).is_ok()
    }

    fn slot(&self, id: NodeId) -> Result<&NodeSlot, ExecError> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| invariant(format!("unknown node {}", id)))
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut NodeSlot, ExecError> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| invariant(format!("unknown node {}", id)))
    }

    fn reserve_id(&mut self) -> NodeId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn install(&mut self, id: NodeId, node: Node, value: Option<Value>) {
        if self.slots.len() <= id.index() {
            self.slots.resize_with(id.index() + 1, || None);
        }
        self.slots[id.index()] = Some(NodeSlot::new(node, value));
    }

    // ---- registries -------------------------------------------------------

    pub fn random_choices(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.random_choices.iter().copied()
    }

    pub fn num_random_choices(&self) -> usize {
        self.random_choices.len()
    }

    pub fn is_random_choice(&self, id: NodeId) -> bool {
        self.random_choices.contains(&id)
    }

    pub fn constrained_choices(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.constrained.iter().copied()
    }

    pub fn ae_kernels(&self) -> Vec<NodeId> {
        self.ae_kernels.iter().copied().collect()
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// Flattened sufficient statistics of the procedure made at `maker`.
    pub fn aux_statistics(&self, maker: NodeId) -> Option<Vec<f64>> {
        let slot = self.slot(maker).ok()?;
        slot.made_aux.as_ref().map(|aux| aux.lock().statistics())
    }

    /// Handle to the auxiliary state made at `maker`, without copying it.
    pub(crate) fn aux_handle(&self, maker: NodeId) -> Option<AuxHandle> {
        self.slot(maker).ok().and_then(|s| s.made_aux.clone())
    }

    pub fn mark_observed(&mut self, id: NodeId, value: Value) -> Result<(), ExecError> {
        self.slot_mut(id)?.observed = Some(value);
        Ok(())
    }

    pub fn clear_observed(&mut self, id: NodeId) -> Result<Option<Value>, ExecError> {
        Ok(self.slot_mut(id)?.observed.take())
    }

    // ---- scopes and blocks ------------------------------------------------

    pub fn scope_has_entropy(&self, scope: &ScopeId) -> bool {
        self.num_blocks(scope) > 0
    }

    pub fn num_blocks(&self, scope: &ScopeId) -> usize {
        self.scopes.get(scope).map_or(0, BTreeMap::len)
    }

    /// Block ids of `scope` in ascending order.
    pub fn blocks(&self, scope: &ScopeId) -> Vec<BlockId> {
        self.scopes
            .get(scope)
            .map(|blocks| blocks.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Uniformly chosen block of `scope`.
    pub fn sample_block(&self, scope: &ScopeId, rng: &mut dyn RngCore) -> Option<BlockId> {
        let blocks = self.scopes.get(scope)?;
        if blocks.is_empty() {
            return None;
        }
        let index = rng.random_range(0..blocks.len());
        blocks.keys().nth(index).cloned()
    }

    pub fn log_density_of_block(&self, scope: &ScopeId) -> f64 {
        -(self.num_blocks(scope) as f64).ln()
    }

    /// Number of blocks `scope` would have once `delta` is committed.
    pub fn num_blocks_with(&self, scope: &ScopeId, delta: &TraceDelta) -> usize {
        let mut blocks: BTreeSet<&BlockId> = self
            .scopes
            .get(scope)
            .map(|blocks| blocks.keys().collect())
            .unwrap_or_default();
        blocks.extend(delta.blocks_in(scope));
        blocks.len()
    }

    /// Random choices in a block. Default-scope blocks hold the choice
    /// itself; named-scope blocks hold expression roots whose families are
    /// searched for unconstrained random choices.
    pub fn nodes_in_block(
        &self,
        scope: &ScopeId,
        block: &BlockId,
    ) -> Result<BTreeSet<NodeId>, ExecError> {
        let roots = self
            .scopes
            .get(scope)
            .and_then(|blocks| blocks.get(block))
            .ok_or_else(|| {
                ExecError::Evaluation(format!("no block {} in scope {}", block, scope))
            })?;
        if *scope == ScopeId::Default {
            return Ok(roots.clone());
        }
        let mut pnodes = BTreeSet::new();
        let mut visited = FxHashSet::default();
        for root in roots {
            self.add_random_choices_in_block(scope, block, &mut pnodes, &mut visited, *root)?;
        }
        Ok(pnodes)
    }

    pub fn all_nodes_in_scope(&self, scope: &ScopeId) -> Result<BTreeSet<NodeId>, ExecError> {
        let mut all = BTreeSet::new();
        for block in self.blocks(scope) {
            all.extend(self.nodes_in_block(scope, &block)?);
        }
        Ok(all)
    }

    /// One node set per block, in block order, optionally restricted to the
    /// inclusive range `[min, max]`.
    pub fn ordered_sets_in_scope(
        &self,
        scope: &ScopeId,
        range: Option<(&BlockId, &BlockId)>,
    ) -> Result<Vec<BTreeSet<NodeId>>, ExecError> {
        self.blocks(scope)
            .into_iter()
            .filter(|b| range.map_or(true, |(min, max)| b >= min && b <= max))
            .map(|b| self.nodes_in_block(scope, &b))
            .collect()
    }

    fn add_random_choices_in_block(
        &self,
        scope: &ScopeId,
        block: &BlockId,
        pnodes: &mut BTreeSet<NodeId>,
        visited: &mut FxHashSet<NodeId>,
        id: NodeId,
    ) -> Result<(), ExecError> {
        let node = self.node(id)?;
        if !node.is_output() || !visited.insert(id) {
            return Ok(());
        }
        let psp = self.psp_at(id)?;
        if psp.is_random() && !self.constrained.contains(&id) {
            pnodes.insert(id);
        }
        let request = node
            .request_node()
            .ok_or_else(|| invariant(format!("output {} without request", id)))?;
        if self.psp_at(request)?.is_random() && !self.constrained.contains(&request) {
            pnodes.insert(request);
        }
        if let Some(Value::Request(req)) = self.value(request) {
            let maker = self.sp_ref(request)?;
            for esr in &req.esrs {
                if let Some(root) = self.family(maker, &esr.id) {
                    self.add_random_choices_in_block(scope, block, pnodes, visited, root)?;
                }
            }
        }
        if let Some(operator) = node.operator() {
            self.add_random_choices_in_block(scope, block, pnodes, visited, operator)?;
        }
        let operands = node.operands().to_vec();
        for (i, operand) in operands.iter().enumerate() {
            if i == 2 && psp.kind() == PspKind::ScopeInclude {
                let (inner_scope, inner_block) = match (
                    self.value(operands[0]),
                    self.value(operands[1]),
                ) {
                    (Some(s), Some(b)) => scope_and_block(&s, &b)?,
                    _ => return Err(invariant(format!("scope_include {} has no keys", id))),
                };
                if *scope != inner_scope || *block == inner_block {
                    self.add_random_choices_in_block(scope, block, pnodes, visited, *operand)?;
                }
            } else {
                self.add_random_choices_in_block(scope, block, pnodes, visited, *operand)?;
            }
        }
        Ok(())
    }

    // ---- diagnostics ------------------------------------------------------

    /// Sum of log-densities of every random and constrained choice.
    pub fn global_log_score(&mut self) -> Result<f64, ExecError> {
        let nodes: Vec<NodeId> = self
            .random_choices
            .iter()
            .chain(self.constrained.iter())
            .copied()
            .collect();
        let mut score = 0.0;
        for id in nodes {
            score += self.log_density_at(id)?;
        }
        Ok(score)
    }

    pub fn log_density_at(&mut self, id: NodeId) -> Result<f64, ExecError> {
        let psp = self.psp_at(id)?;
        let args = self.args_at(id)?;
        let value = self.ground_value(id)?;
        psp.log_density(&value, &args)
    }

    // ---- particle commit --------------------------------------------------

    /// Merges a particle's overlay into the trace.
    pub fn commit(&mut self, delta: TraceDelta) -> Result<(), ExecError> {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            new_nodes = delta.nodes.len(),
            values = delta.values.len(),
            "committing particle"
        );
        for (id, node) in delta.nodes {
            if self.slot(id).is_ok() {
                return Err(invariant(format!("particle node {} collides with trace", id)));
            }
            self.install(id, node, None);
        }
        // Registered directly: registering a random choice would also
        // re-register it in the default scope, which the scope delta covers.
        self.random_choices.extend(delta.random_choices);
        for (scope, block, id) in delta.scopes {
            self.register_in_scope(scope, block, id)?;
        }
        self.constrained.extend(delta.constrained);
        self.ae_kernels.extend(delta.ae_kernels);
        for (id, value) in delta.values {
            self.slot_mut(id)?.value = value;
        }
        for (id, sp) in delta.made_sps {
            self.slot_mut(id)?.made_sp = Some(sp);
        }
        for (id, parents) in delta.esr_parents {
            self.slot_mut(id)?.esr_parents = parents;
        }
        for (id, count) in delta.num_requests {
            self.slot_mut(id)?.num_requests = count;
        }
        for (maker, families) in delta.families {
            let table = self.slot_mut(maker)?.families.get_or_insert_with(BTreeMap::new);
            table.extend(families);
        }
        for (id, children) in delta.children {
            self.slot_mut(id)?.children.extend(children);
        }
        for (id, aux) in delta.made_auxes {
            self.slot_mut(id)?.made_aux = Some(aux);
        }
        Ok(())
    }

    // ---- reclamation ------------------------------------------------------

    /// Frees the nodes of every family detached into a discarded `db`.
    pub fn reclaim(&mut self, db: &Db) {
        let roots: Vec<NodeId> = db.family_roots().collect();
        for root in roots {
            self.reclaim_family(root);
        }
    }

    /// Frees an unevaluated family: the root, its request node, operator and
    /// operands. Nodes that are still live are left alone.
    pub(crate) fn reclaim_family(&mut self, root: NodeId) {
        let Some(slot) = self.slots.get(root.index()).and_then(Option::as_ref) else {
            return;
        };
        let is_constant = matches!(slot.node.kind, NodeKind::Constant);
        if (slot.value.is_some() && !is_constant) || slot.num_requests > 0 {
            return;
        }
        let kind = slot.node.kind.clone();
        self.slots[root.index()] = None;
        self.free.push(root);
        if let NodeKind::Output {
            operator,
            operands,
            request,
            ..
        } = kind
        {
            if self.slots.get(request.index()).is_some_and(Option::is_some) {
                self.slots[request.index()] = None;
                self.free.push(request);
            }
            self.reclaim_family(operator);
            for operand in operands {
                self.reclaim_family(operand);
            }
        }
    }
}

impl TraceOps for Trace {
    fn node(&self, id: NodeId) -> Result<&Node, ExecError> {
        self.slot(id).map(|s| &s.node)
    }

    fn value(&self, id: NodeId) -> Option<Value> {
        self.slot(id).ok().and_then(|s| s.value.clone())
    }

    fn set_value(&mut self, id: NodeId, value: Value) -> Result<(), ExecError> {
        self.slot_mut(id)?.value = Some(value);
        Ok(())
    }

    fn clear_value(&mut self, id: NodeId) -> Result<(), ExecError> {
        self.slot_mut(id)?.value = None;
        Ok(())
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.slot(id)
            .map(|s| s.children.iter().copied().collect())
            .unwrap_or_default()
    }

    fn add_child(&mut self, id: NodeId, child: NodeId) -> Result<(), ExecError> {
        self.slot_mut(id)?.children.insert(child);
        Ok(())
    }

    fn remove_child(&mut self, id: NodeId, child: NodeId) -> Result<(), ExecError> {
        if !self.slot_mut(id)?.children.remove(&child) {
            return Err(invariant(format!("{} is not a child of {}", child, id)));
        }
        Ok(())
    }

    fn esr_parents(&self, id: NodeId) -> EsrParents {
        self.slot(id)
            .map(|s| s.esr_parents.clone())
            .unwrap_or_default()
    }

    fn append_esr_parent(&mut self, id: NodeId, parent: NodeId) -> Result<(), ExecError> {
        self.slot_mut(id)?.esr_parents.push(parent);
        Ok(())
    }

    fn pop_esr_parent(&mut self, id: NodeId) -> Result<NodeId, ExecError> {
        self.slot_mut(id)?
            .esr_parents
            .pop()
            .ok_or_else(|| invariant(format!("{} has no esr parent to pop", id)))
    }

    fn num_requests(&self, id: NodeId) -> u32 {
        self.slot(id).map_or(0, |s| s.num_requests)
    }

    fn inc_requests(&mut self, id: NodeId) -> Result<(), ExecError> {
        self.slot_mut(id)?.num_requests += 1;
        Ok(())
    }

    fn dec_requests(&mut self, id: NodeId) -> Result<(), ExecError> {
        let slot = self.slot_mut(id)?;
        slot.num_requests = slot
            .num_requests
            .checked_sub(1)
            .ok_or_else(|| invariant(format!("request count of {} below zero", id)))?;
        Ok(())
    }

    fn regen_count(&self, scaffold: &Scaffold, id: NodeId) -> Result<i32, ExecError> {
        scaffold
            .regen_count(id)
            .ok_or_else(|| invariant(format!("{} is not resampling", id)))
    }

    fn inc_regen_count(&mut self, scaffold: &Scaffold, id: NodeId) -> Result<(), ExecError> {
        scaffold.increment_regen_count(id)
    }

    fn dec_regen_count(&mut self, scaffold: &Scaffold, id: NodeId) -> Result<(), ExecError> {
        scaffold.decrement_regen_count(id)
    }

    fn made_sp(&self, maker: NodeId) -> Option<Arc<dyn Procedure>> {
        self.slot(maker).ok().and_then(|s| s.made_sp.clone())
    }

    fn set_made_sp(
        &mut self,
        maker: NodeId,
        sp: Option<Arc<dyn Procedure>>,
    ) -> Result<(), ExecError> {
        self.slot_mut(maker)?.made_sp = sp;
        Ok(())
    }

    fn made_aux(&mut self, maker: NodeId) -> Option<AuxHandle> {
        self.aux_handle(maker)
    }

    fn set_made_aux(&mut self, maker: NodeId, aux: Option<AuxHandle>) -> Result<(), ExecError> {
        self.slot_mut(maker)?.made_aux = aux;
        Ok(())
    }

    fn family(&self, maker: NodeId, id: &FamilyId) -> Option<NodeId> {
        self.slot(maker)
            .ok()
            .and_then(|s| s.families.as_ref())
            .and_then(|f| f.get(id).copied())
    }

    fn init_families(&mut self, maker: NodeId) -> Result<(), ExecError> {
        self.slot_mut(maker)?.families = Some(BTreeMap::new());
        Ok(())
    }

    fn clear_families(&mut self, maker: NodeId) -> Result<(), ExecError> {
        self.slot_mut(maker)?.families = None;
        Ok(())
    }

    fn register_family(
        &mut self,
        maker: NodeId,
        id: FamilyId,
        root: NodeId,
    ) -> Result<(), ExecError> {
        let families = self
            .slot_mut(maker)?
            .families
            .as_mut()
            .ok_or_else(|| invariant(format!("no family table at {}", maker)))?;
        if families.insert(id.clone(), root).is_some() {
            return Err(invariant(format!("family {:?} registered twice at {}", id, maker)));
        }
        Ok(())
    }

    fn unregister_family(&mut self, maker: NodeId, id: &FamilyId) -> Result<(), ExecError> {
        self.slot_mut(maker)?
            .families
            .as_mut()
            .and_then(|f| f.remove(id))
            .map(|_| ())
            .ok_or_else(|| invariant(format!("family {:?} not registered at {}", id, maker)))
    }

    fn register_random_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if !self.random_choices.insert(id) {
            return Err(invariant(format!("{} registered as a random choice twice", id)));
        }
        self.register_in_scope(ScopeId::Default, BlockId::Node(id), id)
    }

    fn unregister_random_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if !self.random_choices.remove(&id) {
            return Err(invariant(format!("{} is not a random choice", id)));
        }
        self.unregister_in_scope(&ScopeId::Default, &BlockId::Node(id), id)
    }

    fn register_constrained_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if !self.constrained.insert(id) {
            return Err(ExecError::Evaluation(format!(
                "cannot observe the same choice {} more than once",
                id
            )));
        }
        if self.random_choices.contains(&id) {
            self.unregister_random_choice(id)?;
        }
        Ok(())
    }

    fn unregister_constrained_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if !self.constrained.remove(&id) {
            return Err(invariant(format!("{} is not constrained", id)));
        }
        if self.psp_at(id)?.is_random() {
            self.register_random_choice(id)?;
        }
        Ok(())
    }

    fn is_constrained(&self, id: NodeId) -> bool {
        self.constrained.contains(&id)
    }

    fn register_in_scope(
        &mut self,
        scope: ScopeId,
        block: BlockId,
        id: NodeId,
    ) -> Result<(), ExecError> {
        if !self
            .scopes
            .entry(scope)
            .or_default()
            .entry(block)
            .or_default()
            .insert(id)
        {
            return Err(invariant(format!("{} registered twice in one block", id)));
        }
        Ok(())
    }

    fn unregister_in_scope(
        &mut self,
        scope: &ScopeId,
        block: &BlockId,
        id: NodeId,
    ) -> Result<(), ExecError> {
        let blocks = self
            .scopes
            .get_mut(scope)
            .ok_or_else(|| invariant(format!("unknown scope {}", scope)))?;
        let nodes = blocks
            .get_mut(block)
            .ok_or_else(|| invariant(format!("unknown block {} in {}", block, scope)))?;
        if !nodes.remove(&id) {
            return Err(invariant(format!("{} not registered in block {}", id, block)));
        }
        if nodes.is_empty() {
            blocks.remove(block);
        }
        if blocks.is_empty() {
            self.scopes.remove(scope);
        }
        Ok(())
    }

    fn register_ae_kernel(&mut self, maker: NodeId) -> Result<(), ExecError> {
        self.ae_kernels.insert(maker);
        Ok(())
    }

    fn unregister_ae_kernel(&mut self, maker: NodeId) -> Result<(), ExecError> {
        if !self.ae_kernels.remove(&maker) {
            return Err(invariant(format!("no auxiliary kernel registered at {}", maker)));
        }
        Ok(())
    }

    fn create_constant(&mut self, value: Value) -> Result<NodeId, ExecError> {
        let id = self.reserve_id();
        self.install(id, Node::constant(), Some(value));
        Ok(id)
    }

    fn create_lookup(&mut self, source: NodeId) -> Result<NodeId, ExecError> {
        let value = self.value(source);
        let id = self.reserve_id();
        self.install(id, Node::lookup(source), value);
        self.add_child(source, id)?;
        Ok(id)
    }

    fn create_application(
        &mut self,
        operator: NodeId,
        operands: Operands,
        env: Env,
    ) -> Result<(NodeId, NodeId), ExecError> {
        let request = self.reserve_id();
        let output = self.reserve_id();
        let (request_node, output_node) =
            application_nodes(request, output, operator, operands.clone(), env);
        self.install(request, request_node, None);
        self.install(output, output_node, None);
        for parent in std::iter::once(operator).chain(operands) {
            self.add_child(parent, request)?;
            self.add_child(parent, output)?;
        }
        Ok((request, output))
    }

    fn disconnect_lookup(&mut self, lookup: NodeId) -> Result<(), ExecError> {
        let source = self
            .node(lookup)?
            .lookup_source()
            .ok_or_else(|| invariant(format!("{} is not a lookup", lookup)))?;
        self.remove_child(source, lookup)
    }

    fn reconnect_lookup(&mut self, lookup: NodeId) -> Result<(), ExecError> {
        let source = self
            .node(lookup)?
            .lookup_source()
            .ok_or_else(|| invariant(format!("{} is not a lookup", lookup)))?;
        self.add_child(source, lookup)
    }

    fn observation(&self, id: NodeId) -> Option<Value> {
        self.slot(id).ok().and_then(|s| s.observed.clone())
    }

    fn discard_family(&mut self, root: NodeId) {
        self.reclaim_family(root);
    }
}

/// The paired node structures of one application.
pub(crate) fn application_nodes(
    request: NodeId,
    output: NodeId,
    operator: NodeId,
    operands: Operands,
    env: Env,
) -> (Node, Node) {
    (
        Node {
            kind: NodeKind::Request {
                operator,
                operands: operands.clone(),
                env: env.clone(),
                output,
            },
        },
        Node {
            kind: NodeKind::Output {
                operator,
                operands,
                env,
                request,
            },
        },
    )
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("live_nodes", &self.live_node_count())
            .field("free", &self.free.len())
            .field("random_choices", &self.random_choices.len())
            .field("constrained", &self.constrained.len())
            .field("scopes", &self.scopes.len())
            .finish()
    }
}
