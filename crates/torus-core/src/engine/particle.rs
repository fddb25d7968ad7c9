//! # Particle Overlays
//!
//! A [`Particle`] is a copy-on-write view over a committed [`Trace`]. Every
//! write lands in persistent maps owned by the particle, so [`Particle::fork`]
//! is cheap and sibling particles never observe each other's changes. Reads
//! fall through to the base for anything the particle has not touched.
//!
//! Particles are purely additive. Removal operations (`dec_requests`,
//! `remove_child`, `unregister_family` and friends) return
//! [`ExecError::Unsupported`].
//!
//! A particle is turned into a [`TraceDelta`] and merged with
//! [`Trace::commit`].

use std::fmt;
use std::sync::Arc;

use im::{OrdMap, OrdSet, Vector};
use rustc_hash::FxHashMap;

use crate::engine::env::Env;
use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::{BlockId, FamilyId, Node, NodeId, Operands, ScopeId};
use crate::engine::procedure::{clone_aux_handle, AuxHandle, Procedure};
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{application_nodes, EsrParents, Trace, TraceOps};
use crate::engine::value::Value;

/// Everything a particle added, ready to be merged into its base trace.
#[derive(Default)]
pub struct TraceDelta {
    pub(crate) nodes: Vec<(NodeId, Node)>,
    pub(crate) random_choices: Vec<NodeId>,
    pub(crate) scopes: Vec<(ScopeId, BlockId, NodeId)>,
    pub(crate) constrained: Vec<NodeId>,
    pub(crate) ae_kernels: Vec<NodeId>,
    pub(crate) values: Vec<(NodeId, Option<Value>)>,
    pub(crate) made_sps: Vec<(NodeId, Arc<dyn Procedure>)>,
    pub(crate) esr_parents: Vec<(NodeId, EsrParents)>,
    pub(crate) num_requests: Vec<(NodeId, u32)>,
    pub(crate) families: Vec<(NodeId, Vec<(FamilyId, NodeId)>)>,
    pub(crate) children: Vec<(NodeId, Vec<NodeId>)>,
    pub(crate) made_auxes: Vec<(NodeId, AuxHandle)>,
}

impl TraceDelta {
    pub fn num_new_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Blocks of `scope` that gained a member.
    pub fn blocks_in<'s>(&'s self, scope: &'s ScopeId) -> impl Iterator<Item = &'s BlockId> + 's {
        self.scopes
            .iter()
            .filter(move |(s, _, _)| s == scope)
            .map(|(_, block, _)| block)
    }
}

impl fmt::Debug for TraceDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceDelta")
            .field("nodes", &self.nodes.len())
            .field("values", &self.values.len())
            .field("random_choices", &self.random_choices.len())
            .field("families", &self.families.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct Particle<'a> {
    base: &'a Trace,
    next_id: u32,
    nodes: OrdMap<NodeId, Node>,
    values: OrdMap<NodeId, Option<Value>>,
    made_sps: OrdMap<NodeId, Option<Arc<dyn Procedure>>>,
    // Not persistent: aux state is mutated in place, so forks deep-copy it.
    made_auxes: FxHashMap<NodeId, Option<AuxHandle>>,
    esr_parents: OrdMap<NodeId, EsrParents>,
    num_requests: OrdMap<NodeId, u32>,
    regen_counts: OrdMap<NodeId, i32>,
    families: OrdMap<NodeId, OrdMap<FamilyId, NodeId>>,
    children: OrdMap<NodeId, OrdSet<NodeId>>,
    random_choices: OrdSet<NodeId>,
    constrained: OrdSet<NodeId>,
    ae_kernels: OrdSet<NodeId>,
    scopes: Vector<(ScopeId, BlockId, NodeId)>,
}

impl<'a> Particle<'a> {
    pub fn new(base: &'a Trace) -> Self {
        Self {
            base,
            next_id: base.capacity() as u32,
            nodes: OrdMap::new(),
            values: OrdMap::new(),
            made_sps: OrdMap::new(),
            made_auxes: FxHashMap::default(),
            esr_parents: OrdMap::new(),
            num_requests: OrdMap::new(),
            regen_counts: OrdMap::new(),
            families: OrdMap::new(),
            children: OrdMap::new(),
            random_choices: OrdSet::new(),
            constrained: OrdSet::new(),
            ae_kernels: OrdSet::new(),
            scopes: Vector::new(),
        }
    }

    pub fn base(&self) -> &'a Trace {
        self.base
    }

    /// An independent copy sharing structure with `self`.
    pub fn fork(&self) -> Self {
        let mut forked = self.clone();
        forked.made_auxes = self
            .made_auxes
            .iter()
            .map(|(id, aux)| (*id, aux.as_ref().map(clone_aux_handle)))
            .collect();
        forked
    }

    pub fn num_new_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_random_choice(&self, id: NodeId) -> bool {
        self.random_choices.contains(&id) || self.base.is_random_choice(id)
    }

    pub fn into_delta(self) -> TraceDelta {
        TraceDelta {
            nodes: self.nodes.into_iter().collect(),
            random_choices: self.random_choices.into_iter().collect(),
            scopes: self.scopes.into_iter().collect(),
            constrained: self.constrained.into_iter().collect(),
            ae_kernels: self.ae_kernels.into_iter().collect(),
            values: self.values.into_iter().collect(),
            made_sps: self
                .made_sps
                .into_iter()
                .filter_map(|(id, sp)| sp.map(|sp| (id, sp)))
                .collect(),
            esr_parents: self.esr_parents.into_iter().collect(),
            num_requests: self.num_requests.into_iter().collect(),
            families: self
                .families
                .into_iter()
                .map(|(maker, table)| (maker, table.into_iter().collect()))
                .collect(),
            children: self
                .children
                .into_iter()
                .map(|(id, children)| (id, children.into_iter().collect()))
                .collect(),
            made_auxes: self
                .made_auxes
                .into_iter()
                .filter_map(|(id, aux)| aux.map(|aux| (id, aux)))
                .collect(),
        }
    }

    fn reserve_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl TraceOps for Particle<'_> {
    fn node(&self, id: NodeId) -> Result<&Node, ExecError> {
        match self.nodes.get(&id) {
            Some(node) => Ok(node),
            None => self.base.node(id),
        }
    }

    fn value(&self, id: NodeId) -> Option<Value> {
        match self.values.get(&id) {
            Some(value) => value.clone(),
            None => self.base.value(id),
        }
    }

    fn set_value(&mut self, id: NodeId, value: Value) -> Result<(), ExecError> {
        self.values.insert(id, Some(value));
        Ok(())
    }

    fn clear_value(&mut self, id: NodeId) -> Result<(), ExecError> {
        self.values.insert(id, None);
        Ok(())
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children = self.base.children(id);
        if let Some(added) = self.children.get(&id) {
            children.extend(added.iter().copied());
            children.sort_unstable();
            children.dedup();
        }
        children
    }

    fn add_child(&mut self, id: NodeId, child: NodeId) -> Result<(), ExecError> {
        let mut children = self.children.get(&id).cloned().unwrap_or_default();
        children.insert(child);
        self.children.insert(id, children);
        Ok(())
    }

    fn remove_child(&mut self, _id: NodeId, _child: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("remove_child"))
    }

    fn esr_parents(&self, id: NodeId) -> EsrParents {
        match self.esr_parents.get(&id) {
            Some(parents) => parents.clone(),
            None => self.base.esr_parents(id),
        }
    }

    fn append_esr_parent(&mut self, id: NodeId, parent: NodeId) -> Result<(), ExecError> {
        let mut parents = self.esr_parents(id);
        parents.push(parent);
        self.esr_parents.insert(id, parents);
        Ok(())
    }

    fn pop_esr_parent(&mut self, _id: NodeId) -> Result<NodeId, ExecError> {
        Err(ExecError::Unsupported("pop_esr_parent"))
    }

    fn num_requests(&self, id: NodeId) -> u32 {
        match self.num_requests.get(&id) {
            Some(count) => *count,
            None => self.base.num_requests(id),
        }
    }

    fn inc_requests(&mut self, id: NodeId) -> Result<(), ExecError> {
        let count = self.num_requests(id) + 1;
        self.num_requests.insert(id, count);
        Ok(())
    }

    fn dec_requests(&mut self, _id: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("dec_requests"))
    }

    /// Particles regenerate only into detached scaffolds, so the shared
    /// counts must be zero; the particle keeps its own from there.
    fn regen_count(&self, scaffold: &Scaffold, id: NodeId) -> Result<i32, ExecError> {
        match scaffold.regen_count(id) {
            Some(0) => Ok(self.regen_counts.get(&id).copied().unwrap_or(0)),
            Some(count) => Err(invariant(format!(
                "particle regen over attached node {} (count {})",
                id, count
            ))),
            None => Err(invariant(format!("{} is not resampling", id))),
        }
    }

    fn inc_regen_count(&mut self, scaffold: &Scaffold, id: NodeId) -> Result<(), ExecError> {
        let count = self.regen_count(scaffold, id)? + 1;
        self.regen_counts.insert(id, count);
        Ok(())
    }

    fn dec_regen_count(&mut self, _scaffold: &Scaffold, _id: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("dec_regen_count"))
    }

    fn made_sp(&self, maker: NodeId) -> Option<Arc<dyn Procedure>> {
        match self.made_sps.get(&maker) {
            Some(sp) => sp.clone(),
            None => self.base.made_sp(maker),
        }
    }

    fn set_made_sp(
        &mut self,
        maker: NodeId,
        sp: Option<Arc<dyn Procedure>>,
    ) -> Result<(), ExecError> {
        self.made_sps.insert(maker, sp);
        Ok(())
    }

    fn made_aux(&mut self, maker: NodeId) -> Option<AuxHandle> {
        if let Some(aux) = self.made_auxes.get(&maker) {
            return aux.clone();
        }
        let copied = self.base.aux_handle(maker).map(|aux| clone_aux_handle(&aux))?;
        self.made_auxes.insert(maker, Some(copied.clone()));
        Some(copied)
    }

    fn set_made_aux(&mut self, maker: NodeId, aux: Option<AuxHandle>) -> Result<(), ExecError> {
        self.made_auxes.insert(maker, aux);
        Ok(())
    }

    fn family(&self, maker: NodeId, id: &FamilyId) -> Option<NodeId> {
        self.families
            .get(&maker)
            .and_then(|table| table.get(id).copied())
            .or_else(|| self.base.family(maker, id))
    }

    fn init_families(&mut self, maker: NodeId) -> Result<(), ExecError> {
        self.families.insert(maker, OrdMap::new());
        Ok(())
    }

    fn clear_families(&mut self, _maker: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("clear_families"))
    }

    fn register_family(
        &mut self,
        maker: NodeId,
        id: FamilyId,
        root: NodeId,
    ) -> Result<(), ExecError> {
        if self.family(maker, &id).is_some() {
            return Err(invariant(format!("family {:?} registered twice at {}", id, maker)));
        }
        let mut table = self.families.get(&maker).cloned().unwrap_or_default();
        table.insert(id, root);
        self.families.insert(maker, table);
        Ok(())
    }

    fn unregister_family(&mut self, _maker: NodeId, _id: &FamilyId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("unregister_family"))
    }

    fn register_random_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if self.is_random_choice(id) {
            return Err(invariant(format!("{} registered as a random choice twice", id)));
        }
        self.random_choices.insert(id);
        self.register_in_scope(ScopeId::Default, BlockId::Node(id), id)
    }

    fn unregister_random_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if self.random_choices.remove(&id).is_none() {
            return Err(ExecError::Unsupported("unregister_random_choice"));
        }
        self.unregister_in_scope(&ScopeId::Default, &BlockId::Node(id), id)
    }

    fn register_constrained_choice(&mut self, id: NodeId) -> Result<(), ExecError> {
        if self.is_constrained(id) {
            return Err(ExecError::Evaluation(format!(
                "cannot observe the same choice {} more than once",
                id
            )));
        }
        self.constrained.insert(id);
        if self.random_choices.contains(&id) {
            self.unregister_random_choice(id)?;
        }
        Ok(())
    }

    fn unregister_constrained_choice(&mut self, _id: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("unregister_constrained_choice"))
    }

    fn is_constrained(&self, id: NodeId) -> bool {
        self.constrained.contains(&id) || self.base.is_constrained(id)
    }

    fn register_in_scope(
        &mut self,
        scope: ScopeId,
        block: BlockId,
        id: NodeId,
    ) -> Result<(), ExecError> {
        self.scopes.push_back((scope, block, id));
        Ok(())
    }

    fn unregister_in_scope(
        &mut self,
        scope: &ScopeId,
        block: &BlockId,
        id: NodeId,
    ) -> Result<(), ExecError> {
        let position = self
            .scopes
            .iter()
            .position(|(s, b, n)| s == scope && b == block && *n == id)
            .ok_or(ExecError::Unsupported("unregister_in_scope"))?;
        self.scopes.remove(position);
        Ok(())
    }

    fn register_ae_kernel(&mut self, maker: NodeId) -> Result<(), ExecError> {
        self.ae_kernels.insert(maker);
        Ok(())
    }

    fn unregister_ae_kernel(&mut self, _maker: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("unregister_ae_kernel"))
    }

    fn create_constant(&mut self, value: Value) -> Result<NodeId, ExecError> {
        let id = self.reserve_id();
        self.nodes.insert(id, Node::constant());
        self.values.insert(id, Some(value));
        Ok(id)
    }

    fn create_lookup(&mut self, source: NodeId) -> Result<NodeId, ExecError> {
        let value = self.value(source);
        let id = self.reserve_id();
        self.nodes.insert(id, Node::lookup(source));
        self.values.insert(id, value);
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
        self.nodes.insert(request, request_node);
        self.nodes.insert(output, output_node);
        for parent in std::iter::once(operator).chain(operands) {
            self.add_child(parent, request)?;
            self.add_child(parent, output)?;
        }
        Ok((request, output))
    }

    fn disconnect_lookup(&mut self, _lookup: NodeId) -> Result<(), ExecError> {
        Err(ExecError::Unsupported("disconnect_lookup"))
    }

    fn reconnect_lookup(&mut self, lookup: NodeId) -> Result<(), ExecError> {
        let source = self
            .node(lookup)?
            .lookup_source()
            .ok_or_else(|| invariant(format!("{} is not a lookup", lookup)))?;
        self.add_child(source, lookup)
    }

    fn observation(&self, id: NodeId) -> Option<Value> {
        self.base.observation(id)
    }

    fn unwinds_failures(&self) -> bool {
        false
    }
}

impl fmt::Debug for Particle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("next_id", &self.next_id)
            .field("new_nodes", &self.nodes.len())
            .field("values", &self.values.len())
            .field("random_choices", &self.random_choices.len())
            .finish()
    }
}
