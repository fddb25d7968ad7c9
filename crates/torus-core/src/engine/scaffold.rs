//! # Scaffold Builder
//!
//! A scaffold is the plan for one resampling step. Starting from one or more
//! sets of principal nodes it partitions the reachable subgraph into:
//!
//! - **resampling** nodes (the DRG), whose values are recomputed
//! - **absorbing** nodes, which only have their log-density re-evaluated
//! - **collapse-absorbing** (AAA) makers, whose made procedure is resimulated
//!   while its sufficient statistics are kept
//! - **brush**: families that are only reachable through requests that the
//!   resampled state may no longer make
//!
//! and sequences the border (the nodes where detach starts and regen ends)
//! into one stage per principal set.
//!
//! Regen counts are atomics so that particles regenerating in parallel can
//! share one `&Scaffold`; the trace itself only touches them from the
//! foreground thread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI32, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::engine::errors::{invariant, ExecError};
use crate::engine::lkernel::LKernel;
use crate::engine::node::{NodeId, NodeKind, ParentRole};
use crate::engine::trace::{Trace, TraceOps};
use crate::engine::value::Value;

#[derive(Debug, Default)]
pub struct Scaffold {
    principal: Vec<BTreeSet<NodeId>>,
    regen_counts: FxHashMap<NodeId, AtomicI32>,
    absorbing: BTreeSet<NodeId>,
    aaa: BTreeSet<NodeId>,
    brush: BTreeSet<NodeId>,
    border: Vec<Vec<NodeId>>,
    lkernels: FxHashMap<NodeId, LKernel>,
}

/// Working sets of the candidate expansion.
#[derive(Default)]
struct Candidates {
    drg: BTreeSet<NodeId>,
    absorbing: BTreeSet<NodeId>,
    aaa: BTreeSet<NodeId>,
    stage: FxHashMap<NodeId, usize>,
}

impl Candidates {
    fn add_resampling(
        &mut self,
        trace: &Trace,
        queue: &mut Vec<(NodeId, bool, Option<NodeId>)>,
        node: NodeId,
        stage: usize,
    ) {
        self.absorbing.remove(&node);
        self.aaa.remove(&node);
        self.drg.insert(node);
        queue.extend(trace.children(node).into_iter().map(|c| (c, false, Some(node))));
        self.stage.insert(node, stage);
    }

    fn add_absorbing(&mut self, node: NodeId, stage: usize) {
        self.absorbing.insert(node);
        self.stage.insert(node, stage);
    }

    fn add_aaa(&mut self, node: NodeId, stage: usize) {
        self.absorbing.remove(&node);
        self.drg.insert(node);
        self.aaa.insert(node);
        self.stage.insert(node, stage);
    }
}

impl Scaffold {
    /// A scaffold with nothing to resample and one empty border stage.
    pub fn empty() -> Self {
        Self {
            border: vec![Vec::new()],
            ..Self::default()
        }
    }

    /// Plans a resampling step over `principal` (one set per stage).
    pub fn build(
        trace: &Trace,
        principal: Vec<BTreeSet<NodeId>>,
        use_delta_kernels: bool,
    ) -> Result<Self, ExecError> {
        if principal.is_empty() || principal.iter().any(BTreeSet::is_empty) {
            return Err(ExecError::InvalidScaffold(
                "principal node sets must be non-empty".into(),
            ));
        }

        let mut candidates = Candidates::default();
        for (stage, pnodes) in principal.iter().enumerate() {
            extend_candidates(trace, pnodes, &mut candidates, stage)?;
        }

        let brush = find_brush(trace, &candidates.drg)?;
        let drg: BTreeSet<NodeId> = candidates.drg.difference(&brush).copied().collect();
        let absorbing: BTreeSet<NodeId> =
            candidates.absorbing.difference(&brush).copied().collect();
        let aaa: BTreeSet<NodeId> = candidates.aaa.difference(&brush).copied().collect();
        if !aaa.is_subset(&drg) || !drg.is_disjoint(&absorbing) {
            return Err(invariant("scaffold partition is not disjoint"));
        }

        let border = find_border(trace, &drg, &absorbing, &aaa);
        let counts = compute_regen_counts(trace, &drg, &absorbing, &aaa, &border, &brush)?;
        let lkernels = load_kernels(trace, &drg, &aaa, use_delta_kernels)?;

        let mut sequence = vec![Vec::new(); principal.len()];
        for node in &border {
            let stage = candidates
                .stage
                .get(node)
                .copied()
                .ok_or_else(|| invariant(format!("border node {} has no stage", node)))?;
            sequence[stage].push(*node);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(
            stages = principal.len(),
            drg = drg.len(),
            absorbing = absorbing.len(),
            aaa = aaa.len(),
            brush = brush.len(),
            "scaffold built"
        );

        Ok(Self {
            principal,
            regen_counts: counts
                .into_iter()
                .map(|(n, c)| (n, AtomicI32::new(c)))
                .collect(),
            absorbing,
            aaa,
            brush,
            border: sequence,
            lkernels,
        })
    }

    pub fn principal_sets(&self) -> &[BTreeSet<NodeId>] {
        &self.principal
    }

    pub fn principal_nodes(&self) -> BTreeSet<NodeId> {
        self.principal.iter().flatten().copied().collect()
    }

    /// The only principal node of a single-node, single-stage scaffold.
    pub fn single_principal(&self) -> Result<NodeId, ExecError> {
        match self.principal.as_slice() {
            [set] if set.len() == 1 => set
                .iter()
                .next()
                .copied()
                .ok_or_else(|| invariant("empty principal set")),
            _ => Err(ExecError::CapabilityMissing(
                "kernel requires exactly one principal node".into(),
            )),
        }
    }

    pub fn border(&self) -> &[Vec<NodeId>] {
        &self.border
    }

    pub fn border_stage(&self, stage: usize) -> Result<&[NodeId], ExecError> {
        self.border
            .get(stage)
            .map(Vec::as_slice)
            .ok_or_else(|| invariant(format!("border stage {} out of range", stage)))
    }

    pub fn num_stages(&self) -> usize {
        self.border.len()
    }

    pub fn is_resampling(&self, node: NodeId) -> bool {
        self.regen_counts.contains_key(&node)
    }

    pub fn is_absorbing(&self, node: NodeId) -> bool {
        self.absorbing.contains(&node)
    }

    pub fn is_aaa(&self, node: NodeId) -> bool {
        self.aaa.contains(&node)
    }

    pub fn is_brush(&self, node: NodeId) -> bool {
        self.brush.contains(&node)
    }

    pub fn resampling_nodes(&self) -> BTreeSet<NodeId> {
        self.regen_counts.keys().copied().collect()
    }

    pub fn absorbing_nodes(&self) -> &BTreeSet<NodeId> {
        &self.absorbing
    }

    pub fn aaa_nodes(&self) -> &BTreeSet<NodeId> {
        &self.aaa
    }

    pub fn brush_nodes(&self) -> &BTreeSet<NodeId> {
        &self.brush
    }

    pub fn lkernel(&self, node: NodeId) -> Option<&LKernel> {
        self.lkernels.get(&node)
    }

    pub fn lkernel_mut(&mut self, node: NodeId) -> Option<&mut LKernel> {
        self.lkernels.get_mut(&node)
    }

    pub fn set_lkernel(&mut self, node: NodeId, kernel: LKernel) {
        self.lkernels.insert(node, kernel);
    }

    pub fn remove_lkernel(&mut self, node: NodeId) -> Option<LKernel> {
        self.lkernels.remove(&node)
    }

    pub fn regen_count(&self, node: NodeId) -> Option<i32> {
        self.regen_counts
            .get(&node)
            .map(|c| c.load(Ordering::Relaxed))
    }

    pub(crate) fn increment_regen_count(&self, node: NodeId) -> Result<(), ExecError> {
        self.regen_counts
            .get(&node)
            .ok_or_else(|| invariant(format!("{} is not resampling", node)))?
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn decrement_regen_count(&self, node: NodeId) -> Result<(), ExecError> {
        let count = self
            .regen_counts
            .get(&node)
            .ok_or_else(|| invariant(format!("{} is not resampling", node)))?;
        let previous = count.fetch_sub(1, Ordering::Relaxed);
        if previous <= 0 {
            count.fetch_add(1, Ordering::Relaxed);
            return Err(invariant(format!(
                "detaching {} whose regen count is {}",
                node, previous
            )));
        }
        Ok(())
    }

    /// Current regen counts, for inspection and tests.
    pub fn regen_counts(&self) -> BTreeMap<NodeId, i32> {
        self.regen_counts
            .iter()
            .map(|(n, c)| (*n, c.load(Ordering::Relaxed)))
            .collect()
    }

    /// True when every regen count is zero: the scaffold is fully detached.
    pub fn is_torus(&self) -> bool {
        self.regen_counts
            .values()
            .all(|c| c.load(Ordering::Relaxed) == 0)
    }

    pub fn check_torus(&self) -> Result<(), ExecError> {
        if let Some((node, count)) = self
            .regen_counts
            .iter()
            .map(|(n, c)| (*n, c.load(Ordering::Relaxed)))
            .find(|(_, c)| *c != 0)
        {
            return Err(invariant(format!(
                "not at the torus point: {} has regen count {}",
                node, count
            )));
        }
        Ok(())
    }
}

fn parent_role(trace: &Trace, node: NodeId, parent: NodeId) -> Result<Option<ParentRole>, ExecError> {
    if let Some(role) = trace.node(node)?.definite_role_of(parent) {
        return Ok(Some(role));
    }
    Ok(trace
        .esr_parents(node)
        .iter()
        .position(|p| *p == parent)
        .map(ParentRole::Esr))
}

fn extend_candidates(
    trace: &Trace,
    pnodes: &BTreeSet<NodeId>,
    c: &mut Candidates,
    stage: usize,
) -> Result<(), ExecError> {
    let mut queue: Vec<(NodeId, bool, Option<NodeId>)> =
        pnodes.iter().map(|n| (*n, true, None)).collect();

    while let Some((node, is_principal, parent)) = queue.pop() {
        let kind = &trace.node(node)?.kind;
        if matches!(kind, NodeKind::Constant) {
            return Err(ExecError::InvalidScaffold(format!(
                "constant {} cannot be resampled",
                node
            )));
        }
        if c.drg.contains(&node) && !c.aaa.contains(&node) {
            // Re-walking with an unchanged stage would enqueue the same work.
            if c.stage.get(&node) != Some(&stage) {
                c.add_resampling(trace, &mut queue, node, stage);
            }
            continue;
        }
        let operator_resampling = trace
            .node(node)?
            .operator()
            .is_some_and(|op| c.drg.contains(&op));
        if matches!(kind, NodeKind::Lookup { .. }) || operator_resampling {
            c.add_resampling(trace, &mut queue, node, stage);
        } else if c.aaa.contains(&node) {
            c.add_aaa(node, stage);
        } else {
            let psp = trace.psp_at(node)?;
            let absorbs = match (is_principal, parent) {
                (false, Some(parent)) => parent_role(trace, node, parent)?
                    .is_some_and(|role| psp.can_absorb(role)),
                _ => false,
            };
            if absorbs {
                c.add_absorbing(node, stage);
            } else if psp.children_can_aaa() {
                c.add_aaa(node, stage);
            } else {
                c.add_resampling(trace, &mut queue, node, stage);
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct BrushSearch {
    disable_counts: FxHashMap<NodeId, u32>,
    disabled_requests: FxHashSet<NodeId>,
    brush: BTreeSet<NodeId>,
}

fn find_brush(trace: &Trace, drg: &BTreeSet<NodeId>) -> Result<BTreeSet<NodeId>, ExecError> {
    let mut search = BrushSearch::default();
    for node in drg {
        if trace.node(*node)?.is_request() {
            disable_requests(trace, *node, &mut search)?;
        }
    }
    Ok(search.brush)
}

fn disable_requests(trace: &Trace, request: NodeId, s: &mut BrushSearch) -> Result<(), ExecError> {
    if !s.disabled_requests.insert(request) {
        return Ok(());
    }
    let output = trace
        .node(request)?
        .output_node()
        .ok_or_else(|| invariant(format!("{} is not a request node", request)))?;
    for esr_parent in trace.esr_parents(output) {
        let count = s.disable_counts.entry(esr_parent).or_insert(0);
        *count += 1;
        if *count == trace.num_requests(esr_parent) {
            disable_family(trace, esr_parent, s)?;
        }
    }
    Ok(())
}

fn disable_family(trace: &Trace, node: NodeId, s: &mut BrushSearch) -> Result<(), ExecError> {
    if !s.brush.insert(node) {
        return Ok(());
    }
    if let NodeKind::Output {
        operator,
        operands,
        request,
        ..
    } = &trace.node(node)?.kind
    {
        s.brush.insert(*request);
        disable_requests(trace, *request, s)?;
        disable_family(trace, *operator, s)?;
        for operand in operands {
            disable_family(trace, *operand, s)?;
        }
    }
    Ok(())
}

fn find_border(
    trace: &Trace,
    drg: &BTreeSet<NodeId>,
    absorbing: &BTreeSet<NodeId>,
    aaa: &BTreeSet<NodeId>,
) -> BTreeSet<NodeId> {
    let mut border: BTreeSet<NodeId> = absorbing.union(aaa).copied().collect();
    for node in drg.difference(aaa) {
        let has_child_in_a_or_d = trace
            .children(*node)
            .iter()
            .any(|c| drg.contains(c) || absorbing.contains(c));
        if !has_child_in_a_or_d {
            border.insert(*node);
        }
    }
    border
}

fn maybe_increment_aaa_count(
    trace: &Trace,
    counts: &mut BTreeMap<NodeId, i32>,
    aaa: &BTreeSet<NodeId>,
    node: NodeId,
) {
    if let Some(Value::SpRef(maker)) = trace.value(node) {
        if aaa.contains(&maker) {
            *counts.entry(maker).or_insert(0) += 1;
        }
    }
}

fn compute_regen_counts(
    trace: &Trace,
    drg: &BTreeSet<NodeId>,
    absorbing: &BTreeSet<NodeId>,
    aaa: &BTreeSet<NodeId>,
    border: &BTreeSet<NodeId>,
    brush: &BTreeSet<NodeId>,
) -> Result<BTreeMap<NodeId, i32>, ExecError> {
    let mut counts = BTreeMap::new();
    for node in drg {
        let count = if aaa.contains(node) {
            1
        } else if border.contains(node) {
            trace.children(*node).len() as i32 + 1
        } else {
            trace.children(*node).len() as i32
        };
        counts.insert(*node, count);
    }

    if !aaa.is_empty() {
        for node in drg.union(absorbing) {
            for parent in trace.parents(*node)? {
                maybe_increment_aaa_count(trace, &mut counts, aaa, parent);
            }
        }
        for node in brush {
            match &trace.node(*node)?.kind {
                NodeKind::Output { .. } => {
                    for esr_parent in trace.esr_parents(*node) {
                        maybe_increment_aaa_count(trace, &mut counts, aaa, esr_parent);
                    }
                }
                NodeKind::Lookup { source } => {
                    maybe_increment_aaa_count(trace, &mut counts, aaa, *source);
                }
                _ => {}
            }
        }
    }
    Ok(counts)
}

fn load_kernels(
    trace: &Trace,
    drg: &BTreeSet<NodeId>,
    aaa: &BTreeSet<NodeId>,
    use_delta_kernels: bool,
) -> Result<FxHashMap<NodeId, LKernel>, ExecError> {
    let mut kernels = FxHashMap::default();
    for node in aaa {
        kernels.insert(
            *node,
            LKernel::Aaa {
                maker_psp: trace.psp_at(*node)?,
            },
        );
    }
    if use_delta_kernels {
        for node in drg.difference(aaa) {
            let n = trace.node(*node)?;
            if !n.is_output() {
                continue;
            }
            let inputs_fixed = n.operator().is_some_and(|op| !drg.contains(&op))
                && n.operands().iter().all(|o| !drg.contains(o));
            if !inputs_fixed {
                continue;
            }
            if let Some(kernel) = trace.psp_at(*node)?.delta_kernel() {
                kernels.insert(*node, LKernel::Delta(kernel));
            }
        }
    }
    Ok(kernels)
}
