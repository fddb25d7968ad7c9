//! Directive-level driver over a single [`Trace`].
//!
//! The engine owns the trace, the random number generator, and the table of
//! directives (`assume`, `predict`, `observe`). Observations are deferred
//! until [`Engine::make_consistent`]; inference programs are described by a
//! [`KernelSpec`] and run with [`Engine::infer`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use torus_frontend::SExp;

use crate::engine::config::EngineConfig;
use crate::engine::db::Db;
use crate::engine::detach::{detach_and_extract, unconstrain, uneval};
use crate::engine::errors::{invariant, ExecError};
use crate::engine::exp::Exp;
use crate::engine::infer::{
    mix_mh, run_ae_kernels, BlockSelector, FuncMhOperator, MeanFieldOperator, MhOperator,
    Operator, PGibbsOperator, ScaffoldIndexer, SliceOperator, Transition,
};
use crate::engine::lkernel::LKernel;
use crate::engine::node::{BlockId, NodeId, ScopeId};
use crate::engine::regen::{constrain, evaluate, regen_and_attach};
use crate::engine::scaffold::Scaffold;
use crate::engine::trace::{Trace, TraceOps};
use crate::engine::value::Value;

/// Handle of a directive, unique for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectiveId(pub u32);

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "directive {}", self.0)
    }
}

#[derive(Debug, Clone)]
enum DirectiveKind {
    Assume(Arc<str>),
    Predict,
    Observe(Value),
}

#[derive(Debug, Clone)]
struct Directive {
    root: NodeId,
    kind: DirectiveKind,
}

/// Counts of one [`Engine::infer`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferReport {
    /// Transitions that selected at least one principal node.
    pub transitions: usize,
    pub accepted: usize,
    /// Transitions that found nothing to resample.
    pub skipped: usize,
}

impl InferReport {
    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Skipped => self.skipped += 1,
            Transition::Accepted { .. } => {
                self.transitions += 1;
                self.accepted += 1;
            }
            Transition::Rejected { .. } => self.transitions += 1,
        }
    }

    pub fn merge(&mut self, other: InferReport) {
        self.transitions += other.transitions;
        self.accepted += other.accepted;
        self.skipped += other.skipped;
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.transitions == 0 {
            0.0
        } else {
            self.accepted as f64 / self.transitions as f64
        }
    }
}

/// An inference program.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelSpec {
    /// Resimulation MH; `drift` proposes with procedure delta kernels.
    Mh {
        scope: ScopeId,
        block: BlockSelector,
        transitions: usize,
        drift: bool,
    },
    FuncMh {
        scope: ScopeId,
        block: BlockSelector,
        transitions: usize,
    },
    Slice {
        scope: ScopeId,
        block: BlockSelector,
        transitions: usize,
    },
    PGibbs {
        scope: ScopeId,
        block: BlockSelector,
        particles: usize,
        transitions: usize,
    },
    MeanField {
        scope: ScopeId,
        block: BlockSelector,
        iterations: usize,
        transitions: usize,
    },
    /// Runs each kernel in order, `transitions` times over.
    Cycle {
        kernels: Vec<KernelSpec>,
        transitions: usize,
    },
}

impl KernelSpec {
    /// Reads a kernel from its s-expression form, e.g.
    /// `(pgibbs h (ordered_range 0 4) 10 5)`.
    pub fn parse(source: &str) -> Result<Self, ExecError> {
        let sexp = torus_frontend::parse_expr(source)?;
        Self::from_sexp(&sexp)
    }

    pub fn from_sexp(sexp: &SExp) -> Result<Self, ExecError> {
        let items = sexp
            .as_list()
            .ok_or_else(|| malformed(sexp, "expected a list"))?;
        let kind = items
            .first()
            .and_then(SExp::as_symbol)
            .ok_or_else(|| malformed(sexp, "expected a kernel name"))?;
        let arity = |n: usize| {
            if items.len() == n + 1 {
                Ok(())
            } else {
                Err(malformed(sexp, &format!("{} takes {} arguments", kind, n)))
            }
        };
        match kind {
            "mh" => {
                if !(items.len() == 4 || items.len() == 5) {
                    return Err(malformed(sexp, "mh takes a scope, a block, a count and an optional `drift`"));
                }
                let drift = match items.get(4) {
                    None => false,
                    Some(flag) if flag.as_symbol() == Some("drift") => true,
                    Some(other) => return Err(malformed(other, "expected `drift`")),
                };
                Ok(KernelSpec::Mh {
                    scope: read_scope(&items[1])?,
                    block: read_block(&items[2])?,
                    transitions: read_count(&items[3])?,
                    drift,
                })
            }
            "func_mh" => {
                arity(3)?;
                Ok(KernelSpec::FuncMh {
                    scope: read_scope(&items[1])?,
                    block: read_block(&items[2])?,
                    transitions: read_count(&items[3])?,
                })
            }
            "slice" => {
                arity(3)?;
                Ok(KernelSpec::Slice {
                    scope: read_scope(&items[1])?,
                    block: read_block(&items[2])?,
                    transitions: read_count(&items[3])?,
                })
            }
            "pgibbs" => {
                arity(4)?;
                Ok(KernelSpec::PGibbs {
                    scope: read_scope(&items[1])?,
                    block: read_block(&items[2])?,
                    particles: read_count(&items[3])?,
                    transitions: read_count(&items[4])?,
                })
            }
            "meanfield" => {
                arity(4)?;
                Ok(KernelSpec::MeanField {
                    scope: read_scope(&items[1])?,
                    block: read_block(&items[2])?,
                    iterations: read_count(&items[3])?,
                    transitions: read_count(&items[4])?,
                })
            }
            "cycle" => {
                arity(2)?;
                let kernels = items[1]
                    .as_list()
                    .ok_or_else(|| malformed(&items[1], "cycle takes a list of kernels"))?
                    .iter()
                    .map(KernelSpec::from_sexp)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(KernelSpec::Cycle {
                    kernels,
                    transitions: read_count(&items[2])?,
                })
            }
            other => Err(ExecError::ValidationError(format!(
                "unknown inference kernel `{}`",
                other
            ))),
        }
    }

    /// Scope, block selector and transition count of a primitive kernel.
    fn selection(&self) -> Option<(&ScopeId, &BlockSelector, usize)> {
        match self {
            KernelSpec::Mh {
                scope,
                block,
                transitions,
                ..
            }
            | KernelSpec::FuncMh {
                scope,
                block,
                transitions,
            }
            | KernelSpec::Slice {
                scope,
                block,
                transitions,
            }
            | KernelSpec::PGibbs {
                scope,
                block,
                transitions,
                ..
            }
            | KernelSpec::MeanField {
                scope,
                block,
                transitions,
                ..
            } => Some((scope, block, *transitions)),
            KernelSpec::Cycle { .. } => None,
        }
    }
}

fn malformed(sexp: &SExp, what: &str) -> ExecError {
    ExecError::ValidationError(format!("malformed kernel {}: {}", sexp, what))
}

fn read_scope(sexp: &SExp) -> Result<ScopeId, ExecError> {
    match sexp {
        SExp::Symbol(s) => Ok(ScopeId::named(s)),
        SExp::Number(x) => Ok(ScopeId::named(&x.to_string())),
        SExp::Quote(inner) => read_scope(inner),
        other => Err(malformed(other, "scope must be a symbol or number")),
    }
}

fn read_block(sexp: &SExp) -> Result<BlockSelector, ExecError> {
    match sexp {
        SExp::Symbol(s) => Ok(match s.as_str() {
            "one" => BlockSelector::One,
            "all" => BlockSelector::All,
            "none" => BlockSelector::None,
            "ordered" => BlockSelector::Ordered,
            other => BlockSelector::Block(BlockId::Symbol(Arc::from(other))),
        }),
        SExp::Number(_) => read_block_id(sexp).map(BlockSelector::Block),
        SExp::Quote(inner) => read_block(inner),
        SExp::List(items) => match items.as_slice() {
            [head, min, max] if head.as_symbol() == Some("ordered_range") => {
                Ok(BlockSelector::OrderedRange(read_block_id(min)?, read_block_id(max)?))
            }
            _ => Err(malformed(sexp, "expected (ordered_range min max)")),
        },
        other => Err(malformed(other, "unrecognised block selector")),
    }
}

fn read_block_id(sexp: &SExp) -> Result<BlockId, ExecError> {
    match sexp {
        SExp::Number(x) => {
            BlockId::from_number(*x).ok_or_else(|| malformed(sexp, "block index must be an integer"))
        }
        SExp::Symbol(s) => Ok(BlockId::Symbol(Arc::from(s.as_str()))),
        other => Err(malformed(other, "block must be a symbol or number")),
    }
}

fn read_count(sexp: &SExp) -> Result<usize, ExecError> {
    match sexp.as_number() {
        Some(x) if x >= 0.0 && x.fract() == 0.0 => Ok(x as usize),
        _ => Err(malformed(sexp, "expected a non-negative integer")),
    }
}

/// Symbols of `exp` that are not bound in the global environment.
fn free_symbols(exp: &Exp, trace: &Trace, out: &mut BTreeSet<Arc<str>>) {
    match exp {
        Exp::Symbol(name) => {
            if trace.global_env().lookup(name).is_none() {
                out.insert(name.clone());
            }
        }
        Exp::Value(_) => {}
        Exp::Apply(items) => {
            for item in items {
                free_symbols(item, trace, out);
            }
        }
    }
}

/// Errors after which the trace is no longer trusted.
fn poisons(err: &ExecError) -> bool {
    !matches!(
        err,
        ExecError::CapabilityMissing(_)
            | ExecError::ValidationError(_)
            | ExecError::ParseError(_)
            | ExecError::UnboundSymbol(_)
    )
}

pub struct Engine {
    config: EngineConfig,
    rng: StdRng,
    trace: Trace,
    directives: BTreeMap<DirectiveId, Directive>,
    next_directive: u32,
    unpropagated: BTreeMap<DirectiveId, Value>,
    poisoned: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ExecError> {
        let config = config.validate()?;
        Ok(Self::from_config(config))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::from_config(EngineConfig::with_seed(seed))
    }

    fn from_config(config: EngineConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            trace: Trace::new(),
            directives: BTreeMap::new(),
            next_directive: 0,
            unpropagated: BTreeMap::new(),
            poisoned: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut Trace {
        &mut self.trace
    }

    /// False once an inference step has failed in a way that may have left
    /// the trace half-updated.
    pub fn is_consistent(&self) -> bool {
        !self.poisoned
    }

    // ---- directives -------------------------------------------------------

    fn eval(&mut self, exp: &Exp) -> Result<NodeId, ExecError> {
        let mut free = BTreeSet::new();
        free_symbols(exp, &self.trace, &mut free);
        if let Some(name) = free.into_iter().next() {
            return Err(ExecError::UnboundSymbol(name.to_string()));
        }
        let env = self.trace.global_env().clone();
        evaluate(&mut self.trace, exp, &env, &mut self.rng)
    }

    fn record(&mut self, root: NodeId, kind: DirectiveKind) -> DirectiveId {
        let id = DirectiveId(self.next_directive);
        self.next_directive += 1;
        self.directives.insert(id, Directive { root, kind });
        id
    }

    fn directive(&self, id: DirectiveId) -> Result<&Directive, ExecError> {
        self.directives
            .get(&id)
            .ok_or_else(|| ExecError::ValidationError(format!("unknown {}", id)))
    }

    /// Evaluates `source` and binds its value to `name` in the global
    /// environment.
    pub fn assume(&mut self, name: &str, source: &str) -> Result<DirectiveId, ExecError> {
        self.assume_exp(name, &Exp::parse(source)?)
    }

    pub fn assume_exp(&mut self, name: &str, exp: &Exp) -> Result<DirectiveId, ExecError> {
        let root = self.eval(exp)?;
        self.trace.global_env().bind(name, root);
        Ok(self.record(root, DirectiveKind::Assume(Arc::from(name))))
    }

    pub fn predict(&mut self, source: &str) -> Result<DirectiveId, ExecError> {
        self.predict_exp(&Exp::parse(source)?)
    }

    pub fn predict_exp(&mut self, exp: &Exp) -> Result<DirectiveId, ExecError> {
        let root = self.eval(exp)?;
        Ok(self.record(root, DirectiveKind::Predict))
    }

    /// Evaluates `source` and records that its value should be `value`. The
    /// constraint takes effect at the next [`Engine::make_consistent`].
    pub fn observe(
        &mut self,
        source: &str,
        value: impl Into<Value>,
    ) -> Result<DirectiveId, ExecError> {
        self.observe_exp(&Exp::parse(source)?, value)
    }

    pub fn observe_exp(
        &mut self,
        exp: &Exp,
        value: impl Into<Value>,
    ) -> Result<DirectiveId, ExecError> {
        let value = value.into();
        let root = self.eval(exp)?;
        let id = self.record(root, DirectiveKind::Observe(value.clone()));
        self.unpropagated.insert(id, value);
        Ok(id)
    }

    /// Binds `name` to a constant in the global environment.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> Result<NodeId, ExecError> {
        let node = self.trace.create_constant(value.into())?;
        self.trace.global_env().bind(name, node);
        Ok(node)
    }

    pub fn directive_root(&self, id: DirectiveId) -> Result<NodeId, ExecError> {
        self.directive(id).map(|d| d.root)
    }

    /// Current value of a directive.
    pub fn value(&self, id: DirectiveId) -> Result<Value, ExecError> {
        let root = self.directive_root(id)?;
        self.trace
            .value(root)
            .ok_or_else(|| invariant(format!("{} has no value", id)))
    }

    /// Propagates every deferred observation and returns the accumulated
    /// weight change.
    pub fn make_consistent(&mut self) -> Result<f64, ExecError> {
        let mut weight = 0.0;
        while let Some((id, value)) = self.unpropagated.pop_first() {
            let root = self.directive_root(id)?;
            match self.propagate_observation(root, &value) {
                Ok(w) => weight += w,
                Err(err) => {
                    if poisons(&err) {
                        self.poisoned = true;
                    }
                    return Err(err);
                }
            }
        }
        Ok(weight)
    }

    fn propagate_observation(&mut self, root: NodeId, value: &Value) -> Result<f64, ExecError> {
        let app = self.trace.outermost_non_reference_application(root)?;
        let psp = self.trace.psp_at(app)?;
        let mut scaffold = Scaffold::build(&self.trace, vec![BTreeSet::from([app])], false)?;
        let border = scaffold.border_stage(0)?.to_vec();
        let (rho, db) = detach_and_extract(&mut self.trace, &border, &scaffold)?;
        scaffold.check_torus()?;
        scaffold.set_lkernel(
            app,
            LKernel::Deterministic {
                psp,
                value: value.clone(),
            },
        );
        let xi = regen_and_attach(
            &mut self.trace,
            &border,
            &scaffold,
            false,
            &mut Db::new(),
            None,
            &mut self.rng,
        )?;
        if xi == f64::NEG_INFINITY {
            return Err(ExecError::Numerical(format!(
                "unable to propagate the observation {} at {}",
                value, app
            )));
        }
        self.trace.mark_observed(app, value.clone())?;
        constrain(&mut self.trace, app, value)?;
        self.trace.reclaim(&db);

        #[cfg(feature = "tracing")]
        tracing::debug!(node = %app, %value, xi, rho, "observation propagated");

        Ok(xi - rho)
    }

    /// Lifts an observation, propagated or not.
    pub fn unobserve(&mut self, id: DirectiveId) -> Result<(), ExecError> {
        let directive = self.directive(id)?;
        let root = directive.root;
        if !matches!(directive.kind, DirectiveKind::Observe(_)) {
            return Err(ExecError::ValidationError(format!(
                "{} is not an observation",
                id
            )));
        }
        if self.unpropagated.remove(&id).is_some() {
            return Ok(());
        }
        let app = self.trace.outermost_non_reference_application(root)?;
        if self.trace.clear_observed(app)?.is_some() {
            unconstrain(&mut self.trace, app)?;
        }
        Ok(())
    }

    /// Removes a directive and un-evaluates its family.
    pub fn forget(&mut self, id: DirectiveId) -> Result<(), ExecError> {
        let directive = self.directive(id)?.clone();
        if let DirectiveKind::Observe(_) = directive.kind {
            self.unobserve(id)?;
        }
        let db = uneval(&mut self.trace, directive.root)?;
        if let DirectiveKind::Assume(name) = &directive.kind {
            self.trace.global_env().unbind(name);
        }
        self.directives.remove(&id);
        self.trace.reclaim(&db);
        self.trace.reclaim_family(directive.root);
        Ok(())
    }

    /// Runs a sequence of top-level forms: `(assume name exp)`,
    /// `(predict exp)`, `(observe exp value)` and `(infer kernel)`.
    pub fn execute(&mut self, program: &str) -> Result<Vec<DirectiveId>, ExecError> {
        let mut ids = Vec::new();
        for form in torus_frontend::parse_program(program)? {
            let items = form
                .as_list()
                .ok_or_else(|| ExecError::ValidationError(format!("expected a directive, got {}", form)))?;
            match (items.first().and_then(SExp::as_symbol), items.len()) {
                (Some("assume"), 3) => {
                    let name = items[1].as_symbol().ok_or_else(|| {
                        ExecError::ValidationError(format!("assume needs a name, got {}", items[1]))
                    })?;
                    ids.push(self.assume_exp(name, &Exp::from_sexp(&items[2])?)?);
                }
                (Some("predict"), 2) => ids.push(self.predict_exp(&Exp::from_sexp(&items[1])?)?),
                (Some("observe"), 3) => {
                    let value = literal(&items[2])?;
                    ids.push(self.observe_exp(&Exp::from_sexp(&items[1])?, value)?);
                }
                (Some("infer"), 2) => {
                    self.infer(&KernelSpec::from_sexp(&items[1])?)?;
                }
                _ => {
                    return Err(ExecError::ValidationError(format!(
                        "unrecognised directive {}",
                        form
                    )))
                }
            }
        }
        Ok(ids)
    }

    // ---- inference --------------------------------------------------------

    pub fn infer(&mut self, spec: &KernelSpec) -> Result<InferReport, ExecError> {
        if self.poisoned {
            return Err(invariant(
                "the trace was left inconsistent by an earlier failure",
            ));
        }
        self.make_consistent()?;
        let mut report = InferReport::default();
        match self.run(spec, &mut report) {
            Ok(()) => Ok(report),
            Err(err) => {
                if poisons(&err) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "inference failed; refusing further transitions");
                    self.poisoned = true;
                }
                Err(err)
            }
        }
    }

    fn run(&mut self, spec: &KernelSpec, report: &mut InferReport) -> Result<(), ExecError> {
        let mut operator: Box<dyn Operator> = match spec {
            KernelSpec::Cycle {
                kernels,
                transitions,
            } => {
                for _ in 0..*transitions {
                    for kernel in kernels {
                        self.run(kernel, report)?;
                    }
                }
                return Ok(());
            }
            KernelSpec::Mh { .. } => Box::new(MhOperator::new()),
            KernelSpec::FuncMh { .. } => Box::new(FuncMhOperator::new()),
            KernelSpec::Slice { .. } => Box::new(SliceOperator::new(self.config.slice_params())),
            KernelSpec::PGibbs { particles, .. } => Box::new(PGibbsOperator::new(
                *particles,
                self.config.parallel_particles,
            )?),
            KernelSpec::MeanField { iterations, .. } => Box::new(MeanFieldOperator::new(
                *iterations,
                self.config.meanfield_step_size,
            )),
        };
        let Some((scope, block, transitions)) = spec.selection() else {
            return Ok(());
        };
        let drift = matches!(spec, KernelSpec::Mh { drift: true, .. });

        let indexer = ScaffoldIndexer::new(scope.clone(), block.clone())?.with_delta_kernels(drift);
        if !self.trace.scope_has_entropy(scope) {
            return Ok(());
        }
        for _ in 0..transitions {
            let transition = mix_mh(&mut self.trace, &indexer, operator.as_mut(), &mut self.rng)?;
            run_ae_kernels(&self.trace, &mut self.rng)?;
            report.record(transition);
        }
        Ok(())
    }

    // ---- diagnostics ------------------------------------------------------

    pub fn num_unconstrained_choices(&self) -> usize {
        self.trace.num_random_choices()
    }

    pub fn global_log_score(&mut self) -> Result<f64, ExecError> {
        self.trace.global_log_score()
    }

    /// Log-density of a directive's value under its own procedure.
    pub fn directive_log_score(&mut self, id: DirectiveId) -> Result<f64, ExecError> {
        let root = self.directive_root(id)?;
        let app = self.trace.outermost_non_reference_application(root)?;
        self.trace.log_density_at(app)
    }

    pub fn num_blocks(&self, scope: &str) -> usize {
        self.trace.num_blocks(&ScopeId::named(scope))
    }
}

/// Observed value written in a program: a number, a boolean or a quoted
/// symbol.
fn literal(sexp: &SExp) -> Result<Value, ExecError> {
    match sexp {
        SExp::Number(x) => Ok(Value::Number(*x)),
        SExp::Bool(b) => Ok(Value::Bool(*b)),
        SExp::Quote(inner) => match inner.as_symbol() {
            Some(s) => Ok(Value::symbol(s)),
            None => Err(ExecError::ValidationError(format!(
                "unsupported observed value {}",
                sexp
            ))),
        },
        other => Err(ExecError::ValidationError(format!(
            "unsupported observed value {}",
            other
        ))),
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("directives", &self.directives.len())
            .field("pending_observations", &self.unpropagated.len())
            .field("poisoned", &self.poisoned)
            .field("trace", &self.trace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_specs() {
        assert_eq!(
            KernelSpec::parse("(mh default one 10)").unwrap(),
            KernelSpec::Mh {
                scope: ScopeId::Default,
                block: BlockSelector::One,
                transitions: 10,
                drift: false,
            }
        );
        assert_eq!(
            KernelSpec::parse("(pgibbs h (ordered_range 0 4) 3 2)").unwrap(),
            KernelSpec::PGibbs {
                scope: ScopeId::named("h"),
                block: BlockSelector::OrderedRange(BlockId::Index(0), BlockId::Index(4)),
                particles: 3,
                transitions: 2,
            }
        );
        let cycle = KernelSpec::parse("(cycle ((mh default one 1) (slice default one 1)) 5)").unwrap();
        assert!(matches!(cycle, KernelSpec::Cycle { ref kernels, transitions: 5 } if kernels.len() == 2));
    }

    #[test]
    fn rejects_unknown_kernels() {
        assert!(matches!(
            KernelSpec::parse("(hmc default one 1)"),
            Err(ExecError::ValidationError(_))
        ));
        assert!(KernelSpec::parse("(mh default one -1)").is_err());
    }

    #[test]
    fn rejects_fractional_block_ids() {
        for source in ["(mh h 1.5 1)", "(pgibbs h (ordered_range 0 2.5) 2 1)"] {
            assert!(matches!(
                KernelSpec::parse(source),
                Err(ExecError::ValidationError(_))
            ));
        }
        assert_eq!(
            KernelSpec::parse("(mh h 2 1)").unwrap(),
            KernelSpec::Mh {
                scope: ScopeId::named("h"),
                block: BlockSelector::Block(BlockId::Index(2)),
                transitions: 1,
                drift: false,
            }
        );

        let mut engine = Engine::with_seed(4);
        let before = engine.trace().live_node_count();
        assert!(matches!(
            engine.predict("(scope_include 'h 0.5 (normal 0 1))"),
            Err(ExecError::ValidationError(_))
        ));
        assert_eq!(engine.num_blocks("h"), 0);
        assert_eq!(engine.trace().live_node_count(), before);
        assert!(engine.is_consistent());
    }

    #[test]
    fn unbound_symbols_are_reported_before_evaluation() {
        let mut engine = Engine::with_seed(1);
        let before = engine.trace().live_node_count();
        let err = engine.assume("x", "(normal mu 1)").unwrap_err();
        assert!(matches!(err, ExecError::UnboundSymbol(ref name) if name == "mu"));
        assert_eq!(engine.trace().live_node_count(), before);
    }

    #[test]
    fn observe_is_deferred_until_consistent() {
        let mut engine = Engine::with_seed(3);
        engine.assume("x", "(normal 0 1)").unwrap();
        let obs = engine.observe("(normal x 1)", 0.5).unwrap();
        assert_eq!(engine.num_unconstrained_choices(), 2);

        engine.make_consistent().unwrap();
        assert_eq!(engine.num_unconstrained_choices(), 1);
        assert_eq!(engine.value(obs).unwrap(), Value::Number(0.5));

        engine.unobserve(obs).unwrap();
        assert_eq!(engine.num_unconstrained_choices(), 2);
    }

    #[test]
    fn forget_reclaims_nodes() {
        let mut engine = Engine::with_seed(5);
        let before = engine.trace().live_node_count();
        let id = engine.predict("(normal 0 1)").unwrap();
        assert!(engine.trace().live_node_count() > before);
        engine.forget(id).unwrap();
        assert_eq!(engine.trace().live_node_count(), before);
        assert_eq!(engine.num_unconstrained_choices(), 0);
    }

    #[test]
    fn failed_directives_are_taken_back() {
        let mut engine = Engine::with_seed(6);
        engine.assume("m", "(normal 0 1)").unwrap();
        let before = engine.trace().live_node_count();
        let score = engine.global_log_score().unwrap();

        assert!(engine.predict("(+ (normal 0 1) (1 2))").is_err());
        assert!(engine.predict("(scope_include 'default 0 (normal m 1))").is_err());
        assert_eq!(engine.trace().live_node_count(), before);
        assert_eq!(engine.num_unconstrained_choices(), 1);
        assert_eq!(engine.global_log_score().unwrap(), score);
        assert!(engine.is_consistent());

        engine.predict("(normal m 1)").unwrap();
        assert_eq!(engine.num_unconstrained_choices(), 2);
    }

    #[test]
    fn failed_requests_are_released() {
        let mut engine = Engine::with_seed(7);
        engine
            .assume("f", "(mem (lambda (i) (+ (normal 0 1) (1 2))))")
            .unwrap();
        let before = engine.trace().live_node_count();

        assert!(engine.predict("(f 1)").is_err());
        assert!(engine.predict("(f 1)").is_err());
        assert_eq!(engine.trace().live_node_count(), before);
        assert_eq!(engine.num_unconstrained_choices(), 0);
        assert_eq!(engine.global_log_score().unwrap(), 0.0);
    }

    #[test]
    fn propagating_an_observation_reclaims_replaced_families() {
        let mut engine = Engine::with_seed(8);
        engine
            .execute(
                "(assume y (normal 0 1))
                 (assume g (mem (lambda (k) (normal k 1))))
                 (assume z (g y))",
            )
            .unwrap();
        engine.observe("y", 0.25).unwrap();
        let observed = engine.trace().live_node_count();

        engine.make_consistent().unwrap();
        assert_eq!(engine.trace().live_node_count(), observed);
        assert_eq!(engine.num_unconstrained_choices(), 1);
    }

    #[test]
    fn inference_on_an_empty_scope_does_nothing() {
        let mut engine = Engine::with_seed(9);
        let report = engine
            .infer(&KernelSpec::parse("(mh default one 10)").unwrap())
            .unwrap();
        assert_eq!(report, InferReport::default());
    }

    #[test]
    fn execute_runs_directives_in_order() {
        let mut engine = Engine::with_seed(2);
        let ids = engine
            .execute("(assume p (beta 1 1)) (observe (flip p) true) (infer (mh default one 5))")
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(engine.num_unconstrained_choices(), 1);
    }
}
