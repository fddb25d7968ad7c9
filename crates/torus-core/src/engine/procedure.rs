//! # Procedure Interface
//!
//! The capability surface a stochastic procedure (SP) exposes to the trace.
//! An SP is a pair of primitive stochastic procedures (PSPs): the request PSP
//! runs at the Request node and may ask for families (ESRs) or latent state
//! (LSRs); the output PSP runs at the Output node.
//!
//! Optional capabilities are explicit trait methods with conservative
//! defaults rather than downcasts:
//!
//! - absorption ([`Psp::can_absorb`]) and collapse ([`Psp::children_can_aaa`])
//! - delta kernels, support bounds, variational families with their gradients
//! - collapsed marginal likelihood ([`Psp::log_density_of_counts`])
//! - auxiliary inference and latent lifecycle on [`Procedure`]

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use smallvec::SmallVec;

use crate::engine::env::Env;
use crate::engine::errors::ExecError;
use crate::engine::node::{NodeId, Operands, ParentRole};
use crate::engine::value::{RequestValue, Value};

/// Procedure-private mutable state (sufficient statistics, latents).
///
/// Auxiliary state is mutated in place by incorporate/unincorporate, so
/// particles never share it: branching deep-copies through [`SpAux::clone_aux`].
pub trait SpAux: Any + Send + fmt::Debug {
    fn clone_aux(&self) -> Box<dyn SpAux>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Flattened sufficient statistics, used to compare states.
    fn statistics(&self) -> Vec<f64> {
        Vec::new()
    }
}

/// Shared handle to one auxiliary state.
pub type AuxHandle = Arc<Mutex<Box<dyn SpAux>>>;

/// Procedure-specific storage for latents detached into a DB.
pub type LatentDb = Box<dyn Any + Send>;

pub fn new_aux(aux: Box<dyn SpAux>) -> AuxHandle {
    Arc::new(Mutex::new(aux))
}

/// Deep copy of the state behind a handle.
pub fn clone_aux_handle(handle: &AuxHandle) -> AuxHandle {
    new_aux(handle.lock().clone_aux())
}

/// Runs `f` against the concrete auxiliary type behind `handle`.
pub fn with_aux<T: 'static, R>(
    handle: &AuxHandle,
    f: impl FnOnce(&mut T) -> R,
) -> Result<R, ExecError> {
    let mut guard = handle.lock();
    let aux = guard
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or_else(|| ExecError::Internal("auxiliary state has unexpected type".into()))?;
    Ok(f(aux))
}

/// Arguments of one application, gathered from the trace.
#[derive(Clone)]
pub struct Args {
    pub node: NodeId,
    pub operand_nodes: Operands,
    pub operands: Vec<Value>,
    pub env: Env,
    /// Value of the paired request node (output nodes only).
    pub request: Option<Value>,
    pub esr_nodes: SmallVec<[NodeId; 2]>,
    pub esr_values: Vec<Value>,
    /// Auxiliary state of the procedure being applied.
    pub aux: Option<AuxHandle>,
    /// Auxiliary state of the procedure this node itself made, if any.
    pub made_aux: Option<AuxHandle>,
}

impl Args {
    pub fn check_arity(&self, name: &str, min: usize, max: usize) -> Result<(), ExecError> {
        let n = self.operands.len();
        if n < min || n > max {
            return Err(ExecError::Evaluation(format!(
                "{} expects {} to {} arguments, got {}",
                name, min, max, n
            )));
        }
        Ok(())
    }

    pub fn number(&self, i: usize, what: &str) -> Result<f64, ExecError> {
        self.operands
            .get(i)
            .ok_or_else(|| ExecError::Evaluation(format!("{} is missing argument {}", what, i)))?
            .expect_number(what)
    }

    pub fn aux(&self) -> Result<&AuxHandle, ExecError> {
        self.aux
            .as_ref()
            .ok_or_else(|| ExecError::Internal(format!("no auxiliary state at {}", self.node)))
    }

    pub fn request(&self) -> Option<&RequestValue> {
        self.request.as_ref().and_then(|r| r.as_request())
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("node", &self.node)
            .field("operands", &self.operands)
            .field("esr_values", &self.esr_values)
            .finish()
    }
}

/// Tags the few PSPs the engine must recognise structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PspKind {
    Plain,
    /// Request PSP that never requests anything.
    NullRequest,
    /// Output PSP that returns the value of its single ESR parent.
    EsrReference,
    /// Output PSP of `scope_include`: registers its third operand in a block.
    ScopeInclude,
}

/// Parameter domains for variational families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    Real,
    PositiveReal,
}

/// Numeric density used by the mean-field kernel.
pub trait NumericDensity: Send + Sync {
    fn simulate_numeric(&self, params: &[f64], rng: &mut dyn RngCore) -> Result<f64, ExecError>;
    fn log_density_numeric(&self, x: f64, params: &[f64]) -> f64;
    /// Gradient with respect to (value, params).
    fn gradient_of_log_density_numeric(&self, x: f64, params: &[f64]) -> (f64, Vec<f64>);
    fn parameter_scopes(&self) -> &[ParamScope];
}

/// A proposal that perturbs the old value instead of resimulating it.
pub trait DeltaKernel: Send + Sync + fmt::Debug {
    fn simulate(&self, old: &Value, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError>;
    fn weight(&self, new: &Value, old: &Value, args: &Args) -> Result<f64, ExecError>;
    fn reverse_weight(&self, old: &Value, args: &Args) -> Result<f64, ExecError>;
}

/// Primitive stochastic procedure.
pub trait Psp: Send + Sync + fmt::Debug {
    fn simulate(&self, args: &Args, rng: &mut dyn RngCore) -> Result<Value, ExecError>;

    fn log_density(&self, _value: &Value, _args: &Args) -> Result<f64, ExecError> {
        Ok(0.0)
    }

    fn incorporate(&self, _value: &Value, _args: &Args) -> Result<(), ExecError> {
        Ok(())
    }

    fn unincorporate(&self, _value: &Value, _args: &Args) -> Result<(), ExecError> {
        Ok(())
    }

    /// Only applications of random PSPs are registered as random choices.
    fn is_random(&self) -> bool {
        false
    }

    fn kind(&self) -> PspKind {
        PspKind::Plain
    }

    /// Whether a change at the parent in `role` can be absorbed by
    /// recomputing this application's log-density.
    fn can_absorb(&self, _role: ParentRole) -> bool {
        self.is_random()
    }

    /// Whether applications of procedures made by this PSP can be absorbed
    /// into the made procedure's sufficient statistics.
    fn children_can_aaa(&self) -> bool {
        false
    }

    fn delta_kernel(&self) -> Option<Arc<dyn DeltaKernel>> {
        None
    }

    /// Support bounds for continuous-valued PSPs.
    fn support(&self, _args: &Args) -> Option<(f64, f64)> {
        None
    }

    fn variational(&self) -> Option<&dyn NumericDensity> {
        None
    }

    /// Marginal likelihood of the statistics in `aux`, for collapsed makers.
    fn log_density_of_counts(&self, _aux: &dyn SpAux) -> Result<f64, ExecError> {
        Err(ExecError::CapabilityMissing(format!(
            "{:?} has no collapsed density",
            self
        )))
    }
}

/// Stochastic procedure: a request/output PSP pair plus optional hooks.
pub trait Procedure: Send + Sync {
    fn name(&self) -> &str;
    fn request_psp(&self) -> Arc<dyn Psp>;
    fn output_psp(&self) -> Arc<dyn Psp>;

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        None
    }

    fn has_ae_kernel(&self) -> bool {
        false
    }

    /// Auxiliary inference, run once per transition for every registered
    /// maker.
    fn ae_infer(&self, _aux: &AuxHandle, _rng: &mut dyn RngCore) -> Result<(), ExecError> {
        Ok(())
    }

    fn construct_latent_db(&self) -> Option<LatentDb> {
        None
    }

    fn simulate_latents(
        &self,
        _aux: &AuxHandle,
        _lsr: &Value,
        _restore: bool,
        _latent_db: Option<&mut LatentDb>,
        _rng: &mut dyn RngCore,
    ) -> Result<f64, ExecError> {
        Ok(0.0)
    }

    fn detach_latents(
        &self,
        _aux: &AuxHandle,
        _lsr: &Value,
        _latent_db: &mut LatentDb,
    ) -> Result<f64, ExecError> {
        Ok(0.0)
    }
}

/// A procedure with no hooks beyond its two PSPs.
pub struct SimpleSp {
    name: Arc<str>,
    request: Arc<dyn Psp>,
    output: Arc<dyn Psp>,
}

impl SimpleSp {
    pub fn new(name: &str, request: Arc<dyn Psp>, output: Arc<dyn Psp>) -> Self {
        Self {
            name: Arc::from(name),
            request,
            output,
        }
    }

    /// A procedure whose request phase is empty.
    pub fn output_only(name: &str, output: Arc<dyn Psp>) -> Self {
        Self::new(name, Arc::new(NullRequestPsp), output)
    }
}

impl Procedure for SimpleSp {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        self.request.clone()
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        self.output.clone()
    }
}

#[derive(Debug)]
pub struct NullRequestPsp;

impl Psp for NullRequestPsp {
    fn simulate(&self, _args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        Ok(Value::empty_request())
    }

    fn kind(&self) -> PspKind {
        PspKind::NullRequest
    }

    fn can_absorb(&self, _role: ParentRole) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct EsrRefOutputPsp;

impl Psp for EsrRefOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        match args.esr_values.as_slice() {
            [value] => Ok(value.clone()),
            other => Err(ExecError::Internal(format!(
                "esr reference expects one family, got {}",
                other.len()
            ))),
        }
    }

    fn kind(&self) -> PspKind {
        PspKind::EsrReference
    }

    fn can_absorb(&self, role: ParentRole) -> bool {
        !matches!(role, ParentRole::Request | ParentRole::Esr(0))
    }
}
