//! Local kernels: per-node proposals installed in a scaffold.
//!
//! Without a local kernel a resampling node simulates from its prior and
//! contributes no weight. A local kernel replaces the prior simulation and
//! reports the corresponding importance weight.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use crate::engine::errors::{invariant, ExecError};
use crate::engine::procedure::{Args, DeltaKernel, NumericDensity, ParamScope, Psp};
use crate::engine::value::Value;

/// Floor for positive-real variational parameters.
const MIN_POSITIVE_PARAMETER: f64 = 0.1;

#[derive(Clone)]
pub enum LKernel {
    /// Pins the node to a fixed value; weight is its log-density.
    Deterministic { psp: Arc<dyn Psp>, value: Value },
    /// Collapse-absorbing maker: resimulates the made procedure and weighs
    /// it by the marginal likelihood of the statistics it keeps.
    Aaa { maker_psp: Arc<dyn Psp> },
    /// Procedure-supplied perturbation of the old value.
    Delta(Arc<dyn DeltaKernel>),
    /// Learned mean-field proposal.
    Variational(VariationalLKernel),
}

impl LKernel {
    pub fn simulate(
        &self,
        old: Option<&Value>,
        args: &Args,
        rng: &mut dyn RngCore,
    ) -> Result<Value, ExecError> {
        match self {
            LKernel::Deterministic { value, .. } => Ok(value.clone()),
            LKernel::Aaa { maker_psp } => maker_psp.simulate(args, rng),
            LKernel::Delta(kernel) => {
                let old = old.ok_or_else(|| invariant("delta kernel without an old value"))?;
                kernel.simulate(old, args, rng)
            }
            LKernel::Variational(kernel) => kernel.simulate(rng),
        }
    }

    pub fn weight(
        &self,
        new: &Value,
        old: Option<&Value>,
        args: &Args,
    ) -> Result<f64, ExecError> {
        match self {
            LKernel::Deterministic { psp, .. } => psp.log_density(new, args),
            LKernel::Aaa { .. } => collapsed_weight(new, args),
            LKernel::Delta(kernel) => {
                let old = old.ok_or_else(|| invariant("delta kernel without an old value"))?;
                kernel.weight(new, old, args)
            }
            LKernel::Variational(kernel) => kernel.weight(new, args),
        }
    }

    pub fn reverse_weight(&self, old: &Value, args: &Args) -> Result<f64, ExecError> {
        match self {
            LKernel::Delta(kernel) => kernel.reverse_weight(old, args),
            _ => self.weight(old, None, args),
        }
    }

    pub fn as_variational_mut(&mut self) -> Option<&mut VariationalLKernel> {
        match self {
            LKernel::Variational(kernel) => Some(kernel),
            _ => None,
        }
    }
}

fn collapsed_weight(new: &Value, args: &Args) -> Result<f64, ExecError> {
    let Value::Procedure(made) = new else {
        return Err(invariant(format!(
            "collapse-absorbing kernel produced {} instead of a procedure",
            new
        )));
    };
    let aux = args
        .made_aux
        .as_ref()
        .or(made.aux.as_ref())
        .ok_or_else(|| invariant("collapsed procedure has no statistics"))?;
    let guard = aux.lock();
    made.sp.output_psp().log_density_of_counts(&**guard)
}

impl fmt::Debug for LKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LKernel::Deterministic { value, .. } => write!(f, "Deterministic({})", value),
            LKernel::Aaa { maker_psp } => write!(f, "Aaa({:?})", maker_psp),
            LKernel::Delta(kernel) => write!(f, "Delta({:?})", kernel),
            LKernel::Variational(kernel) => write!(f, "Variational({:?})", kernel.parameters),
        }
    }
}

/// Mean-field proposal whose parameters start at the node's operand values.
#[derive(Clone)]
pub struct VariationalLKernel {
    psp: Arc<dyn Psp>,
    parameters: Vec<f64>,
}

impl VariationalLKernel {
    pub fn new(psp: Arc<dyn Psp>, args: &Args) -> Result<Self, ExecError> {
        if psp.variational().is_none() {
            return Err(ExecError::CapabilityMissing(format!(
                "{:?} has no variational family",
                psp
            )));
        }
        let parameters = args
            .operands
            .iter()
            .map(|v| v.expect_number("variational parameter"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { psp, parameters })
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    fn simulate(&self, rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let family = self.family()?;
        family.simulate_numeric(&self.parameters, rng).map(Value::Number)
    }

    fn weight(&self, new: &Value, args: &Args) -> Result<f64, ExecError> {
        let family = self.family()?;
        let x = new.expect_number("variational value")?;
        let operands = args
            .operands
            .iter()
            .map(|v| v.expect_number("variational operand"))
            .collect::<Result<Vec<_>, _>>()?;
        let w = family.log_density_numeric(x, &operands)
            - family.log_density_numeric(x, &self.parameters);
        if w.is_nan() || w.is_infinite() {
            return Err(ExecError::Numerical(format!(
                "variational weight {} at value {}",
                w, x
            )));
        }
        Ok(w)
    }

    /// Gradient of the proposal log-density with respect to its parameters.
    pub fn gradient_of_log_density(&self, value: &Value) -> Result<Vec<f64>, ExecError> {
        let family = self.family()?;
        let x = value.expect_number("variational value")?;
        Ok(family.gradient_of_log_density_numeric(x, &self.parameters).1)
    }

    pub fn update_parameters(&mut self, gradient: &[f64], gain: f64, step_size: f64) {
        let scopes: Vec<ParamScope> = self
            .psp
            .variational()
            .map(|f| f.parameter_scopes().to_vec())
            .unwrap_or_default();
        for (i, (p, g)) in self.parameters.iter_mut().zip(gradient).enumerate() {
            *p += step_size * gain * g;
            if scopes.get(i) == Some(&ParamScope::PositiveReal) && *p < MIN_POSITIVE_PARAMETER {
                *p = MIN_POSITIVE_PARAMETER;
            }
        }
    }

    fn family(&self) -> Result<&dyn NumericDensity, ExecError> {
        self.psp
            .variational()
            .ok_or_else(|| ExecError::CapabilityMissing("no variational family".into()))
    }
}
