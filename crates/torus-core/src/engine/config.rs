//! Engine-wide settings.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::engine::errors::ExecError;
use crate::engine::infer::slice::SliceParams;

/// Configuration for an [`Engine`](crate::engine::driver::Engine).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Seed of the engine's random number generator.
    pub seed: u64,
    /// Step-out width of slice sampling.
    pub slice_width: f64,
    /// Maximum step-out steps of slice sampling.
    pub slice_max_steps: u64,
    /// Maximum shrink draws of slice sampling.
    pub slice_max_shrinks: u64,
    /// Default number of mean-field training iterations.
    pub meanfield_iterations: usize,
    /// Gradient step size of mean-field training.
    pub meanfield_step_size: f64,
    /// Regenerate particle Gibbs particles on the rayon pool.
    pub parallel_particles: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            slice_width: 0.5,
            slice_max_steps: 1_000_000,
            slice_max_shrinks: 1_000,
            meanfield_iterations: 50,
            meanfield_step_size: 0.05,
            parallel_particles: cfg!(feature = "parallel"),
        }
    }
}

impl EngineConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    pub(crate) fn validate(self) -> Result<Self, ExecError> {
        if !(self.slice_width.is_finite() && self.slice_width > 0.0) {
            return Err(ExecError::ValidationError(
                "engine config: slice_width must be finite and > 0".into(),
            ));
        }
        if self.slice_max_steps == 0 {
            return Err(ExecError::ValidationError(
                "engine config: slice_max_steps must be > 0".into(),
            ));
        }
        if !(self.meanfield_step_size.is_finite() && self.meanfield_step_size > 0.0) {
            return Err(ExecError::ValidationError(
                "engine config: meanfield_step_size must be finite and > 0".into(),
            ));
        }
        Ok(self)
    }

    pub(crate) fn slice_params(&self) -> SliceParams {
        SliceParams {
            width: self.slice_width,
            max_steps: self.slice_max_steps,
            max_shrinks: self.slice_max_shrinks,
        }
    }
}
