//! # Torus Core
//!
//! Inference core for probabilistic programs: a live execution trace that
//! is updated incrementally by Metropolis-Hastings style kernels.

pub mod engine;

// Re-export commonly used types
pub use engine::config::EngineConfig;
pub use engine::continuous::ContinuousInference;
pub use engine::driver::{DirectiveId, Engine, InferReport, KernelSpec};
pub use engine::errors::ExecError;
pub use engine::node::{BlockId, NodeId, ScopeId};
pub use engine::trace::Trace;
pub use engine::value::Value;

/// Runs `program` on a fresh engine seeded with `seed`.
///
/// Convenience wrapper over [`Engine::execute`].
pub fn run_program(program: &str, seed: u64) -> Result<Engine, ExecError> {
    let mut engine = Engine::with_seed(seed);
    engine.execute(program)?;
    Ok(engine)
}
