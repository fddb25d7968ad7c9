//! The incremental execution engine for torus programs.
//!
//! This module provides:
//! - **trace**: Arena of nodes with families, registries, scopes and blocks
//! - **particle**: Copy-on-write overlay over a read-only trace
//! - **scaffold**: Partition of the nodes affected by a proposal
//! - **regen** / **detach**: The symmetric attach and extract passes
//! - **builtins**: The primitive procedure library
//! - **infer**: MH, functional MH, slice, particle Gibbs and mean-field kernels
//! - **driver**: Directives, kernel specifications and the inference loop
//! - **continuous**: Background inference on a shared engine

pub mod builtins;
pub mod config;
pub mod continuous;
pub mod db;
pub mod detach;
pub mod driver;
pub mod env;
pub mod errors;
pub mod exp;
pub mod infer;
pub mod lkernel;
pub mod node;
pub mod numeric;
pub mod particle;
pub mod procedure;
pub mod regen;
pub mod scaffold;
pub mod trace;
pub mod value;
