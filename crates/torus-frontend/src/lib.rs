//! # Torus Frontend
//!
//! Reader for the s-expression surface syntax used by torus programs and
//! inference kernel specifications.

pub mod ast;
pub mod errors;
pub mod parser;

// Re-export commonly used types
pub use ast::SExp;
pub use errors::FrontendError;
pub use parser::{parse_expr, parse_program};
