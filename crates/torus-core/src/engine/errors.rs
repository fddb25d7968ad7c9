//! Error types for trace execution and inference.

use thiserror::Error;

impl From<torus_frontend::FrontendError> for ExecError {
    fn from(err: torus_frontend::FrontendError) -> Self {
        match err {
            torus_frontend::FrontendError::ParseError(msg) => ExecError::ParseError(msg),
            torus_frontend::FrontendError::ValidationError(msg) => ExecError::ValidationError(msg),
            other => ExecError::ParseError(other.to_string()),
        }
    }
}

/// Errors that can occur while building, mutating, or inferring over a trace.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
///
/// All public APIs return `Result<T, ExecError>` to avoid panics in library
/// code. The variants fall in three groups:
///
/// - user-facing: [`ParseError`](Self::ParseError),
///   [`ValidationError`](Self::ValidationError),
///   [`UnboundSymbol`](Self::UnboundSymbol), [`Evaluation`](Self::Evaluation)
/// - capability-missing: [`CapabilityMissing`](Self::CapabilityMissing), raised
///   before any mutation
/// - programming-invariant violations: [`InvalidScaffold`](Self::InvalidScaffold),
///   [`Invariant`](Self::Invariant), [`Unsupported`](Self::Unsupported),
///   [`Internal`](Self::Internal). These abort the current inference step and
///   leave the engine refusing further transitions.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ExecError {
    /// Syntax error while reading a program or kernel specification.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Well-formed input with the wrong shape (e.g. a malformed `lambda`).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A variable that is not bound in the evaluation environment.
    #[error("unbound symbol: {0}")]
    UnboundSymbol(String),

    /// A procedure rejected its arguments or produced an unusable value.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// A kernel was applied to a node whose procedure lacks the capability.
    #[error("capability missing: {0}")]
    CapabilityMissing(String),

    /// Scaffold construction was asked for something it cannot plan.
    #[error("invalid scaffold: {0}")]
    InvalidScaffold(String),

    /// The detach/regen protocol observed an inconsistent graph.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A removal-type operation was invoked on an additive overlay.
    #[error("unsupported operation on particle: {0}")]
    Unsupported(&'static str),

    /// Numerical stability error (NaN weights, impossible constraints).
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Internal execution error (programmer error, not user error).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// True for errors that leave the trace in an untrusted state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecError::InvalidScaffold(_)
                | ExecError::Invariant(_)
                | ExecError::Unsupported(_)
                | ExecError::Internal(_)
        )
    }
}

pub(crate) fn invariant(msg: impl Into<String>) -> ExecError {
    ExecError::Invariant(msg.into())
}
