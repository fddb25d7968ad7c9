//! Error types for reading source text.

use thiserror::Error;

/// 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Errors raised by the reader.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum FrontendError {
    /// Syntax error during parsing.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Literal that parsed syntactically but cannot be represented.
    #[error("invalid literal '{text}' at {at}")]
    InvalidLiteral { text: String, at: SourcePosition },

    /// Structurally well-formed input with the wrong shape for the caller.
    #[error("validation error: {0}")]
    ValidationError(String),
}
