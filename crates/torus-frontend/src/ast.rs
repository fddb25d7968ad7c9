//! Abstract syntax for the reader.
//!
//! The reader does no desugaring: special forms such as `lambda`, `if`, and
//! `quote` are kept as ordinary lists and interpreted by the consumer.

use std::fmt;

/// A read s-expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SExp {
    Number(f64),
    Bool(bool),
    Symbol(String),
    List(Vec<SExp>),
    /// `'x`, equivalent to `(quote x)`.
    Quote(Box<SExp>),
}

impl SExp {
    /// Returns the symbol name if this is a symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            SExp::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the number if this is a numeric literal.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SExp::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the items if this is a list.
    pub fn as_list(&self) -> Option<&[SExp]> {
        match self {
            SExp::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Returns the quoted expression for both `'x` and `(quote x)`.
    pub fn unquote(&self) -> Option<&SExp> {
        match self {
            SExp::Quote(inner) => Some(inner),
            SExp::List(items) if items.len() == 2 && items[0].as_symbol() == Some("quote") => {
                Some(&items[1])
            }
            _ => None,
        }
    }
}

impl fmt::Display for SExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExp::Number(n) => write!(f, "{}", n),
            SExp::Bool(b) => write!(f, "{}", b),
            SExp::Symbol(s) => write!(f, "{}", s),
            SExp::Quote(inner) => write!(f, "'{}", inner),
            SExp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}
