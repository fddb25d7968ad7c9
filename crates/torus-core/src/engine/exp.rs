//! Expressions evaluated into trace families.
//!
//! The surface syntax is read by `torus_frontend`; this module lowers it into
//! the three forms the evaluator understands and desugars the special forms:
//!
//! - `(lambda (x ...) body)` → `(make_csp '(x ...) 'body)`
//! - `(if p c a)` → `(branch p 'c 'a)`
//! - `(quote x)` / `'x` → a constant

use std::fmt;
use std::sync::Arc;

use torus_frontend::SExp;

use crate::engine::errors::ExecError;
use crate::engine::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    /// Variable reference, evaluated to a lookup node.
    Symbol(Arc<str>),
    /// Self-evaluating constant, evaluated to a constant node.
    Value(Value),
    /// Application: operator followed by operands.
    Apply(Vec<Exp>),
}

impl Exp {
    pub fn sym(name: &str) -> Self {
        Exp::Symbol(Arc::from(name))
    }

    pub fn num(x: f64) -> Self {
        Exp::Value(Value::Number(x))
    }

    pub fn app(items: Vec<Exp>) -> Self {
        Exp::Apply(items)
    }

    /// Reads and lowers a single expression.
    pub fn parse(source: &str) -> Result<Self, ExecError> {
        let sexp = torus_frontend::parse_expr(source)?;
        Self::from_sexp(&sexp)
    }

    pub fn from_sexp(sexp: &SExp) -> Result<Self, ExecError> {
        match sexp {
            SExp::Number(x) => Ok(Exp::Value(Value::Number(*x))),
            SExp::Bool(b) => Ok(Exp::Value(Value::Bool(*b))),
            SExp::Symbol(s) if s == "nil" => Ok(Exp::Value(Value::Nil)),
            SExp::Symbol(s) => Ok(Exp::Symbol(Arc::from(s.as_str()))),
            SExp::Quote(inner) => Ok(Exp::Value(quoted(inner))),
            SExp::List(items) => lower_list(items),
        }
    }
}

fn lower_list(items: &[SExp]) -> Result<Exp, ExecError> {
    let Some(head) = items.first() else {
        return Err(ExecError::ValidationError("empty application".into()));
    };
    match head.as_symbol() {
        Some("quote") => {
            if items.len() != 2 {
                return Err(ExecError::ValidationError(
                    "quote takes exactly one expression".into(),
                ));
            }
            Ok(Exp::Value(quoted(&items[1])))
        }
        Some("lambda") => {
            if items.len() != 3 {
                return Err(ExecError::ValidationError(
                    "lambda takes a parameter list and a body".into(),
                ));
            }
            let params = items[1].as_list().ok_or_else(|| {
                ExecError::ValidationError("lambda parameters must be a list".into())
            })?;
            let names = params
                .iter()
                .map(|p| {
                    p.as_symbol().map(Value::symbol).ok_or_else(|| {
                        ExecError::ValidationError(format!("invalid lambda parameter {}", p))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let body = Exp::from_sexp(&items[2])?;
            Ok(Exp::Apply(vec![
                Exp::sym("make_csp"),
                Exp::Value(Value::Array(names.into())),
                Exp::Value(Value::Exp(Arc::new(body))),
            ]))
        }
        Some("if") => {
            if items.len() != 4 {
                return Err(ExecError::ValidationError(
                    "if takes a predicate and two branches".into(),
                ));
            }
            Ok(Exp::Apply(vec![
                Exp::sym("branch"),
                Exp::from_sexp(&items[1])?,
                Exp::Value(Value::Exp(Arc::new(Exp::from_sexp(&items[2])?))),
                Exp::Value(Value::Exp(Arc::new(Exp::from_sexp(&items[3])?))),
            ]))
        }
        _ => items
            .iter()
            .map(Exp::from_sexp)
            .collect::<Result<Vec<_>, _>>()
            .map(Exp::Apply),
    }
}

/// Quoted data: symbols stay symbols, lists become arrays.
fn quoted(sexp: &SExp) -> Value {
    match sexp {
        SExp::Number(x) => Value::Number(*x),
        SExp::Bool(b) => Value::Bool(*b),
        SExp::Symbol(s) => Value::symbol(s),
        SExp::Quote(inner) => quoted(inner),
        SExp::List(items) => Value::Array(items.iter().map(quoted).collect()),
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Symbol(s) => write!(f, "{}", s),
            Exp::Value(v) => write!(f, "{}", v),
            Exp::Apply(items) => {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lambda_desugars_to_make_csp() {
        let exp = Exp::parse("(lambda (x) (normal x 1))").unwrap();
        let Exp::Apply(items) = exp else {
            panic!("expected application");
        };
        assert_eq!(items[0], Exp::sym("make_csp"));
        assert!(matches!(&items[1], Exp::Value(Value::Array(params)) if params.len() == 1));
        assert!(matches!(&items[2], Exp::Value(Value::Exp(_))));
    }

    #[test]
    fn if_desugars_to_branch_with_quoted_arms() {
        let exp = Exp::parse("(if (flip) 1 (normal 0 1))").unwrap();
        let Exp::Apply(items) = exp else {
            panic!("expected application");
        };
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Exp::sym("branch"));
        assert!(matches!(items[1], Exp::Apply(_)));
        assert!(matches!(&items[3], Exp::Value(Value::Exp(_))));
    }

    #[test]
    fn quoted_symbols_are_constants() {
        assert_eq!(Exp::parse("'a").unwrap(), Exp::Value(Value::symbol("a")));
        assert_eq!(
            Exp::parse("(quote a)").unwrap(),
            Exp::Value(Value::symbol("a"))
        );
    }

    #[test]
    fn malformed_special_forms_are_validation_errors() {
        assert!(matches!(
            Exp::parse("(lambda x)"),
            Err(ExecError::ValidationError(_))
        ));
        assert!(matches!(Exp::parse("()"), Err(ExecError::ValidationError(_))));
    }
}
