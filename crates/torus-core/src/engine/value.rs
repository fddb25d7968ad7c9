//! Runtime values stored at trace nodes.
//!
//! Values are cheap to clone: every compound payload sits behind an `Arc`.

use std::fmt;
use std::sync::Arc;

use crate::engine::env::Env;
use crate::engine::errors::ExecError;
use crate::engine::exp::Exp;
use crate::engine::node::{FamilyId, NodeId};
use crate::engine::procedure::{AuxHandle, Procedure};

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Symbol(Arc<str>),
    Array(Arc<[Value]>),
    /// A quoted expression (procedure bodies, branch arms).
    Exp(Arc<Exp>),
    /// Result of a request phase.
    Request(Arc<RequestValue>),
    /// Reference to the node whose made-procedure record holds the procedure.
    SpRef(NodeId),
    /// A freshly made procedure that has not been registered at its maker
    /// node yet, or one that has been torn down into a DB.
    Procedure(MadeSp),
}

/// A procedure paired with the auxiliary state it should start from.
#[derive(Clone)]
pub struct MadeSp {
    pub sp: Arc<dyn Procedure>,
    pub aux: Option<AuxHandle>,
}

impl MadeSp {
    pub fn new(sp: Arc<dyn Procedure>) -> Self {
        Self { sp, aux: None }
    }

    pub fn with_aux(sp: Arc<dyn Procedure>, aux: AuxHandle) -> Self {
        Self { sp, aux: Some(aux) }
    }
}

impl fmt::Debug for MadeSp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MadeSp({})", self.sp.name())
    }
}

/// An exposed simulation request: evaluate `exp` in `env` as the family `id`
/// of the requesting procedure.
#[derive(Debug, Clone)]
pub struct Esr {
    pub id: FamilyId,
    pub exp: Arc<Exp>,
    pub env: Env,
}

/// The value of a request node.
#[derive(Debug, Clone, Default)]
pub struct RequestValue {
    pub esrs: Vec<Esr>,
    /// Latent simulation requests, interpreted by the requesting procedure.
    pub lsrs: Vec<Value>,
}

impl RequestValue {
    pub fn is_empty(&self) -> bool {
        self.esrs.is_empty() && self.lsrs.is_empty()
    }
}

impl Value {
    pub fn number(x: f64) -> Self {
        Value::Number(x)
    }

    pub fn symbol(s: &str) -> Self {
        Value::Symbol(Arc::from(s))
    }

    pub fn empty_request() -> Self {
        Value::Request(Arc::new(RequestValue::default()))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_sp_ref(&self) -> Option<NodeId> {
        match self {
            Value::SpRef(maker) => Some(*maker),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&RequestValue> {
        match self {
            Value::Request(r) => Some(r),
            _ => None,
        }
    }

    /// Conditional truth: everything except `false` and `nil` is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Nil)
    }

    /// Numeric argument extraction used by procedures.
    pub fn expect_number(&self, what: &str) -> Result<f64, ExecError> {
        self.as_number()
            .ok_or_else(|| ExecError::Evaluation(format!("{} expects a number, got {}", what, self)))
    }

    pub fn expect_bool(&self, what: &str) -> Result<bool, ExecError> {
        self.as_bool()
            .ok_or_else(|| ExecError::Evaluation(format!("{} expects a boolean, got {}", what, self)))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Exp(a), Value::Exp(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Request(a), Value::Request(b)) => {
                a.lsrs == b.lsrs
                    && a.esrs.len() == b.esrs.len()
                    && a.esrs.iter().zip(b.esrs.iter()).all(|(x, y)| x.id == y.id)
            }
            (Value::SpRef(a), Value::SpRef(b)) => a == b,
            (Value::Procedure(a), Value::Procedure(b)) => Arc::ptr_eq(&a.sp, &b.sp),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(x) => write!(f, "{}", x),
            Value::Symbol(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Exp(exp) => write!(f, "'{}", exp),
            Value::Request(r) => write!(f, "<request {} esrs {} lsrs>", r.esrs.len(), r.lsrs.len()),
            Value::SpRef(maker) => write!(f, "<sp@{}>", maker),
            Value::Procedure(made) => write!(f, "<procedure {}>", made.sp.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
