//! # Trace Nodes
//!
//! Structural description of trace vertices. A node's *structure* (its kind
//! and parent references) never changes after creation; everything mutable
//! about it (value, children, ESR parents, request counts, made procedures)
//! lives in the owning [`Trace`](crate::engine::trace::Trace) or in a
//! [`Particle`](crate::engine::particle::Particle) overlay.
//!
//! Node kinds:
//!
//! - **Constant**: fixed value, no parents
//! - **Lookup**: aliases the value of a source node (a variable reference)
//! - **Request**: runs a procedure's request phase, producing ESRs and LSRs
//! - **Output**: runs the procedure's output phase; paired with one Request

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::engine::env::Env;

/// Operand lists are short for nearly all applications.
pub type Operands = SmallVec<[NodeId; 4]>;

/// A stable index into the node arena.
///
/// NodeId implements Ord/PartialOrd for stable, deterministic iteration.
/// Uses u32 internally for efficient storage and indexing.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identifier of a family instantiated by a made procedure.
///
/// Compound procedures key families by the requesting node; memoizers key
/// them by the printed argument tuple so that equal arguments share a family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum FamilyId {
    Node(NodeId),
    Key(Arc<str>),
}

/// Inference scope identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum ScopeId {
    /// Every random choice is registered here in a singleton block.
    Default,
    Named(Arc<str>),
}

impl ScopeId {
    pub fn named(name: &str) -> Self {
        if name == "default" {
            ScopeId::Default
        } else {
            ScopeId::Named(Arc::from(name))
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Default => write!(f, "default"),
            ScopeId::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Block identifier within a scope.
///
/// The ordering (`Node` < `Index` < `Symbol`, then by payload) is what the
/// `ordered` and `ordered_range` selectors iterate in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum BlockId {
    /// Default-scope block: the random choice itself.
    Node(NodeId),
    Index(i64),
    Symbol(Arc<str>),
}

impl BlockId {
    /// Index block for an integral number; `None` for fractional, infinite
    /// or out-of-range numbers.
    pub fn from_number(x: f64) -> Option<Self> {
        let in_range = x >= i64::MIN as f64 && x < i64::MAX as f64;
        (x.fract() == 0.0 && in_range).then(|| BlockId::Index(x as i64))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Node(id) => write!(f, "{}", id),
            BlockId::Index(i) => write!(f, "{}", i),
            BlockId::Symbol(s) => write!(f, "{}", s),
        }
    }
}

/// The shape of a node, fixed at creation.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Constant,
    Lookup {
        source: NodeId,
    },
    Request {
        operator: NodeId,
        operands: Operands,
        env: Env,
        output: NodeId,
    },
    Output {
        operator: NodeId,
        operands: Operands,
        env: Env,
        request: NodeId,
    },
}

/// How a parent relates to the application node it feeds.
///
/// Procedures answer absorption queries per role rather than inspecting the
/// graph themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRole {
    Operator,
    Operand(usize),
    /// The paired request node of an output node.
    Request,
    /// The i-th ESR parent of an output node.
    Esr(usize),
    /// The source of a lookup.
    Source,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
}

impl Node {
    pub fn constant() -> Self {
        Self {
            kind: NodeKind::Constant,
        }
    }

    pub fn lookup(source: NodeId) -> Self {
        Self {
            kind: NodeKind::Lookup { source },
        }
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self.kind, NodeKind::Lookup { .. })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, NodeKind::Request { .. })
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, NodeKind::Output { .. })
    }

    /// Operator node of an application, `None` for constants and lookups.
    pub fn operator(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Request { operator, .. } | NodeKind::Output { operator, .. } => {
                Some(*operator)
            }
            _ => None,
        }
    }

    pub fn operands(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Request { operands, .. } | NodeKind::Output { operands, .. } => operands,
            _ => &[],
        }
    }

    pub fn env(&self) -> Option<&Env> {
        match &self.kind {
            NodeKind::Request { env, .. } | NodeKind::Output { env, .. } => Some(env),
            _ => None,
        }
    }

    /// Paired request node of an output node.
    pub fn request_node(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Output { request, .. } => Some(*request),
            _ => None,
        }
    }

    /// Paired output node of a request node.
    pub fn output_node(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Request { output, .. } => Some(*output),
            _ => None,
        }
    }

    pub fn lookup_source(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Lookup { source } => Some(*source),
            _ => None,
        }
    }

    /// Parents that exist independently of requests, in evaluation order:
    /// lookup source, or operator then operands then (for output nodes) the
    /// paired request node.
    pub fn definite_parents(&self) -> Operands {
        let mut out = Operands::new();
        match &self.kind {
            NodeKind::Constant => {}
            NodeKind::Lookup { source } => out.push(*source),
            NodeKind::Request {
                operator, operands, ..
            } => {
                out.push(*operator);
                out.extend(operands.iter().copied());
            }
            NodeKind::Output {
                operator,
                operands,
                request,
                ..
            } => {
                out.push(*operator);
                out.extend(operands.iter().copied());
                out.push(*request);
            }
        }
        out
    }

    /// Role of `parent` among this node's definite parents, if it is one.
    pub fn definite_role_of(&self, parent: NodeId) -> Option<ParentRole> {
        match &self.kind {
            NodeKind::Constant => None,
            NodeKind::Lookup { source } => (*source == parent).then_some(ParentRole::Source),
            NodeKind::Request {
                operator, operands, ..
            } => {
                if *operator == parent {
                    Some(ParentRole::Operator)
                } else {
                    operands
                        .iter()
                        .position(|o| *o == parent)
                        .map(ParentRole::Operand)
                }
            }
            NodeKind::Output {
                operator,
                operands,
                request,
                ..
            } => {
                if *operator == parent {
                    Some(ParentRole::Operator)
                } else if *request == parent {
                    Some(ParentRole::Request)
                } else {
                    operands
                        .iter()
                        .position(|o| *o == parent)
                        .map(ParentRole::Operand)
                }
            }
        }
    }
}
