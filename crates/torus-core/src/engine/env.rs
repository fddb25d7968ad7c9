//! Lexical environments mapping symbols to trace nodes.
//!
//! Frames are shared through `Arc` so that every application node and every
//! ESR can hold the environment it was evaluated in. The global frame is
//! mutated by `assume`; inner frames are built once by `extend` and never
//! change afterwards.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::engine::node::NodeId;

struct Frame {
    bindings: RwLock<FxHashMap<Arc<str>, NodeId>>,
    outer: Option<Env>,
}

#[derive(Clone)]
pub struct Env(Arc<Frame>);

impl Env {
    /// An empty frame with no parent.
    pub fn root() -> Self {
        Env(Arc::new(Frame {
            bindings: RwLock::new(FxHashMap::default()),
            outer: None,
        }))
    }

    /// An empty frame whose lookups fall through to `self`.
    pub fn child(&self) -> Self {
        Env(Arc::new(Frame {
            bindings: RwLock::new(FxHashMap::default()),
            outer: Some(self.clone()),
        }))
    }

    /// A new frame binding `names[i]` to `nodes[i]`.
    pub fn extend(&self, names: &[Arc<str>], nodes: &[NodeId]) -> Self {
        let bindings = names
            .iter()
            .cloned()
            .zip(nodes.iter().copied())
            .collect::<FxHashMap<_, _>>();
        Env(Arc::new(Frame {
            bindings: RwLock::new(bindings),
            outer: Some(self.clone()),
        }))
    }

    pub fn bind(&self, name: &str, node: NodeId) {
        self.0.bindings.write().insert(Arc::from(name), node);
    }

    pub fn unbind(&self, name: &str) -> Option<NodeId> {
        self.0.bindings.write().remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        let mut frame = Some(self);
        while let Some(env) = frame {
            if let Some(node) = env.0.bindings.read().get(name) {
                return Some(*node);
            }
            frame = env.0.outer.as_ref();
        }
        None
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut frame = Some(self);
        while let Some(env) = frame {
            depth += 1;
            frame = env.0.outer.as_ref();
        }
        write!(
            f,
            "Env {{ bindings: {}, depth: {} }}",
            self.0.bindings.read().len(),
            depth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_outward_and_inner_frames_shadow() {
        let global = Env::root();
        global.bind("x", NodeId(1));
        global.bind("y", NodeId(2));
        let inner = global.extend(&[Arc::from("x")], &[NodeId(7)]);
        assert_eq!(inner.lookup("x"), Some(NodeId(7)));
        assert_eq!(inner.lookup("y"), Some(NodeId(2)));
        assert_eq!(global.lookup("x"), Some(NodeId(1)));
        assert_eq!(inner.lookup("z"), None);
    }

    #[test]
    fn later_global_bindings_are_visible_to_existing_closures() {
        let global = Env::root();
        let inner = global.child();
        global.bind("late", NodeId(3));
        assert_eq!(inner.lookup("late"), Some(NodeId(3)));
        assert_eq!(global.unbind("late"), Some(NodeId(3)));
        assert_eq!(inner.lookup("late"), None);
    }
}
