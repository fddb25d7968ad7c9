//! Detach record.
//!
//! A [`Db`] holds exactly what one detach removed from the trace, so that a
//! restoring regen can put it back: old values, per-maker latent state,
//! detached family roots and the auxiliary state of torn-down procedures.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::engine::errors::{invariant, ExecError};
use crate::engine::node::{FamilyId, NodeId};
use crate::engine::procedure::{AuxHandle, LatentDb};
use crate::engine::value::Value;

#[derive(Default)]
pub struct Db {
    values: FxHashMap<NodeId, Value>,
    latent_dbs: FxHashMap<NodeId, LatentDb>,
    families: FxHashMap<(NodeId, FamilyId), NodeId>,
    made_auxes: FxHashMap<NodeId, AuxHandle>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_value(&self, node: NodeId) -> bool {
        self.values.contains_key(&node)
    }

    pub fn value(&self, node: NodeId) -> Option<&Value> {
        self.values.get(&node)
    }

    pub fn value_for_restore(&self, node: NodeId) -> Result<Value, ExecError> {
        self.values
            .get(&node)
            .cloned()
            .ok_or_else(|| invariant(format!("no detached value recorded for {}", node)))
    }

    pub fn extract_value(&mut self, node: NodeId, value: Value) -> Result<(), ExecError> {
        if self.values.insert(node, value).is_some() {
            return Err(invariant(format!("{} detached twice into one DB", node)));
        }
        Ok(())
    }

    /// Overwrites a recorded value. Used to pin a value before regen.
    pub fn pin_value(&mut self, node: NodeId, value: Value) {
        self.values.insert(node, value);
    }

    pub fn has_latent_db(&self, maker: NodeId) -> bool {
        self.latent_dbs.contains_key(&maker)
    }

    pub fn register_latent_db(&mut self, maker: NodeId, latent_db: LatentDb) {
        self.latent_dbs.insert(maker, latent_db);
    }

    pub fn latent_db_mut(&mut self, maker: NodeId) -> Option<&mut LatentDb> {
        self.latent_dbs.get_mut(&maker)
    }

    pub fn register_family(&mut self, maker: NodeId, id: FamilyId, root: NodeId) {
        self.families.insert((maker, id), root);
    }

    pub fn family(&self, maker: NodeId, id: &FamilyId) -> Result<NodeId, ExecError> {
        self.families
            .get(&(maker, id.clone()))
            .copied()
            .ok_or_else(|| invariant(format!("no detached family {:?} for maker {}", id, maker)))
    }

    /// Roots of every family detached into this DB.
    pub fn family_roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.families.values().copied()
    }

    pub fn made_aux(&self, maker: NodeId) -> Option<&AuxHandle> {
        self.made_auxes.get(&maker)
    }

    pub fn set_made_aux(&mut self, maker: NodeId, aux: AuxHandle) {
        self.made_auxes.insert(maker, aux);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.families.is_empty()
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("values", &self.values.len())
            .field("latent_dbs", &self.latent_dbs.len())
            .field("families", &self.families.len())
            .field("made_auxes", &self.made_auxes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracting_a_value_twice_is_an_invariant_violation() {
        let mut db = Db::new();
        db.extract_value(NodeId(3), Value::Number(1.0)).unwrap();
        assert!(matches!(
            db.extract_value(NodeId(3), Value::Number(2.0)),
            Err(ExecError::Invariant(_))
        ));
        assert_eq!(db.value(NodeId(3)), Some(&Value::Number(1.0)));
    }

    #[test]
    fn families_are_keyed_by_maker_and_id() {
        let mut db = Db::new();
        db.register_family(NodeId(1), FamilyId::Node(NodeId(7)), NodeId(9));
        assert_eq!(db.family(NodeId(1), &FamilyId::Node(NodeId(7))).unwrap(), NodeId(9));
        assert!(db.family(NodeId(2), &FamilyId::Node(NodeId(7))).is_err());
    }
}
