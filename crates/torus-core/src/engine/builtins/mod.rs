//! The procedure library bound in every trace's global environment.

pub mod chain;
pub mod continuous;
pub mod control;
pub mod deterministic;
pub mod discrete;

use std::sync::Arc;

use crate::engine::procedure::Procedure;

/// All builtin procedures with the names they are bound to.
pub fn procedures() -> Vec<(&'static str, Arc<dyn Procedure>)> {
    let mut all = deterministic::procedures();
    all.extend(control::procedures());
    all.extend(continuous::procedures());
    all.extend(discrete::procedures());
    all.extend(chain::procedures());
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn builtin_names_are_unique() {
        let names: Vec<_> = procedures().into_iter().map(|(name, _)| name).collect();
        let unique: BTreeSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
        for name in [
            "branch",
            "make_csp",
            "mem",
            "flip",
            "normal",
            "make_sym_dir_mult",
            "make_uc_sym_dir_mult",
            "make_latent_chain",
        ] {
            assert!(names.contains(&name), "missing builtin {}", name);
        }
    }
}
