use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use torus_core::engine::detach::detach_and_extract;
use torus_core::engine::regen::regen_and_attach;
use torus_core::engine::scaffold::Scaffold;
use torus_core::engine::trace::TraceOps;
use torus_core::{Engine, NodeId};

/// `a -> coin` where `coin` is a collapsed beta-bernoulli with one observed
/// application.
fn conjugate_pair() -> (Engine, NodeId, NodeId, NodeId) {
    let mut engine = Engine::with_seed(21);
    let a = engine.assume("a", "(gamma 1 1)").unwrap();
    let coin = engine.assume("coin", "(make_beta_bernoulli a 1)").unwrap();
    let obs = engine.observe("(coin)", true).unwrap();
    engine.make_consistent().unwrap();
    let a = engine.directive_root(a).unwrap();
    let maker = engine.directive_root(coin).unwrap();
    let obs = engine.directive_root(obs).unwrap();
    (engine, a, maker, obs)
}

#[test]
fn collapsed_maker_is_resimulated_but_keeps_its_statistics() {
    let (mut engine, a, maker, obs) = conjugate_pair();
    let trace = engine.trace_mut();
    let stats = trace.aux_statistics(maker).unwrap();
    assert_eq!(&stats[..2], &[1.0, 0.0]);
    let before_a = trace.value(a);
    let before_obs = trace.value(obs);

    let scaffold = Scaffold::build(trace, vec![BTreeSet::from([a])], false).unwrap();
    assert!(scaffold.is_aaa(maker));
    assert!(scaffold.is_resampling(maker));
    assert!(!scaffold.is_resampling(obs));
    let initial = scaffold.regen_counts();
    assert!(initial.values().all(|count| *count > 0));

    let border = scaffold.border_stage(0).unwrap().to_vec();
    let (rho, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
    assert!(scaffold.is_torus());
    assert!(scaffold.check_torus().is_ok());
    assert_eq!(trace.aux_statistics(maker).unwrap(), stats);

    let mut rng = StdRng::seed_from_u64(1);
    let xi = regen_and_attach(trace, &border, &scaffold, true, &mut db, None, &mut rng).unwrap();
    assert_eq!(scaffold.regen_counts(), initial);
    assert_eq!(trace.aux_statistics(maker).unwrap(), stats);
    assert_eq!(trace.value(a), before_a);
    assert_eq!(trace.value(obs), before_obs);
    assert!((rho - xi).abs() < 1e-9);
}

#[test]
fn partition_is_disjoint() {
    let (engine, a, maker, _) = conjugate_pair();
    let trace = engine.trace();
    let scaffold = Scaffold::build(trace, vec![BTreeSet::from([a])], false).unwrap();
    let drg = scaffold.resampling_nodes();
    assert!(drg.is_disjoint(scaffold.absorbing_nodes()));
    assert!(scaffold.aaa_nodes().is_subset(&drg));
    assert!(drg.is_disjoint(scaffold.brush_nodes()));
    assert!(drg.contains(&a));
    assert!(drg.contains(&maker));
    for node in scaffold.border_stage(0).unwrap() {
        assert!(drg.contains(node) || scaffold.is_absorbing(*node));
    }
}

#[test]
fn families_behind_a_branch_are_brush() {
    let mut engine = Engine::with_seed(22);
    let b = engine.assume("b", "(flip 0.5)").unwrap();
    let y = engine.assume("y", "(if b (normal 0 1) 5)").unwrap();
    let b = engine.directive_root(b).unwrap();
    let y = engine.directive_root(y).unwrap();
    let trace = engine.trace();

    let scaffold = Scaffold::build(trace, vec![BTreeSet::from([b])], false).unwrap();
    let brush = scaffold.brush_nodes();
    assert!(!brush.is_empty());
    assert!(!brush.contains(&b));
    assert!(!brush.contains(&y));
    assert!(scaffold.is_resampling(y));
    assert!(brush.iter().all(|n| !scaffold.is_resampling(*n) && !scaffold.is_absorbing(*n)));
}

#[test]
fn brush_is_rebuilt_on_restore() {
    let mut engine = Engine::with_seed(23);
    let b = engine.assume("b", "(flip 0.5)").unwrap();
    let y = engine.assume("y", "(if b (normal 0 1) (normal 10 1))").unwrap();
    let b = engine.directive_root(b).unwrap();
    let y = engine.directive_root(y).unwrap();
    let choices = engine.num_unconstrained_choices();
    assert_eq!(choices, 2);

    let trace = engine.trace_mut();
    let before = trace.value(y);
    let scaffold = Scaffold::build(trace, vec![BTreeSet::from([b])], false).unwrap();
    let border = scaffold.border_stage(0).unwrap().to_vec();
    let (_, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
    assert_eq!(trace.num_random_choices(), 0);

    let mut rng = StdRng::seed_from_u64(2);
    regen_and_attach(trace, &border, &scaffold, true, &mut db, None, &mut rng).unwrap();
    assert_eq!(trace.value(y), before);
    assert_eq!(engine.num_unconstrained_choices(), choices);
}

#[test]
fn principal_sets_must_be_non_empty() {
    let (engine, _, _, _) = conjugate_pair();
    assert!(Scaffold::build(engine.trace(), vec![BTreeSet::new()], false).is_err());
    assert!(Scaffold::build(engine.trace(), Vec::new(), false).is_err());
}
