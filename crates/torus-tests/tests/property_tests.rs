//! Property tests for the attach/detach symmetry of the trace.

use std::collections::BTreeSet;

use proptest::prelude::*;
use proptest::sample::Index;
use rand::rngs::StdRng;
use rand::SeedableRng;
use torus_core::engine::db::Db;
use torus_core::engine::detach::detach_and_extract;
use torus_core::engine::infer::{MhOperator, Operator};
use torus_core::engine::particle::Particle;
use torus_core::engine::regen::regen_and_attach;
use torus_core::engine::scaffold::Scaffold;
use torus_core::engine::trace::TraceOps;
use torus_core::{Engine, NodeId};

const GROUPS: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Model {
    /// `m ~ N(0, 1)`, `x_i ~ N(m, 1)`, `y_i ~ N(x_i, 0.5)` observed.
    Hierarchical,
    /// A collapsed beta-bernoulli with a random prior weight, observed and
    /// predicted flips.
    Coin,
    /// A flip choosing between two normals, observed through a third.
    Branch,
    /// Memoized families requested from both arms of a branch, one of them
    /// shared with another directive, feeding a compound procedure.
    Memo,
}

impl Model {
    fn build(self, seed: u64) -> Engine {
        let mut engine = Engine::with_seed(seed);
        match self {
            Model::Hierarchical => {
                engine.assume("m", "(normal 0 1)").unwrap();
                for i in 0..GROUPS {
                    let name = format!("x{}", i);
                    engine.assume(&name, "(normal m 1)").unwrap();
                    engine
                        .observe(&format!("(normal {} 0.5)", name), i as f64 - 1.5)
                        .unwrap();
                }
            }
            Model::Coin => {
                engine
                    .execute(
                        "(assume a (gamma 1 1))
                         (assume coin (make_beta_bernoulli a 1))
                         (observe (coin) true)
                         (observe (coin) true)
                         (observe (coin) false)
                         (predict (coin))
                         (predict (coin))",
                    )
                    .unwrap();
            }
            Model::Branch => {
                engine
                    .execute(
                        "(assume b (flip 0.5))
                         (assume y (if b (normal 0 1) (normal 10 1)))
                         (observe (normal y 1) 3)",
                    )
                    .unwrap();
            }
            Model::Memo => {
                engine
                    .execute(
                        "(assume f (mem (lambda (i) (normal 0 1))))
                         (assume g (lambda (x) (normal x 1)))
                         (assume b (flip 0.5))
                         (assume w (f 1))
                         (assume y (if b (f 1) (f 2)))
                         (assume z (g y))
                         (observe (normal z 1) 0.5)",
                    )
                    .unwrap();
            }
        }
        engine.make_consistent().unwrap();
        engine
    }

    /// Whether every random choice is scored against the state it was
    /// sampled from. Collapsed applications are scored against counts that
    /// include them.
    fn scores_jointly(self) -> bool {
        !matches!(self, Model::Coin)
    }
}

fn any_model() -> impl Strategy<Value = Model> {
    prop_oneof![
        Just(Model::Hierarchical),
        Just(Model::Coin),
        Just(Model::Branch),
        Just(Model::Memo),
    ]
}

fn choices(engine: &Engine) -> Vec<NodeId> {
    engine.trace().random_choices().collect()
}

/// Rendered values of the random choices, sorted so that traces whose
/// families live at different node ids still compare equal.
fn snapshot(engine: &Engine) -> Vec<String> {
    let mut rendered: Vec<String> = choices(engine)
        .into_iter()
        .map(|n| match engine.trace().value(n) {
            Some(value) => value.to_string(),
            None => "<none>".to_string(),
        })
        .collect();
    rendered.sort();
    rendered
}

fn principal(all: &[NodeId], mask: &[bool]) -> BTreeSet<NodeId> {
    let mut set: BTreeSet<NodeId> = all
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|(n, _)| *n)
        .collect();
    if set.is_empty() {
        set.insert(all[0]);
    }
    set
}

fn log_density_of(engine: &mut Engine, nodes: &BTreeSet<NodeId>) -> f64 {
    let trace = engine.trace_mut();
    nodes
        .iter()
        .map(|n| trace.log_density_at(*n).unwrap())
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn detach_reaches_the_torus_and_restore_returns(
        model in any_model(),
        seed in 0u64..1_000,
        mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let mut engine = model.build(seed);
        let all = choices(&engine);
        let before = snapshot(&engine);
        let live = engine.trace().live_node_count();
        let score = engine.global_log_score().unwrap();

        let trace = engine.trace_mut();
        let scaffold = Scaffold::build(trace, vec![principal(&all, &mask)], false).unwrap();
        let initial = scaffold.regen_counts();
        let border = scaffold.border_stage(0).unwrap().to_vec();
        let (rho, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
        prop_assert!(scaffold.is_torus());

        let mut rng = StdRng::seed_from_u64(seed);
        let xi = regen_and_attach(trace, &border, &scaffold, true, &mut db, None, &mut rng).unwrap();
        prop_assert_eq!(scaffold.regen_counts(), initial);
        prop_assert!((rho - xi).abs() < 1e-9);
        prop_assert_eq!(snapshot(&engine), before);
        prop_assert_eq!(engine.trace().live_node_count(), live);
        prop_assert!((engine.global_log_score().unwrap() - score).abs() < 1e-9);
    }

    #[test]
    fn scaffold_partition_is_well_formed(
        model in any_model(),
        seed in 0u64..1_000,
        mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let engine = model.build(seed);
        let all = choices(&engine);
        let pnodes = principal(&all, &mask);
        let scaffold = Scaffold::build(engine.trace(), vec![pnodes.clone()], false).unwrap();

        let drg = scaffold.resampling_nodes();
        let moved: BTreeSet<NodeId> = drg.union(scaffold.brush_nodes()).copied().collect();
        prop_assert!(pnodes.is_subset(&moved));
        prop_assert!(drg.is_disjoint(scaffold.absorbing_nodes()));
        prop_assert!(scaffold.aaa_nodes().is_subset(&drg));
        prop_assert!(drg.is_disjoint(scaffold.brush_nodes()));
        prop_assert!(scaffold.absorbing_nodes().is_disjoint(scaffold.brush_nodes()));

        // Every absorbing node, and every resampling node without a
        // resampling or absorbing child, sits on the border.
        let border: BTreeSet<NodeId> = scaffold.border_stage(0).unwrap().iter().copied().collect();
        prop_assert!(scaffold.absorbing_nodes().is_subset(&border));
        for node in &drg {
            let inner = engine
                .trace()
                .children(*node)
                .iter()
                .any(|c| drg.contains(c) || scaffold.is_absorbing(*c));
            prop_assert!(inner || border.contains(node));
        }
    }

    #[test]
    fn border_nodes_descend_from_the_principal_nodes(
        model in any_model(),
        seed in 0u64..1_000,
        mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let engine = model.build(seed);
        let all = choices(&engine);
        let pnodes = principal(&all, &mask);
        let scaffold = Scaffold::build(engine.trace(), vec![pnodes.clone()], false).unwrap();

        let mut reached = pnodes.clone();
        let mut frontier: Vec<NodeId> = pnodes.into_iter().collect();
        while let Some(node) = frontier.pop() {
            for child in engine.trace().children(node) {
                if reached.insert(child) {
                    frontier.push(child);
                }
            }
        }
        for node in scaffold.border_stage(0).unwrap() {
            prop_assert!(reached.contains(node), "border node {} is not downstream", node);
        }
    }

    #[test]
    fn rejected_mh_proposals_leave_the_trace_unchanged(
        model in any_model(),
        seed in 0u64..1_000,
        pick in any::<Index>(),
    ) {
        let mut engine = model.build(seed);
        let all = choices(&engine);
        let before = snapshot(&engine);
        let live = engine.trace().live_node_count();
        let score = engine.global_log_score().unwrap();

        let trace = engine.trace_mut();
        let scaffold =
            Scaffold::build(trace, vec![BTreeSet::from([all[pick.index(all.len())]])], false).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut operator = MhOperator::new();
        let weight = operator.propose(trace, scaffold, &mut rng).unwrap();
        prop_assert!(!weight.is_nan());
        operator.reject(trace, &mut rng).unwrap();

        prop_assert_eq!(snapshot(&engine), before);
        prop_assert_eq!(engine.trace().live_node_count(), live);
        prop_assert!((engine.global_log_score().unwrap() - score).abs() < 1e-9);
    }

    #[test]
    fn accepted_mh_proposals_move_the_score_by_their_weight(
        model in any_model(),
        seed in 0u64..1_000,
        pick in any::<Index>(),
    ) {
        prop_assume!(model.scores_jointly());
        let mut engine = model.build(seed);
        let all = choices(&engine);
        let score = engine.global_log_score().unwrap();

        let scaffold = Scaffold::build(
            engine.trace(),
            vec![BTreeSet::from([all[pick.index(all.len())]])],
            false,
        )
        .unwrap();
        let moved: BTreeSet<NodeId> = scaffold
            .resampling_nodes()
            .union(scaffold.brush_nodes())
            .copied()
            .collect();
        let resampled: BTreeSet<NodeId> =
            all.iter().copied().filter(|n| moved.contains(n)).collect();
        let kept: BTreeSet<NodeId> =
            all.iter().copied().filter(|n| !moved.contains(n)).collect();
        let prior_before = log_density_of(&mut engine, &resampled);

        // Resimulated choices are drawn from their prior, so the weight only
        // carries the absorbing change; the prior change is added back here.
        let mut rng = StdRng::seed_from_u64(seed ^ 0xacce);
        let mut operator = MhOperator::new();
        let weight = operator.propose(engine.trace_mut(), scaffold, &mut rng).unwrap();
        prop_assert!(weight.is_finite());
        operator.accept(engine.trace_mut()).unwrap();

        let fresh: BTreeSet<NodeId> = choices(&engine)
            .into_iter()
            .filter(|n| !kept.contains(n))
            .collect();
        let prior_after = log_density_of(&mut engine, &fresh);
        let delta = engine.global_log_score().unwrap() - score;
        let expected = weight + prior_after - prior_before;
        prop_assert!(
            (delta - expected).abs() < 1e-8 * (1.0 + expected.abs()),
            "score moved by {} but the accepted proposal accounts for {}",
            delta,
            expected
        );
    }

    #[test]
    fn committed_particles_match_in_place_regen(
        model in any_model(),
        seed in 0u64..1_000,
        pick in any::<Index>(),
    ) {
        let mut in_place = model.build(seed);
        let mut overlay = model.build(seed);
        let all = choices(&in_place);
        prop_assert_eq!(&all, &choices(&overlay));
        let target = all[pick.index(all.len())];

        {
            let trace = in_place.trace_mut();
            let scaffold = Scaffold::build(trace, vec![BTreeSet::from([target])], false).unwrap();
            let border = scaffold.border_stage(0).unwrap().to_vec();
            let (_, mut db) = detach_and_extract(trace, &border, &scaffold).unwrap();
            let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
            regen_and_attach(trace, &border, &scaffold, false, &mut db, None, &mut rng).unwrap();
            trace.reclaim(&db);
        }
        {
            let trace = overlay.trace_mut();
            let scaffold = Scaffold::build(trace, vec![BTreeSet::from([target])], false).unwrap();
            let border = scaffold.border_stage(0).unwrap().to_vec();
            let (_, db) = detach_and_extract(trace, &border, &scaffold).unwrap();
            let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
            let mut particle = Particle::new(trace);
            regen_and_attach(&mut particle, &border, &scaffold, false, &mut Db::new(), None, &mut rng)
                .unwrap();
            let delta = particle.into_delta();
            trace.commit(delta).unwrap();
            trace.reclaim(&db);
        }

        prop_assert_eq!(snapshot(&in_place), snapshot(&overlay));
        prop_assert_eq!(
            in_place.trace().num_random_choices(),
            overlay.trace().num_random_choices()
        );
        prop_assert_eq!(
            in_place.trace().live_node_count(),
            overlay.trace().live_node_count()
        );
        let a = in_place.global_log_score().unwrap();
        let b = overlay.global_log_score().unwrap();
        prop_assert!((a - b).abs() < 1e-9);
    }
}
