//! End-to-end inference scenarios with known posteriors.

use torus_core::{DirectiveId, Engine, KernelSpec, Value};

fn assert_close(actual: f64, expected: f64, tol: f64, label: &str) {
    assert!(
        (actual - expected).abs() <= tol,
        "{} mismatch: expected {:.6}, got {:.6}, diff={:.3e}",
        label,
        expected,
        actual,
        (actual - expected).abs()
    );
}

fn number(engine: &Engine, id: DirectiveId) -> f64 {
    match engine.value(id).unwrap() {
        Value::Number(x) => x,
        other => panic!("expected a number, got {}", other),
    }
}

#[test]
fn resimulation_mh_samples_an_unobserved_flip_from_its_prior() {
    let mut engine = Engine::with_seed(31);
    let b = engine.assume("b", "(flip 0.3)").unwrap();
    let spec = KernelSpec::parse("(mh default one 1)").unwrap();

    let n = 10_000;
    let mut heads = 0usize;
    let mut total = torus_core::InferReport::default();
    for _ in 0..n {
        total.merge(engine.infer(&spec).unwrap());
        if engine.value(b).unwrap() == Value::Bool(true) {
            heads += 1;
        }
    }
    assert_eq!(total.transitions, n);
    assert_eq!(total.accepted, n);
    assert_close(heads as f64 / n as f64, 0.3, 0.03, "frequency of true");
}

/// `mu ~ N(0, 1)`, `y ~ N(mu, 1)` observed at 2; the posterior mean is 1.
fn posterior_mean(kernel: &str, seed: u64) -> f64 {
    let mut engine = Engine::with_seed(seed);
    let mu = engine.assume("mu", "(normal 0 1)").unwrap();
    engine.observe("(normal mu 1)", 2.0).unwrap();
    let spec = KernelSpec::parse(kernel).unwrap();

    for _ in 0..200 {
        engine.infer(&spec).unwrap();
    }
    let samples = 3_000;
    let mut sum = 0.0;
    for _ in 0..samples {
        engine.infer(&spec).unwrap();
        sum += number(&engine, mu);
    }
    sum / samples as f64
}

#[test]
fn independence_pgibbs_finds_the_conjugate_posterior_mean() {
    assert_close(posterior_mean("(pgibbs default one 1 1)", 41), 1.0, 0.15, "pgibbs mean");
}

#[test]
fn slice_finds_the_conjugate_posterior_mean() {
    assert_close(posterior_mean("(slice default one 1)", 42), 1.0, 0.15, "slice mean");
}

#[test]
fn functional_mh_finds_the_conjugate_posterior_mean() {
    assert_close(posterior_mean("(func_mh default one 1)", 43), 1.0, 0.15, "func_mh mean");
}

#[test]
fn latent_chain_follows_confident_readings() {
    let mut engine = Engine::with_seed(51);
    let chain = engine
        .assume("chain", "(make_latent_chain 0.5 0.5 0.999)")
        .unwrap();
    // An unrelated choice so that the default scope has something to move.
    engine.assume("p", "(beta 1 1)").unwrap();
    let readings = [true, false, true, true];
    for (n, reading) in readings.iter().enumerate() {
        for _ in 0..2 {
            engine
                .observe(&format!("(chain {})", n), *reading)
                .unwrap();
        }
    }
    engine
        .infer(&KernelSpec::parse("(mh default one 1)").unwrap())
        .unwrap();

    let maker = engine.directive_root(chain).unwrap();
    let stats = engine.trace().aux_statistics(maker).unwrap();
    let states: Vec<f64> = readings.iter().map(|r| f64::from(u8::from(*r))).collect();
    assert_eq!(&stats[..readings.len()], states.as_slice());
}

#[test]
fn uncollapsed_coin_bias_is_resampled_from_its_posterior() {
    let mut engine = Engine::with_seed(52);
    let coin = engine.assume("coin", "(make_ubeta_bernoulli 1 1)").unwrap();
    for _ in 0..20 {
        engine.observe("(coin)", true).unwrap();
    }
    engine
        .infer(&KernelSpec::parse("(mh default one 1)").unwrap())
        .unwrap();

    let maker = engine.directive_root(coin).unwrap();
    let stats = engine.trace().aux_statistics(maker).unwrap();
    assert_eq!(&stats[..2], &[20.0, 0.0]);
    assert!(stats[2] > 0.7, "bias {} ignores twenty heads", stats[2]);
}

#[test]
fn collapsed_die_predicts_from_its_counts() {
    let mut engine = Engine::with_seed(53);
    let die = engine.assume("die", "(make_sym_dir_mult 1 3)").unwrap();
    for face in [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0] {
        engine.observe("(die)", face).unwrap();
    }
    let roll = engine.predict("(die)").unwrap();
    let spec = KernelSpec::parse("(mh default one 1)").unwrap();

    let n = 6_000;
    let mut zeros = 0usize;
    for _ in 0..n {
        engine.infer(&spec).unwrap();
        if engine.value(roll).unwrap() == Value::Number(0.0) {
            zeros += 1;
        }
    }
    // (6 + 1) / (7 + 3)
    assert_close(zeros as f64 / n as f64, 0.7, 0.03, "frequency of face 0");

    let maker = engine.directive_root(die).unwrap();
    let stats = engine.trace().aux_statistics(maker).unwrap();
    assert_eq!(stats.len(), 3);
    assert_eq!(stats.iter().sum::<f64>(), 8.0);
    assert!(stats[0] >= 6.0 && stats[1] >= 1.0);
}

#[test]
fn forgetting_a_roll_removes_it_from_the_counts() {
    let mut engine = Engine::with_seed(55);
    let die = engine.assume("die", "(make_sym_dir_mult 2 4)").unwrap();
    engine.observe("(die)", 3.0).unwrap();
    let second = engine.observe("(die)", 3.0).unwrap();
    engine.make_consistent().unwrap();
    assert_eq!(engine.num_unconstrained_choices(), 0);

    let maker = engine.directive_root(die).unwrap();
    assert_eq!(engine.trace().aux_statistics(maker).unwrap(), vec![0.0, 0.0, 0.0, 2.0]);
    engine.forget(second).unwrap();
    assert_eq!(engine.trace().aux_statistics(maker).unwrap(), vec![0.0, 0.0, 0.0, 1.0]);

    // p(3 | one earlier 3) under the remaining counts.
    let score = engine.global_log_score().unwrap();
    assert_close(score, (3.0_f64 / 9.0).ln(), 1e-9, "score of the remaining roll");
}

#[test]
fn uncollapsed_die_weights_are_resampled_from_their_posterior() {
    let mut engine = Engine::with_seed(54);
    let die = engine.assume("die", "(make_uc_sym_dir_mult 1 3)").unwrap();
    for _ in 0..30 {
        engine.observe("(die)", 2.0).unwrap();
    }
    engine
        .infer(&KernelSpec::parse("(mh default one 1)").unwrap())
        .unwrap();

    let maker = engine.directive_root(die).unwrap();
    let stats = engine.trace().aux_statistics(maker).unwrap();
    assert_eq!(&stats[..3], &[0.0, 0.0, 30.0]);
    assert_close(stats[3..].iter().sum::<f64>(), 1.0, 1e-9, "weight total");
    assert!(stats[5] > 0.7, "weight {} ignores thirty rolls of 2", stats[5]);
    assert!(engine.is_consistent());
}

#[test]
fn memoized_families_do_not_accumulate() {
    let mut engine = Engine::with_seed(61);
    engine
        .execute(
            "(assume f (mem (lambda (i) (normal 0 1))))
             (assume b (flip 0.5))
             (assume y (if b (f 1) (f 2)))",
        )
        .unwrap();
    let initial = engine.trace().live_node_count();
    let spec = KernelSpec::parse("(mh default one 1)").unwrap();
    let mut accepted = 0;
    for _ in 0..300 {
        accepted += engine.infer(&spec).unwrap().accepted;
        let live = engine.trace().live_node_count();
        assert!(
            live <= initial + 16,
            "live nodes grew from {} to {}",
            initial,
            live
        );
    }
    assert!(accepted > 0);
    assert_eq!(engine.num_unconstrained_choices(), 2);
}

#[test]
fn particle_gibbs_sweeps_an_ordered_scope() {
    let mut engine = Engine::with_seed(71);
    engine
        .execute(
            "(assume step (lambda (prev) (normal prev 1)))
             (assume x0 (scope_include 'h 0 (normal 0 1)))
             (assume x1 (scope_include 'h 1 (step x0)))
             (assume x2 (scope_include 'h 2 (step x1)))
             (assume x3 (scope_include 'h 3 (step x2)))
             (observe (normal x0 0.2) 1.0)
             (observe (normal x1 0.2) 2.0)
             (observe (normal x2 0.2) 3.0)
             (observe (normal x3 0.2) 4.0)",
        )
        .unwrap();
    assert_eq!(engine.num_blocks("h"), 4);

    let report = engine
        .infer(&KernelSpec::parse("(pgibbs h ordered 20 50)").unwrap())
        .unwrap();
    assert_eq!(report.transitions, 50);
    assert!(engine.is_consistent());
    assert!(engine.global_log_score().unwrap().is_finite());

    let x3 = number(&engine, DirectiveId(4));
    assert_close(x3, 4.0, 1.0, "x3");
}
