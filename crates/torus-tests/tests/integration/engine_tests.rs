use torus_core::{Engine, EngineConfig, ExecError, KernelSpec, Value};

fn assert_close(actual: f64, expected: f64, tol: f64, label: &str) {
    assert!(
        (actual - expected).abs() <= tol,
        "{} mismatch: expected {:.12}, got {:.12}, diff={:.3e}",
        label,
        expected,
        actual,
        (actual - expected).abs()
    );
}

#[test]
fn assume_binds_values_in_the_global_environment() {
    let mut engine = Engine::with_seed(1);
    let two = engine.assume("two", "(+ 1 1)").unwrap();
    let four = engine.predict("(* two two)").unwrap();
    assert_eq!(engine.value(two).unwrap(), Value::Number(2.0));
    assert_eq!(engine.value(four).unwrap(), Value::Number(4.0));
    assert_eq!(engine.num_unconstrained_choices(), 0);
}

#[test]
fn compound_procedures_are_applied() {
    let mut engine = Engine::with_seed(2);
    engine.assume("sq", "(lambda (x) (* x x))").unwrap();
    let y = engine.predict("(sq 3)").unwrap();
    assert_eq!(engine.value(y).unwrap(), Value::Number(9.0));

    let branch = engine.predict("(if (< 1 2) 10 20)").unwrap();
    assert_eq!(engine.value(branch).unwrap(), Value::Number(10.0));
}

#[test]
fn observation_score_matches_the_likelihood() {
    let mut engine = Engine::with_seed(3);
    engine.bind("mu", 1.5).unwrap();
    let obs = engine.observe("(normal mu 2)", 0.5).unwrap();
    engine.make_consistent().unwrap();

    let expected = -0.5 * (2.0 * std::f64::consts::PI * 4.0).ln() - (0.5f64 - 1.5).powi(2) / 8.0;
    assert_close(engine.directive_log_score(obs).unwrap(), expected, 1e-9, "log score");
    assert_close(engine.global_log_score().unwrap(), expected, 1e-9, "global score");
}

#[test]
fn impossible_observations_are_refused() {
    let mut engine = Engine::with_seed(4);
    engine.observe("(uniform_continuous 0 1)", 2.0).unwrap();
    assert!(matches!(
        engine.make_consistent(),
        Err(ExecError::Numerical(_))
    ));
    assert!(!engine.is_consistent());
    assert!(engine
        .infer(&KernelSpec::parse("(mh default one 1)").unwrap())
        .is_err());
}

#[test]
fn observing_the_same_choice_twice_is_rejected() {
    let mut engine = Engine::with_seed(5);
    engine.assume("x", "(normal 0 1)").unwrap();
    engine.observe("x", 0.1).unwrap();
    engine.observe("x", 0.2).unwrap();
    assert!(engine.make_consistent().is_err());
}

#[test]
fn unobserving_before_propagation_drops_the_observation() {
    let mut engine = Engine::with_seed(6);
    let obs = engine.observe("(normal 0 1)", 0.3).unwrap();
    engine.unobserve(obs).unwrap();
    engine.make_consistent().unwrap();
    assert_eq!(engine.num_unconstrained_choices(), 1);
    assert!(engine.trace().constrained_choices().next().is_none());
}

#[test]
fn forgetting_an_assume_unbinds_it() {
    let mut engine = Engine::with_seed(7);
    let x = engine.assume("x", "(normal 0 1)").unwrap();
    engine.forget(x).unwrap();
    assert!(matches!(
        engine.predict("(+ x 1)"),
        Err(ExecError::UnboundSymbol(name)) if name == "x"
    ));
    assert!(engine.value(x).is_err());
}

#[test]
fn invalid_config_is_rejected() {
    let config = EngineConfig {
        meanfield_step_size: -1.0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::new(config),
        Err(ExecError::ValidationError(_))
    ));
}

#[test]
fn run_program_executes_directives() {
    let engine = torus_core::run_program(
        "(assume p (beta 2 2))
         (observe (flip p) true)
         (observe (flip p) false)
         (infer (mh default one 20))",
        11,
    )
    .unwrap();
    assert!(engine.is_consistent());
    assert_eq!(engine.num_unconstrained_choices(), 1);
    assert_eq!(engine.trace().constrained_choices().count(), 2);
}
