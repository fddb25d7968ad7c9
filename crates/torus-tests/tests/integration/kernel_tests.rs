use torus_core::{Engine, ExecError, KernelSpec};

fn normal_model(seed: u64) -> Engine {
    let mut engine = Engine::with_seed(seed);
    engine.assume("mu", "(normal 0 1)").unwrap();
    engine.observe("(normal mu 1)", 1.2).unwrap();
    engine.observe("(normal mu 1)", 0.7).unwrap();
    engine.make_consistent().unwrap();
    engine
}

fn run_kernel(source: &str, seed: u64) -> (Engine, torus_core::InferReport) {
    let mut engine = normal_model(seed);
    let report = engine
        .infer(&KernelSpec::parse(source).unwrap())
        .unwrap_or_else(|e| panic!("{} failed: {}", source, e));
    (engine, report)
}

fn assert_healthy(engine: &mut Engine, label: &str) {
    assert!(engine.is_consistent(), "{}: engine poisoned", label);
    assert_eq!(engine.num_unconstrained_choices(), 1, "{}: choice count", label);
    assert_eq!(
        engine.trace().constrained_choices().count(),
        2,
        "{}: observations",
        label
    );
    let score = engine.global_log_score().unwrap();
    assert!(score.is_finite(), "{}: score {}", label, score);
}

#[test]
fn every_kernel_runs_on_a_continuous_model() {
    let kernels = [
        "(mh default one 20)",
        "(mh default one 20 drift)",
        "(func_mh default one 20)",
        "(slice default one 20)",
        "(pgibbs default one 4 20)",
        "(meanfield default one 10 20)",
    ];
    for (i, source) in kernels.iter().enumerate() {
        let (mut engine, report) = run_kernel(source, 100 + i as u64);
        assert_eq!(report.transitions, 20, "{}: transitions", source);
        assert_eq!(report.skipped, 0, "{}: skipped", source);
        assert_healthy(&mut engine, source);
    }
}

#[test]
fn slice_transitions_are_always_accepted() {
    let (_, report) = run_kernel("(slice default one 15)", 7);
    assert_eq!(report.accepted, 15);
}

#[test]
fn cycle_runs_its_kernels_in_turn() {
    let (mut engine, report) =
        run_kernel("(cycle ((mh default one 2) (slice default one 1)) 3)", 9);
    assert_eq!(report.transitions, 9);
    assert_healthy(&mut engine, "cycle");
}

#[test]
fn slice_refuses_discrete_choices_without_poisoning() {
    let mut engine = Engine::with_seed(10);
    let b = engine.assume("b", "(flip 0.5)").unwrap();
    let before = engine.value(b).unwrap();
    let result = engine.infer(&KernelSpec::parse("(slice default one 1)").unwrap());
    assert!(matches!(result, Err(ExecError::CapabilityMissing(_))));
    assert!(engine.is_consistent());
    assert_eq!(engine.value(b).unwrap(), before);

    // The engine keeps working with a kernel that can handle the choice.
    let report = engine
        .infer(&KernelSpec::parse("(mh default one 3)").unwrap())
        .unwrap();
    assert_eq!(report.transitions, 3);
}

#[test]
fn default_scope_rejects_custom_blocks() {
    let mut engine = normal_model(11);
    assert!(matches!(
        engine.infer(&KernelSpec::parse("(mh default 3 1)").unwrap()),
        Err(ExecError::ValidationError(_))
    ));
    assert!(engine.is_consistent());
}

#[test]
fn pgibbs_needs_a_particle() {
    let mut engine = normal_model(12);
    assert!(matches!(
        engine.infer(&KernelSpec::parse("(pgibbs default one 0 1)").unwrap()),
        Err(ExecError::ValidationError(_))
    ));
    assert!(engine.is_consistent());
}

#[test]
fn mh_refuses_multi_stage_selections() {
    let mut engine = Engine::with_seed(13);
    engine
        .execute(
            "(assume x0 (scope_include 'h 0 (normal 0 1)))
             (assume x1 (scope_include 'h 1 (normal x0 1)))",
        )
        .unwrap();
    assert_eq!(engine.num_blocks("h"), 2);
    assert!(matches!(
        engine.infer(&KernelSpec::parse("(mh h ordered 1)").unwrap()),
        Err(ExecError::CapabilityMissing(_))
    ));
    assert!(engine.is_consistent());

    let report = engine
        .infer(&KernelSpec::parse("(pgibbs h ordered 3 2)").unwrap())
        .unwrap();
    assert_eq!(report.transitions, 2);
}

#[test]
fn blocks_can_be_addressed_by_name() {
    let mut engine = Engine::with_seed(14);
    engine
        .execute(
            "(assume x0 (scope_include 'h 0 (normal 0 1)))
             (assume x1 (scope_include 'h 1 (normal 0 1)))",
        )
        .unwrap();
    let x0 = engine.value(torus_core::DirectiveId(0)).unwrap();
    let report = engine
        .infer(&KernelSpec::parse("(mh h 1 10)").unwrap())
        .unwrap();
    assert_eq!(report.transitions, 10);
    assert_eq!(engine.value(torus_core::DirectiveId(0)).unwrap(), x0);
}
