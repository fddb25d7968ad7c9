//! Transition throughput of the inference kernels.
//!
//! Focus:
//! - in-place MH on a conjugate model with many observations
//! - functional MH, which proposes into a particle overlay
//! - particle Gibbs over an ordered latent sequence

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use torus_core::{Engine, KernelSpec};

const OBSERVATIONS: usize = 50;

fn conjugate_engine() -> Engine {
    let mut engine = Engine::with_seed(17);
    engine.assume("mu", "(normal 0 10)").expect("assume mu");
    for i in 0..OBSERVATIONS {
        let y = (i % 7) as f64 - 3.0;
        engine.observe("(normal mu 1)", y).expect("observe");
    }
    engine.make_consistent().expect("make consistent");
    engine
}

fn sequence_engine() -> Engine {
    let mut engine = Engine::with_seed(23);
    engine
        .execute(
            "(assume step (lambda (prev) (normal prev 1)))
             (assume x0 (scope_include 'h 0 (normal 0 1)))
             (assume x1 (scope_include 'h 1 (step x0)))
             (assume x2 (scope_include 'h 2 (step x1)))
             (assume x3 (scope_include 'h 3 (step x2)))
             (observe (normal x0 0.5) 0.2)
             (observe (normal x1 0.5) 0.9)
             (observe (normal x2 0.5) 1.4)
             (observe (normal x3 0.5) 2.1)",
        )
        .expect("sequence program");
    engine.make_consistent().expect("make consistent");
    engine
}

fn bench_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitions");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    let mh = KernelSpec::parse("(mh default one 1)").expect("mh spec");
    let mut engine = conjugate_engine();
    group.bench_function("mh_conjugate", |b| {
        b.iter(|| black_box(engine.infer(&mh).expect("mh transition")))
    });

    let func_mh = KernelSpec::parse("(func_mh default one 1)").expect("func_mh spec");
    let mut engine = conjugate_engine();
    group.bench_function("func_mh_conjugate", |b| {
        b.iter(|| black_box(engine.infer(&func_mh).expect("func_mh transition")))
    });

    let pgibbs = KernelSpec::parse("(pgibbs h ordered 8 1)").expect("pgibbs spec");
    let mut engine = sequence_engine();
    group.bench_function("pgibbs_sequence", |b| {
        b.iter(|| black_box(engine.infer(&pgibbs).expect("pgibbs transition")))
    });

    group.finish();
}

criterion_group!(benches, bench_transitions);
criterion_main!(benches);
