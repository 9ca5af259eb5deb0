//! Threshold solver and decision-loop benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use srgp_engine::{
    CorrelationMatrix, MechanismKind, MtpConfig, MultipleTestingProcedure, ThresholdSolver,
    build_procedure,
};

fn equicorrelated(dim: usize, rho: f64) -> CorrelationMatrix {
    let mut data = vec![rho; dim * dim];
    for i in 0..dim {
        data[i * dim + i] = 1.0;
    }
    CorrelationMatrix::new(dim, data).expect("valid correlation")
}

fn bench_conditional_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("conditional_solve");
    for &priors in &[1usize, 4, 8, 16] {
        let corr = equicorrelated(priors + 1, 0.4);
        let thresholds = vec![1.5; priors];
        for &samples in &[256usize, 1024] {
            let solver = ThresholdSolver::new(samples, 7, 0).expect("solver");
            group.bench_with_input(
                BenchmarkId::new(format!("n{samples}"), priors),
                &priors,
                |b, _| {
                    b.iter(|| {
                        let t = solver.solve(&corr, &thresholds, 0.005).expect("solve");
                        criterion::black_box(t);
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_robust_solve(c: &mut Criterion) {
    let corr = equicorrelated(9, 0.3);
    let thresholds = vec![1.8; 8];
    c.bench_function("robust_solve/8priors_5tries", |b| {
        let mut solver = ThresholdSolver::new(512, 7, 5).expect("solver");
        b.iter(|| {
            let t = solver
                .solve_robust(&corr, &thresholds, 0.005)
                .expect("solve");
            criterion::black_box(t);
        });
    });
}

fn bench_null_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("null_run_q10");
    let n = 200;
    let candidates: Vec<Vec<f64>> = (0..10)
        .map(|k| {
            (0..n)
                .map(|i| ((i as f64 + 1.0) * (0.61 + 0.37 * k as f64)).sin())
                .collect()
        })
        .collect();
    let baseline = vec![0.0; n];
    for kind in [MechanismKind::GraphicalBonf, MechanismKind::GraphicalFfs] {
        group.bench_function(kind.name(), |b| {
            b.iter(|| {
                let mut p = build_procedure(kind, MtpConfig::default()).expect("procedure");
                p.initialize(candidates.len()).expect("init");
                for cand in &candidates {
                    criterion::black_box(p.decide(cand, &baseline, None).expect("decide"));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_conditional_solve, bench_robust_solve, bench_null_run);
criterion_main!(benches);
