use srgp_engine::stats::{normal_cdf, normal_quantile, upper_critical_value};
use srgp_engine::{
    Bonferroni, ConfigurationError, GraphicalBonf, MechanismKind, MtpConfig, MtpError,
    MultipleTestingProcedure, Procedure, Verdict, build_procedure,
};

/// Loss differences with exactly the given mean and population sd.
fn paired(mean: f64, sd: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
    let baseline: Vec<f64> = (0..n).map(|i| 0.5 + 0.01 * (i % 7) as f64).collect();
    let candidate = baseline
        .iter()
        .enumerate()
        .map(|(i, b)| b + mean + if i % 2 == 0 { sd } else { -sd })
        .collect();
    (candidate, baseline)
}

fn wavy(mean: f64, salt: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| mean + ((i as f64 + 1.0) * salt).sin())
        .collect()
}

#[test]
fn scenario_two_queries_first_accepted() {
    let mut p = GraphicalBonf::new(MtpConfig::new(0.1, 0.8)).unwrap();
    p.initialize(2).unwrap();
    let (c, b) = paired(-0.5, 1.0, 100);
    assert_eq!(p.decide(&c, &b, None).unwrap(), Verdict::Accept);
    assert_eq!(p.decide(&c, &b, None).unwrap().as_int(), 1);

    let tree = p.tree();
    let root = tree.root().unwrap();
    let first = tree.node(root).children[0];
    let continuation = tree.node(first).children[0];
    let remaining_sibling = tree.node(root).children[1];
    assert!((tree.node(continuation).weight - 0.8).abs() < 1e-12);
    assert!((tree.node(remaining_sibling).weight - 0.2).abs() < 1e-12);
    assert!(tree.is_terminal());
}

#[test]
fn exhaustion_on_extra_call() {
    for kind in [
        MechanismKind::Bonferroni,
        MechanismKind::GraphicalBonf,
        MechanismKind::GraphicalFfs,
    ] {
        let mut p = build_procedure(kind, MtpConfig::default()).unwrap();
        p.initialize(3).unwrap();
        for k in 0..3 {
            let c = wavy(0.3, 0.5 + 0.45 * f64::from(k), 80);
            p.decide(&c, &vec![0.0; 80], None).unwrap();
        }
        let c = wavy(0.0, 2.9, 80);
        assert_eq!(
            p.decide(&c, &vec![0.0; 80], None).unwrap_err(),
            MtpError::BudgetExhausted {
                num_total_queries: 3
            },
            "{kind}"
        );
    }
}

#[test]
fn bonferroni_three_queries_uses_alpha_over_eight() {
    // z = 2.0: accepted at alpha = 0.1, rejected at 0.1 / 8.
    let (c, b) = paired(-0.2, 1.0, 100);
    let mut unadjusted =
        build_procedure(MechanismKind::BinaryThreshold, MtpConfig::default()).unwrap();
    unadjusted.initialize(3).unwrap();
    assert_eq!(unadjusted.decide(&c, &b, None).unwrap(), Verdict::Accept);

    let mut p = Bonferroni::new(MtpConfig::default()).unwrap();
    p.initialize(3).unwrap();
    for _ in 0..3 {
        assert_eq!(p.decide(&c, &b, None).unwrap(), Verdict::Reject);
    }
    assert_eq!(p.level(), Some(0.1 / 8.0));
    for t in p.thresholds() {
        assert!((t - upper_critical_value(0.0125)).abs() < 1e-12);
    }
}

#[test]
fn decide_before_initialize_is_configuration_error() {
    let mut p = build_procedure(MechanismKind::GraphicalFfs, MtpConfig::default()).unwrap();
    let (c, b) = paired(-0.5, 1.0, 20);
    assert_eq!(
        p.decide(&c, &b, None).unwrap_err().family(),
        "configuration"
    );
}

#[test]
fn collinear_resubmission_after_failure_is_decided() {
    let b = vec![0.0; 100];
    let c = wavy(0.2, 0.8, 100);
    let rescaled: Vec<f64> = c.iter().map(|x| 2.0 * x - 0.3).collect();
    for second in [c.clone(), rescaled] {
        let mut p = build_procedure(MechanismKind::GraphicalFfs, MtpConfig::default()).unwrap();
        p.initialize(4).unwrap();
        assert_eq!(p.decide(&c, &b, None).unwrap(), Verdict::Reject);
        assert_eq!(p.decide(&second, &b, None).unwrap(), Verdict::Reject);

        // Perfect correlation with the failed sibling: Φ(t) = Φ(c1)(1 - α).
        let c1 = p.thresholds()[0];
        let exact = normal_quantile(normal_cdf(c1) * (1.0 - 0.016));
        let t = p.thresholds()[1];
        assert!((t - exact).abs() < 2e-2, "{t} vs {exact}");
        assert!(t < upper_critical_value(0.016));
    }
}

#[test]
fn mismatched_lengths_rejected_everywhere() {
    for kind in MechanismKind::ALL {
        let mut p = build_procedure(kind, MtpConfig::default()).unwrap();
        p.initialize(2).unwrap();
        let err = p
            .decide(&[0.1, 0.2, 0.3], &[0.1, 0.2], Some(&[0.1, 0.2]))
            .unwrap_err();
        assert!(
            matches!(
                err,
                MtpError::Configuration(ConfigurationError::LengthMismatch { .. })
            ),
            "{kind}: {err}"
        );
    }
}

#[test]
fn persisted_run_resumes_identically() {
    let config = MtpConfig {
        robustness_tries: 3,
        seed: 5,
        ..MtpConfig::default()
    };
    let baseline = vec![0.0; 150];
    let mut live = build_procedure(MechanismKind::GraphicalParallel, config).unwrap();
    live.initialize(6).unwrap();
    for k in 0..3 {
        let k = f64::from(k);
        live.decide(
            &wavy(0.1, 0.6 + 0.3 * k, 150),
            &baseline,
            Some(&wavy(0.05, 1.75 + 0.2 * k, 150)),
        )
        .unwrap();
    }

    let snapshot = live.to_json().unwrap();
    let mut resumed = Procedure::from_json(&snapshot).unwrap();
    assert_eq!(resumed.kind(), MechanismKind::GraphicalParallel);
    for k in 3..6 {
        let k = f64::from(k);
        let cand = wavy(0.1, 0.6 + 0.3 * k, 150);
        let pre = wavy(0.05, 1.75 + 0.2 * k, 150);
        assert_eq!(
            live.decide(&cand, &baseline, Some(&pre)).unwrap(),
            resumed.decide(&cand, &baseline, Some(&pre)).unwrap()
        );
    }
    assert_eq!(live, resumed);
}

#[test]
fn outcome_and_threshold_histories_line_up() {
    let mut p = build_procedure(MechanismKind::GraphicalFfs, MtpConfig::default()).unwrap();
    p.initialize(5).unwrap();
    let b = vec![0.0; 120];
    for (k, mean) in [-0.4, 0.2, 0.3, -0.5, 0.1].into_iter().enumerate() {
        p.decide(&wavy(mean, 0.4 + 0.37 * k as f64, 120), &b, None)
            .unwrap();
    }
    assert_eq!(p.query_count(), 5);
    assert_eq!(p.outcomes().len(), p.thresholds().len());
    assert_eq!(p.outcomes()[0], Verdict::Accept);
    assert_eq!(p.outcomes()[1], Verdict::Reject);
}
