//! Monte Carlo drivers for family-wise error.
//!
//! Both scenarios feed a fresh procedure `reps` times with `queries`
//! candidates whose true improvement is zero, so every approval is false.
//! A run with at least one approval counts toward the empirical FWER.
//!
//! - [`Scenario::Null`]: per-unit loss differences are i.i.d. N(0, 1).
//! - [`Scenario::Adversary`]: a developer reusing one held-out set who sees
//!   only approve/reject feedback. Each candidate moves the approved model
//!   along a noise feature, first in the `+` direction, then `-`. After an
//!   approval the developer doubles the step and keeps walking; after a
//!   rejection it flips direction, or moves to the next feature once both
//!   directions are spent or the walk had already paid off. Successive
//!   statistics are correlated through the shared feature.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::SeedableRng;
use rand::distributions::Distribution;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use srgp_engine::stats::upper_critical_value;
use srgp_engine::{
    MechanismKind, MtpConfig, MtpError, MultipleTestingProcedure, Procedure, Verdict,
    build_procedure,
};
use statrs::distribution::Normal;
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::structured_log::{LogEmitter, LogLevel, events};

/// Initial step of the adversary's walk, in loss units per feature unit.
const ADVERSARY_STEP: f64 = 0.1;
/// Scale of the prespecified candidate's perturbation.
const PRESPECIFIED_SCALE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Null,
    Adversary,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Null => "null",
            Self::Adversary => "adversary",
        })
    }
}

/// Shape of a Monte Carlo experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Decisions per run (`num_total_queries`).
    pub queries: usize,
    /// Independent runs.
    pub reps: usize,
    /// Held-out units per candidate.
    pub units: usize,
    /// Seed for the data generator. Each run's procedure seed is `config.seed + rep`.
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            queries: 20,
            reps: 1000,
            units: 100,
            seed: 0,
        }
    }
}

impl SimulationParams {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.queries == 0 {
            return Err(HarnessError::InvalidParams("queries must be positive"));
        }
        if self.reps == 0 {
            return Err(HarnessError::InvalidParams("reps must be positive"));
        }
        if self.units < 2 {
            return Err(HarnessError::InvalidParams("need at least two units"));
        }
        Ok(())
    }
}

/// Aggregate result of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub scenario: Scenario,
    pub mechanism: MechanismKind,
    pub params: SimulationParams,
    pub config: MtpConfig,
    /// Runs with at least one (false) approval.
    pub runs_with_false_approval: usize,
    pub empirical_fwer: f64,
    /// One-sided 97.5% Wilson upper bound on the FWER.
    pub fwer_upper_bound: f64,
    /// Mean approvals per run, prespecified approvals included.
    pub mean_approvals: f64,
    /// Runs cut short by an engine error, keyed by `MtpError::family()`.
    pub errors: BTreeMap<String, usize>,
}

impl SimulationReport {
    /// Whether the observed FWER is statistically compatible with `global_alpha`.
    #[must_use]
    pub fn consistent_with_alpha(&self) -> bool {
        let n = self.params.reps;
        let z = upper_critical_value(0.025);
        let lower = 1.0 - wilson_upper_bound(n - self.runs_with_false_approval, n, z);
        lower <= self.config.global_alpha
    }
}

/// Upper end of the Wilson score interval for `successes` out of `trials`.
#[must_use]
pub fn wilson_upper_bound(successes: usize, trials: usize, z: f64) -> f64 {
    if trials == 0 {
        return 1.0;
    }
    let n = trials as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let center = p + z2 / (2.0 * n);
    let spread = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    ((center + spread) / (1.0 + z2 / n)).min(1.0)
}

/// Global-null simulation.
pub fn simulate_null(
    config: MtpConfig,
    kind: MechanismKind,
    params: SimulationParams,
    log: Option<&mut LogEmitter>,
) -> Result<SimulationReport, HarnessError> {
    Simulation::new(Scenario::Null, config, kind, params)?.run(log)
}

/// Adaptive-reuse simulation.
pub fn simulate_adversary(
    config: MtpConfig,
    kind: MechanismKind,
    params: SimulationParams,
    log: Option<&mut LogEmitter>,
) -> Result<SimulationReport, HarnessError> {
    Simulation::new(Scenario::Adversary, config, kind, params)?.run(log)
}

// ---------------------------------------------------------------------------
// Candidate streams
// ---------------------------------------------------------------------------

struct Query {
    candidate: Vec<f64>,
    baseline: Vec<f64>,
    prespecified: Vec<f64>,
}

/// Produces the loss vectors for each query of one run.
trait CandidateStream {
    fn next_query(&mut self, query: usize, rng: &mut ChaCha20Rng) -> Query;
    fn observe(&mut self, verdict: Verdict);
}

fn standard_normals(normal: &Normal, units: usize, rng: &mut ChaCha20Rng) -> Vec<f64> {
    (0..units).map(|_| normal.sample(rng)).collect()
}

struct NullStream {
    normal: Normal,
    units: usize,
}

impl CandidateStream for NullStream {
    fn next_query(&mut self, _query: usize, rng: &mut ChaCha20Rng) -> Query {
        Query {
            candidate: standard_normals(&self.normal, self.units, rng),
            baseline: vec![0.0; self.units],
            prespecified: standard_normals(&self.normal, self.units, rng),
        }
    }

    fn observe(&mut self, _verdict: Verdict) {}
}

struct AdversaryStream {
    /// Candidate directions; the walk uses at most one new column per query.
    features: Vec<Vec<f64>>,
    /// Per-query evaluation noise added to each candidate.
    jitter: Vec<Vec<f64>>,
    /// Per-query pre-registered modifications.
    registered: Vec<Vec<f64>>,
    approved: Vec<f64>,
    pending: Vec<f64>,
    feature: usize,
    /// `+1.0` or `-1.0`.
    direction: f64,
    step: f64,
}

impl AdversaryStream {
    fn draw(normal: &Normal, params: &SimulationParams, rng: &mut ChaCha20Rng) -> Self {
        let mut columns = |count: usize| -> Vec<Vec<f64>> {
            (0..count)
                .map(|_| standard_normals(normal, params.units, rng))
                .collect()
        };
        let features = columns(params.queries);
        let jitter = columns(params.queries);
        let registered = columns(params.queries);
        Self {
            features,
            jitter,
            registered,
            approved: vec![1.0; params.units],
            pending: Vec::new(),
            feature: 0,
            direction: 1.0,
            step: ADVERSARY_STEP,
        }
    }

    fn next_feature(&mut self) {
        self.feature += 1;
        self.direction = 1.0;
        self.step = ADVERSARY_STEP;
    }
}

impl CandidateStream for AdversaryStream {
    fn next_query(&mut self, query: usize, _rng: &mut ChaCha20Rng) -> Query {
        let column = &self.features[self.feature % self.features.len()];
        let jitter = &self.jitter[query % self.jitter.len()];
        let registered = &self.registered[query % self.registered.len()];

        let candidate: Vec<f64> = self
            .approved
            .iter()
            .zip(column.iter().zip(jitter))
            .map(|(base, (x, e))| base + self.step * (self.direction * x + e))
            .collect();
        let prespecified = self
            .approved
            .iter()
            .zip(registered)
            .map(|(base, r)| base + PRESPECIFIED_SCALE * r)
            .collect();
        self.pending.clone_from(&candidate);
        Query {
            candidate,
            baseline: self.approved.clone(),
            prespecified,
        }
    }

    fn observe(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Accept => {
                self.approved = std::mem::take(&mut self.pending);
                self.step *= 2.0;
            }
            Verdict::Reject if self.step > ADVERSARY_STEP || self.direction < 0.0 => {
                self.next_feature();
            }
            Verdict::Reject => {
                self.direction = -1.0;
                self.step = ADVERSARY_STEP;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct RunOutcome {
    approvals: usize,
    error: Option<MtpError>,
}

struct Simulation {
    scenario: Scenario,
    config: MtpConfig,
    kind: MechanismKind,
    params: SimulationParams,
    normal: Normal,
}

impl Simulation {
    fn new(
        scenario: Scenario,
        config: MtpConfig,
        kind: MechanismKind,
        params: SimulationParams,
    ) -> Result<Self, HarnessError> {
        params.validate()?;
        config.validate()?;
        let normal =
            Normal::new(0.0, 1.0).map_err(|_| HarnessError::InvalidParams("standard normal"))?;
        Ok(Self {
            scenario,
            config,
            kind,
            params,
            normal,
        })
    }

    fn stream(&self, rng: &mut ChaCha20Rng) -> Box<dyn CandidateStream> {
        match self.scenario {
            Scenario::Null => Box::new(NullStream {
                normal: self.normal,
                units: self.params.units,
            }),
            Scenario::Adversary => Box::new(AdversaryStream::draw(&self.normal, &self.params, rng)),
        }
    }

    fn run(self, mut log: Option<&mut LogEmitter>) -> Result<SimulationReport, HarnessError> {
        let started = Instant::now();
        let mut rng = ChaCha20Rng::seed_from_u64(self.params.seed);
        info!(
            scenario = %self.scenario,
            mechanism = %self.kind,
            queries = self.params.queries,
            reps = self.params.reps,
            units = self.params.units,
            "simulation started"
        );
        if let Some(emitter) = log.as_deref_mut() {
            let entry = emitter
                .entry(LogLevel::Info, events::RUN_START)
                .with_scenario(self.scenario)
                .with_mechanism(self.kind.name())
                .with_details(serde_json::to_value(self.params)?);
            emitter.emit_entry(entry).map_err(HarnessError::Log)?;
        }

        let mut runs_with_false_approval = 0usize;
        let mut total_approvals = 0usize;
        let mut errors: BTreeMap<String, usize> = BTreeMap::new();

        for rep in 0..self.params.reps {
            let outcome = self.run_once(rep, &mut rng, log.as_deref_mut())?;
            if outcome.approvals > 0 {
                runs_with_false_approval += 1;
            }
            total_approvals += outcome.approvals;

            match outcome.error {
                Some(err) => {
                    warn!(rep, mechanism = %self.kind, error = %err, "run cut short");
                    *errors.entry(err.family().to_string()).or_default() += 1;
                    if let Some(emitter) = log.as_deref_mut() {
                        let entry = emitter
                            .entry(LogLevel::Warn, events::RUN_ERROR)
                            .with_scenario(self.scenario)
                            .with_mechanism(self.kind.name())
                            .with_rep(rep)
                            .with_approvals(outcome.approvals)
                            .with_error_family(err.family())
                            .with_details(serde_json::json!({ "message": err.to_string() }));
                        emitter.emit_entry(entry).map_err(HarnessError::Log)?;
                    }
                }
                None => {
                    debug!(rep, approvals = outcome.approvals, "run complete");
                    if let Some(emitter) = log.as_deref_mut() {
                        let entry = emitter
                            .entry(LogLevel::Debug, events::RUN_COMPLETE)
                            .with_scenario(self.scenario)
                            .with_mechanism(self.kind.name())
                            .with_rep(rep)
                            .with_approvals(outcome.approvals);
                        emitter.emit_entry(entry).map_err(HarnessError::Log)?;
                    }
                }
            }
        }

        let reps = self.params.reps;
        let report = SimulationReport {
            scenario: self.scenario,
            mechanism: self.kind,
            params: self.params,
            config: self.config,
            runs_with_false_approval,
            empirical_fwer: runs_with_false_approval as f64 / reps as f64,
            fwer_upper_bound: wilson_upper_bound(
                runs_with_false_approval,
                reps,
                upper_critical_value(0.025),
            ),
            mean_approvals: total_approvals as f64 / reps as f64,
            errors,
        };
        info!(
            scenario = %report.scenario,
            mechanism = %report.mechanism,
            fwer = report.empirical_fwer,
            upper = report.fwer_upper_bound,
            "simulation finished"
        );

        if let Some(emitter) = log {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let entry = emitter
                .entry(LogLevel::Info, events::SIMULATION_COMPLETE)
                .with_scenario(self.scenario)
                .with_mechanism(self.kind.name())
                .with_duration_ms(elapsed)
                .with_details(serde_json::to_value(&report)?);
            emitter.emit_entry(entry).map_err(HarnessError::Log)?;
            emitter.flush().map_err(HarnessError::Log)?;
        }
        Ok(report)
    }

    fn run_once(
        &self,
        rep: usize,
        rng: &mut ChaCha20Rng,
        mut log: Option<&mut LogEmitter>,
    ) -> Result<RunOutcome, HarnessError> {
        let run_config = MtpConfig {
            seed: self.config.seed.wrapping_add(rep as u64),
            ..self.config
        };
        let mut procedure = build_procedure(self.kind, run_config)?;
        procedure.initialize(self.params.queries)?;
        let mut stream = self.stream(rng);

        let mut approvals = 0usize;
        let mut error = None;
        for query in 0..self.params.queries {
            let q = stream.next_query(query, rng);
            let prespecified = Some(q.prespecified.as_slice());
            let verdict = match procedure.decide(&q.candidate, &q.baseline, prespecified) {
                Ok(v) => v,
                Err(err @ MtpError::Configuration(_)) => return Err(err.into()),
                Err(err) => {
                    error = Some(err);
                    break;
                }
            };
            if verdict.is_accept() {
                approvals += 1;
            }
            stream.observe(verdict);

            if let Some(emitter) = log.as_deref_mut() {
                let entry = emitter
                    .entry(LogLevel::Trace, events::DECISION)
                    .with_scenario(self.scenario)
                    .with_mechanism(self.kind.name())
                    .with_rep(rep)
                    .with_decision(query, verdict, procedure.thresholds().last().copied());
                emitter.emit_entry(entry).map_err(HarnessError::Log)?;
            }
        }

        // The parallel variant also approves through its prespecified chain.
        if let Procedure::GraphicalParallel(p) = &procedure {
            approvals += p
                .prespecified_outcomes()
                .iter()
                .filter(|v| v.is_accept())
                .count();
        }
        Ok(RunOutcome { approvals, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wilson_bound_brackets_the_estimate() {
        let z = upper_critical_value(0.025);
        let upper = wilson_upper_bound(100, 1000, z);
        assert!(upper > 0.1 && upper < 0.125, "{upper}");
        assert!(wilson_upper_bound(0, 50, z) > 0.0);
        assert_eq!(wilson_upper_bound(5, 5, z), 1.0);
        assert_eq!(wilson_upper_bound(0, 0, z), 1.0);
    }

    #[test]
    fn params_are_validated() {
        let bad = SimulationParams {
            units: 1,
            ..SimulationParams::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(HarnessError::InvalidParams(_))
        ));
        assert!(SimulationParams::default().validate().is_ok());
    }

    fn adversary(queries: usize, units: usize, seed: u64) -> (AdversaryStream, ChaCha20Rng) {
        let normal = Normal::new(0.0, 1.0).unwrap();
        let params = SimulationParams {
            queries,
            reps: 1,
            units,
            seed,
        };
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let stream = AdversaryStream::draw(&normal, &params, &mut rng);
        (stream, rng)
    }

    #[test]
    fn adversary_follows_its_own_approvals() {
        let (mut stream, mut rng) = adversary(4, 30, 9);

        let first = stream.next_query(0, &mut rng);
        assert!(first.baseline.iter().all(|&b| b == 1.0));
        stream.observe(Verdict::Accept);
        assert_eq!(stream.approved, first.candidate);
        assert_eq!(stream.step, 2.0 * ADVERSARY_STEP);
        assert_eq!(stream.feature, 0);

        let second = stream.next_query(1, &mut rng);
        assert_eq!(second.baseline, first.candidate);
        // A paid-off walk that stalls moves on without trying the other direction.
        stream.observe(Verdict::Reject);
        assert_eq!(stream.feature, 1);
        assert_eq!(stream.direction, 1.0);
        assert_eq!(stream.step, ADVERSARY_STEP);
    }

    #[test]
    fn adversary_tries_both_directions_before_moving_on() {
        let (mut stream, mut rng) = adversary(4, 30, 4);
        stream.next_query(0, &mut rng);
        stream.observe(Verdict::Reject);
        assert_eq!((stream.feature, stream.direction), (0, -1.0));
        stream.next_query(1, &mut rng);
        stream.observe(Verdict::Reject);
        assert_eq!((stream.feature, stream.direction), (1, 1.0));
        assert!(stream.approved.iter().all(|&a| a == 1.0));
    }

    #[test]
    fn adversary_direction_ignores_the_holdout_data() {
        // Before any feedback the first move is always `+feature`, whatever
        // the feature's values on the held-out units.
        for seed in 0..8 {
            let (mut stream, mut rng) = adversary(2, 50, seed);
            let q = stream.next_query(0, &mut rng);
            for (i, ((c, b), e)) in q
                .candidate
                .iter()
                .zip(&q.baseline)
                .zip(&stream.jitter[0])
                .enumerate()
            {
                let expected = ADVERSARY_STEP * (stream.features[0][i] + e);
                assert!((c - b - expected).abs() < 1e-12);
            }
        }
    }
}
