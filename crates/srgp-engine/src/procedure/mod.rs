//! Online decision procedures.
//!
//! Every variant answers one question per call: does the candidate model's
//! per-unit loss beat the currently approved model's loss by enough to be
//! approved, given everything already tested in this run?
//!
//! | Variant | Level used at query `j` | FWER valid |
//! |---|---|---|
//! | [`BinaryThreshold`] | `alpha` | no |
//! | [`Bonferroni`] | `alpha / 2^Q` | yes |
//! | [`GraphicalBonf`] | active node's local alpha | yes |
//! | [`GraphicalFfs`] | local alpha, correlation-aware critical value | approx. |
//! | [`GraphicalParallel`] | prespecified chain + adaptive tree | approx. |

mod binary;
mod graphical;
mod parallel;

pub use binary::{BinaryThreshold, Bonferroni};
pub use graphical::{GraphicalBonf, GraphicalFfs};
pub use parallel::GraphicalParallel;

use serde::{Deserialize, Serialize};

use crate::config::{MechanismKind, MtpConfig};
use crate::error::{ConfigurationError, MtpError, Result};
use crate::stats::log_losses;

/// Outcome of one decision call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Verdict {
    Reject = 0,
    Accept = 1,
}

impl Verdict {
    #[must_use]
    pub const fn from_accepted(accepted: bool) -> Self {
        if accepted { Self::Accept } else { Self::Reject }
    }

    #[must_use]
    pub const fn as_int(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Contract between a model-development loop and a testing procedure.
pub trait MultipleTestingProcedure {
    /// Canonical mechanism name.
    fn name(&self) -> &'static str;

    /// Plan the run for `num_total_queries` decisions. Must precede `decide`.
    fn initialize(&mut self, num_total_queries: usize) -> Result<()>;

    /// Decide on a candidate from paired per-unit losses.
    ///
    /// `candidate[i]` and `baseline[i]` must be losses on the same held-out
    /// unit. `prespecified` is required by variants that run a prespecified
    /// chain and ignored by the rest.
    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        prespecified: Option<&[f64]>,
    ) -> Result<Verdict>;

    /// Decide from predicted probabilities for binary `labels`.
    fn decide_predictions(
        &mut self,
        labels: &[f64],
        candidate: &[f64],
        baseline: &[f64],
        prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        let candidate = log_losses(labels, candidate)?;
        let baseline = log_losses(labels, baseline)?;
        let prespecified = prespecified
            .map(|p| log_losses(labels, p))
            .transpose()?;
        self.decide(&candidate, &baseline, prespecified.as_deref())
    }

    /// Verdicts returned so far, in order.
    fn outcomes(&self) -> &[Verdict];

    /// Critical values (on the improvement-statistic scale) used so far.
    fn thresholds(&self) -> &[f64];

    fn query_count(&self) -> usize {
        self.outcomes().len()
    }

    fn requires_prespecified(&self) -> bool {
        false
    }
}

/// Verdict and threshold history plus the planned query count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct DecisionLog {
    num_total_queries: Option<usize>,
    outcomes: Vec<Verdict>,
    thresholds: Vec<f64>,
}

impl DecisionLog {
    pub(crate) fn reset(&mut self, num_total_queries: usize) -> Result<()> {
        if num_total_queries == 0 {
            return Err(ConfigurationError::ZeroQueries.into());
        }
        self.num_total_queries = Some(num_total_queries);
        self.outcomes.clear();
        self.thresholds.clear();
        Ok(())
    }

    /// Planned query count, failing when the run is uninitialized or spent.
    pub(crate) fn ensure_open(&self) -> Result<usize> {
        let num_total_queries = self
            .num_total_queries
            .ok_or(MtpError::Configuration(ConfigurationError::NotInitialized))?;
        if self.outcomes.len() >= num_total_queries {
            return Err(MtpError::BudgetExhausted { num_total_queries });
        }
        Ok(num_total_queries)
    }

    pub(crate) fn push(&mut self, verdict: Verdict, threshold: f64) {
        self.outcomes.push(verdict);
        self.thresholds.push(threshold);
    }

    pub(crate) fn outcomes(&self) -> &[Verdict] {
        &self.outcomes
    }

    pub(crate) fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }
}

/// Any procedure variant, for factories and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Procedure {
    BinaryThreshold(BinaryThreshold),
    Bonferroni(Bonferroni),
    GraphicalBonf(GraphicalBonf),
    GraphicalFfs(GraphicalFfs),
    GraphicalParallel(GraphicalParallel),
}

/// Build an uninitialized procedure of `kind` from a validated config.
pub fn build_procedure(kind: MechanismKind, config: MtpConfig) -> Result<Procedure> {
    config.validate()?;
    Ok(match kind {
        MechanismKind::BinaryThreshold => Procedure::BinaryThreshold(BinaryThreshold::new(config)?),
        MechanismKind::Bonferroni => Procedure::Bonferroni(Bonferroni::new(config)?),
        MechanismKind::GraphicalBonf => Procedure::GraphicalBonf(GraphicalBonf::new(config)?),
        MechanismKind::GraphicalFfs => Procedure::GraphicalFfs(GraphicalFfs::new(config)?),
        MechanismKind::GraphicalParallel => {
            Procedure::GraphicalParallel(GraphicalParallel::new(config)?)
        }
    })
}

impl Procedure {
    #[must_use]
    pub fn kind(&self) -> MechanismKind {
        match self {
            Self::BinaryThreshold(_) => MechanismKind::BinaryThreshold,
            Self::Bonferroni(_) => MechanismKind::Bonferroni,
            Self::GraphicalBonf(_) => MechanismKind::GraphicalBonf,
            Self::GraphicalFfs(_) => MechanismKind::GraphicalFfs,
            Self::GraphicalParallel(_) => MechanismKind::GraphicalParallel,
        }
    }

    fn inner(&self) -> &dyn MultipleTestingProcedure {
        match self {
            Self::BinaryThreshold(p) => p,
            Self::Bonferroni(p) => p,
            Self::GraphicalBonf(p) => p,
            Self::GraphicalFfs(p) => p,
            Self::GraphicalParallel(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn MultipleTestingProcedure {
        match self {
            Self::BinaryThreshold(p) => p,
            Self::Bonferroni(p) => p,
            Self::GraphicalBonf(p) => p,
            Self::GraphicalFfs(p) => p,
            Self::GraphicalParallel(p) => p,
        }
    }

    /// Serialize the full run state.
    ///
    /// JSON has no representation for infinite critical values, which a
    /// zero-weight node produces; use a binary serde format for such runs.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl MultipleTestingProcedure for Procedure {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn initialize(&mut self, num_total_queries: usize) -> Result<()> {
        self.inner_mut().initialize(num_total_queries)
    }

    fn decide(
        &mut self,
        candidate: &[f64],
        baseline: &[f64],
        prespecified: Option<&[f64]>,
    ) -> Result<Verdict> {
        self.inner_mut().decide(candidate, baseline, prespecified)
    }

    fn outcomes(&self) -> &[Verdict] {
        self.inner().outcomes()
    }

    fn thresholds(&self) -> &[f64] {
        self.inner().thresholds()
    }

    fn query_count(&self) -> usize {
        self.inner().query_count()
    }

    fn requires_prespecified(&self) -> bool {
        self.inner().requires_prespecified()
    }
}
