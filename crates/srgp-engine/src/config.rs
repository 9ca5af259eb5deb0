//! Procedure configuration.
//!
//! Parameters come from three places, later ones overriding earlier ones:
//! - [`MtpConfig::default`]: the values the procedures were tuned with
//!   (`alpha = 0.1`, `success_fraction = 0.8`, `parallel_ratio = 0.9`, ...).
//! - A JSON document (`serde`), usually a harness `--config` file.
//! - Environment variables read by [`MtpConfig::from_env`]:
//!   `SRGP_ALPHA`, `SRGP_SUCCESS_FRACTION`, `SRGP_PARALLEL_RATIO`,
//!   `SRGP_FIRST_PRESPEC_WEIGHT`, `SRGP_ROBUSTNESS_TRIES`, `SRGP_MVN_SAMPLES`,
//!   `SRGP_SEED`.
//!
//! Malformed values are rejected, never replaced by a default.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Tunable parameters shared by every procedure variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtpConfig {
    /// Family-wise type-I error budget for the whole run, in (0, 1).
    pub global_alpha: f64,
    /// Share of a succeeding node's weight passed to its first continuation child.
    pub success_fraction: f64,
    /// Share of alpha reserved for the prespecified chain (parallel variant only).
    pub parallel_ratio: f64,
    /// Share of the prespecified budget given to the first prespecified node.
    pub first_prespecified_weight: f64,
    /// Random null configurations tried by the threshold robustness check (0 = off).
    pub robustness_tries: usize,
    /// Lattice points used by the multivariate-normal integration.
    pub mvn_samples: usize,
    /// Seed for the lattice shifts and the robustness subset sampler.
    pub seed: u64,
}

impl Default for MtpConfig {
    fn default() -> Self {
        Self {
            global_alpha: 0.1,
            success_fraction: 0.8,
            parallel_ratio: 0.9,
            first_prespecified_weight: 0.5,
            robustness_tries: 0,
            mvn_samples: 1024,
            seed: 0,
        }
    }
}

impl MtpConfig {
    /// Config with the given alpha and success fraction, defaults elsewhere.
    #[must_use]
    pub fn new(global_alpha: f64, success_fraction: f64) -> Self {
        Self {
            global_alpha,
            success_fraction,
            ..Self::default()
        }
    }

    /// Check every range constraint.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.global_alpha > 0.0 && self.global_alpha < 1.0) {
            return Err(ConfigurationError::AlphaOutOfRange(self.global_alpha));
        }
        if !(0.0..=1.0).contains(&self.success_fraction) {
            return Err(ConfigurationError::SuccessFractionOutOfRange(
                self.success_fraction,
            ));
        }
        if !(0.0..=1.0).contains(&self.parallel_ratio) {
            return Err(ConfigurationError::ParallelRatioOutOfRange(
                self.parallel_ratio,
            ));
        }
        if !(0.0..=1.0).contains(&self.first_prespecified_weight) {
            return Err(ConfigurationError::FirstPrespecifiedWeightOutOfRange(
                self.first_prespecified_weight,
            ));
        }
        if self.mvn_samples == 0 {
            return Err(ConfigurationError::ZeroSamples);
        }
        Ok(())
    }

    /// Overlay `SRGP_*` environment variables on top of `self`.
    pub fn from_env(self) -> Result<Self, ConfigurationError> {
        self.overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup` (keyed by environment variable name).
    pub fn overlay(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        if let Some(v) = parse_var(&lookup, "SRGP_ALPHA")? {
            self.global_alpha = v;
        }
        if let Some(v) = parse_var(&lookup, "SRGP_SUCCESS_FRACTION")? {
            self.success_fraction = v;
        }
        if let Some(v) = parse_var(&lookup, "SRGP_PARALLEL_RATIO")? {
            self.parallel_ratio = v;
        }
        if let Some(v) = parse_var(&lookup, "SRGP_FIRST_PRESPEC_WEIGHT")? {
            self.first_prespecified_weight = v;
        }
        if let Some(v) = parse_var(&lookup, "SRGP_ROBUSTNESS_TRIES")? {
            self.robustness_tries = v;
        }
        if let Some(v) = parse_var(&lookup, "SRGP_MVN_SAMPLES")? {
            self.mvn_samples = v;
        }
        if let Some(v) = parse_var(&lookup, "SRGP_SEED")? {
            self.seed = v;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigurationError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigurationError::MalformedEnv { var, value: raw }),
    }
}

/// Which decision procedure to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    /// Test every query at the full alpha. Not a valid FWER procedure.
    BinaryThreshold,
    /// Static `alpha / 2^Q` correction.
    Bonferroni,
    /// Spending tree, independence assumed.
    GraphicalBonf,
    /// Spending tree with correlation-aware critical values.
    GraphicalFfs,
    /// Prespecified chain running alongside an adaptive FFS tree.
    GraphicalParallel,
}

impl MechanismKind {
    pub const ALL: [Self; 5] = [
        Self::BinaryThreshold,
        Self::Bonferroni,
        Self::GraphicalBonf,
        Self::GraphicalFfs,
        Self::GraphicalParallel,
    ];

    /// Parse a mechanism name (case-insensitive, accepts historical aliases).
    pub fn from_str_loose(s: &str) -> Result<Self, ConfigurationError> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "binary" | "binary_thres" | "binary_thres_mtp" | "binary_threshold" => {
                Ok(Self::BinaryThreshold)
            }
            "bonferroni" | "bonferroni_thres" => Ok(Self::Bonferroni),
            "graphical_bonf" | "graphical_bonf_thres" => Ok(Self::GraphicalBonf),
            "graphical_ffs" | "ffs" => Ok(Self::GraphicalFfs),
            "graphical_par" | "graphical_prespec" | "graphical_parallel" | "parallel" => {
                Ok(Self::GraphicalParallel)
            }
            _ => Err(ConfigurationError::UnknownMechanism(s.to_string())),
        }
    }

    /// Canonical mechanism name, as reported by the procedures.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BinaryThreshold => "binary_thres",
            Self::Bonferroni => "bonferroni_thres",
            Self::GraphicalBonf => "graphical_bonf_thres",
            Self::GraphicalFfs => "graphical_ffs",
            Self::GraphicalParallel => "graphical_par",
        }
    }
}

impl std::fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
