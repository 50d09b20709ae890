//! The seam to the external fitting engine.
//!
//! The cascade treats the engine as a black box: every operation is atomic,
//! synchronous and fallible, with defined table-level effects on the
//! [`TableSet`] it is handed. Implementations must be shareable across the
//! runner's worker threads.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ConfigError, EngineError};
use crate::job::FitKind;
use crate::tables::TableSet;

/// How posterior samples are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleMethod {
    /// Asymptotic approximation around the point estimate.
    Asymptotic,
    /// Simulate data replicates and refit each one.
    Simulate,
}

impl SampleMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asymptotic" => Some(SampleMethod::Asymptotic),
            "simulate" => Some(SampleMethod::Simulate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleMethod::Asymptotic => "asymptotic",
            SampleMethod::Simulate => "simulate",
        }
    }
}

impl fmt::Display for SampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which optimizer inputs a perturbation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerturbTarget {
    StartValues,
    ScaleValues,
}

impl PerturbTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerturbTarget::StartValues => "start_values",
            PerturbTarget::ScaleValues => "scale_values",
        }
    }
}

/// Engine-side variable tables addressable by `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarTable {
    Truth,
    Fit,
    Start,
    Scale,
}

impl VarTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            VarTable::Truth => "truth",
            VarTable::Fit => "fit",
            VarTable::Start => "start",
            VarTable::Scale => "scale",
        }
    }
}

/// What a predict call evaluates the requests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictSource {
    /// The posterior point estimate.
    FitResult,
    /// Every posterior sample.
    Samples,
}

impl PredictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictSource::FitResult => "fit_result",
            PredictSource::Samples => "samples",
        }
    }
}

/// Balance keys for hold-out subsampling: held-in rows are balanced between
/// the two covariate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSpec {
    pub covariate: String,
    pub value_a: f64,
    pub value_b: f64,
}

impl BalanceSpec {
    /// Parse the registry's space-separated `covariate value value` form.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let malformed = || ConfigError::MalformedBalance {
            value: raw.to_string(),
        };
        if fields.len() != 3 {
            return Err(malformed());
        }
        let value_a: f64 = fields[1].parse().map_err(|_| malformed())?;
        let value_b: f64 = fields[2].parse().map_err(|_| malformed())?;
        Ok(Self {
            covariate: fields[0].to_string(),
            value_a,
            value_b,
        })
    }
}

/// The delegated external fitting engine.
pub trait FitEngine: Send + Sync {
    /// Initialize the model variables for the current input tables.
    fn init(&self, tables: &mut TableSet) -> Result<(), EngineError>;

    /// Subsample one integrand's data down to `max_fit` rows, holding the
    /// rest out, optionally balanced by the given keys.
    fn hold_out(
        &self,
        tables: &mut TableSet,
        integrand: &str,
        max_fit: usize,
        balance: Option<&BalanceSpec>,
    ) -> Result<(), EngineError>;

    /// Bound the absolute effect of every covariate multiplier.
    fn bound_covariate_effect(&self, tables: &mut TableSet, bound: f64) -> Result<(), EngineError>;

    /// Randomly perturb optimizer start or scale values.
    fn perturb(
        &self,
        tables: &mut TableSet,
        target: PerturbTarget,
        sigma: f64,
    ) -> Result<(), EngineError>;

    /// Run the optimization.
    fn fit(&self, tables: &mut TableSet, kind: FitKind) -> Result<(), EngineError>;

    /// Copy one engine variable table onto another.
    fn set(
        &self,
        tables: &mut TableSet,
        target: VarTable,
        source: VarTable,
    ) -> Result<(), EngineError>;

    /// Simulate `count` data replicates from the truth variables.
    fn simulate(&self, tables: &mut TableSet, count: usize) -> Result<(), EngineError>;

    /// Draw `count` posterior samples.
    fn sample(
        &self,
        tables: &mut TableSet,
        method: SampleMethod,
        kind: FitKind,
        count: usize,
    ) -> Result<(), EngineError>;

    /// Evaluate every prediction request against `source`, replacing the
    /// predictions table.
    fn predict(&self, tables: &mut TableSet, source: PredictSource) -> Result<(), EngineError>;
}
