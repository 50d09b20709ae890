//! Typed model tables for a single fit database.
//!
//! Each pipeline stage owns an explicit [`TableSet`] value rather than a
//! string-keyed bag of tables: input tables describe the model handed to the
//! delegated fitting engine, output tables are what the engine writes back,
//! and the seed slots hold the relocated prediction tables a parent keeps
//! around to derive its children's priors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::LookupError;
use crate::hierarchy::{NodeId, NodeTree};

pub type AgeId = usize;
pub type TimeId = usize;
pub type DensityId = usize;
pub type IntegrandId = usize;
pub type CovariateId = usize;
pub type MultiplierId = usize;
pub type RateId = usize;
pub type SmoothId = usize;
pub type PriorId = usize;
pub type WeightId = usize;
pub type SubgroupId = usize;
pub type RequestId = usize;

/// Name of the option row recording which node a database fits.
pub const PARENT_NODE_OPTION: &str = "parent_node_name";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeRow {
    pub age: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRow {
    pub time: f64,
}

/// Density families a prior can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DensityKind {
    Uniform,
    Gaussian,
    Laplace,
    LogGaussian,
    StudentsT,
}

impl DensityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DensityKind::Uniform => "uniform",
            DensityKind::Gaussian => "gaussian",
            DensityKind::Laplace => "laplace",
            DensityKind::LogGaussian => "log_gaussian",
            DensityKind::StudentsT => "students_t",
        }
    }
}

impl fmt::Display for DensityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensityRow {
    pub kind: DensityKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrandRow {
    pub name: String,
    pub minimum_meas_cv: f64,
}

impl IntegrandRow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            minimum_meas_cv: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgroupRow {
    pub name: String,
    pub group_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRow {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateRow {
    pub name: String,
    pub reference: f64,
    pub max_difference: Option<f64>,
}

/// What a covariate multiplier acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiplierKind {
    RateValue,
    MeasurementValue,
    MeasurementNoise,
}

/// A covariate effect coefficient on a rate or on measurement noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierRow {
    pub kind: MultiplierKind,
    pub covariate_id: CovariateId,
    pub rate_id: Option<RateId>,
    pub integrand_id: Option<IntegrandId>,
    pub group_smooth_id: Option<SmoothId>,
    pub subgroup_smooth_id: Option<SmoothId>,
}

/// The model rates a cascade fits or constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateKind {
    Incidence,
    Remission,
    ExcessMortality,
    /// Background (all-cause residual) mortality; constraint-only, never
    /// seeded from data.
    BackgroundMortality,
}

impl RateKind {
    /// The primary rates are the ones prediction requests are built for.
    pub fn is_primary(&self) -> bool {
        !matches!(self, RateKind::BackgroundMortality)
    }

    /// Name of the integrand that measures this rate directly.
    pub fn integrand_name(&self) -> &'static str {
        match self {
            RateKind::Incidence => "incidence",
            RateKind::Remission => "remission",
            RateKind::ExcessMortality => "excess_mortality",
            RateKind::BackgroundMortality => "background_mortality",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateKind::Incidence => "incidence",
            RateKind::Remission => "remission",
            RateKind::ExcessMortality => "excess_mortality",
            RateKind::BackgroundMortality => "background_mortality",
        }
    }
}

impl fmt::Display for RateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRow {
    pub kind: RateKind,
    pub parent_smooth_id: Option<SmoothId>,
    pub child_smooth_id: Option<SmoothId>,
}

impl RateRow {
    pub fn new(kind: RateKind) -> Self {
        Self {
            kind,
            parent_smooth_id: None,
            child_smooth_id: None,
        }
    }
}

/// A named age-time grid of priors. The optional scale priors apply to the
/// whole grid at once, which prior propagation cannot represent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothRow {
    pub name: String,
    pub value_scale_prior: Option<PriorId>,
    pub age_diff_scale_prior: Option<PriorId>,
    pub time_diff_scale_prior: Option<PriorId>,
}

impl SmoothRow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value_scale_prior: None,
            age_diff_scale_prior: None,
            time_diff_scale_prior: None,
        }
    }

    pub fn has_grid_scale_prior(&self) -> bool {
        self.value_scale_prior.is_some()
            || self.age_diff_scale_prior.is_some()
            || self.time_diff_scale_prior.is_some()
    }
}

/// One grid point of a smoothing. Either a value prior or a constant value;
/// the difference priors constrain the age/time direction steps away from
/// this point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothGridRow {
    pub smooth_id: SmoothId,
    pub age_id: AgeId,
    pub time_id: TimeId,
    pub value_prior: Option<PriorId>,
    pub age_diff_prior: Option<PriorId>,
    pub time_diff_prior: Option<PriorId>,
    pub const_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorRow {
    pub name: String,
    pub density_id: DensityId,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub mean: f64,
    pub std: Option<f64>,
    pub eta: Option<f64>,
    pub nu: Option<f64>,
}

impl PriorRow {
    pub fn new(name: &str, density_id: DensityId, mean: f64) -> Self {
        Self {
            name: name.to_string(),
            density_id,
            lower: None,
            upper: None,
            mean,
            std: None,
            eta: None,
            nu: None,
        }
    }
}

/// One observation row. Covariate values align with the covariate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub integrand_id: IntegrandId,
    pub node_id: NodeId,
    pub density_id: DensityId,
    pub hold_out: bool,
    pub age_lower: f64,
    pub age_upper: f64,
    pub time_lower: f64,
    pub time_upper: f64,
    pub mean: f64,
    pub std: f64,
    pub covariates: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionRow {
    pub name: String,
    pub value: String,
}

/// Which quantity a prediction request extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeedQuantity {
    Multiplier(MultiplierId),
    Rate(RateId),
}

/// The cascade-specific tag carried on each prediction request. It survives
/// engine round-trips unchanged and is the lookup key prior propagation
/// joins predictions back to grid points with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedTag {
    pub quantity: SeedQuantity,
    /// Child node the prediction is for; None for multiplier rows.
    pub node_id: Option<NodeId>,
    pub age_id: AgeId,
    pub time_id: TimeId,
}

impl fmt::Display for SeedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quantity {
            SeedQuantity::Multiplier(id) => write!(f, "multiplier {id}")?,
            SeedQuantity::Rate(id) => write!(f, "rate {id}")?,
        }
        if let Some(node) = self.node_id {
            write!(f, " node {node}")?;
        }
        write!(f, " age_id {} time_id {}", self.age_id, self.time_id)
    }
}

/// One requested prediction point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub integrand_id: IntegrandId,
    pub node_id: Option<NodeId>,
    pub subgroup_id: SubgroupId,
    pub weight_id: Option<WeightId>,
    pub age_lower: f64,
    pub age_upper: f64,
    pub time_lower: f64,
    pub time_upper: f64,
    pub covariates: Vec<Option<f64>>,
    pub tag: SeedTag,
}

/// One evaluated prediction. `sample_index` is None for predictions at the
/// point estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub request_id: RequestId,
    pub sample_index: Option<usize>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitResultRow {
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSampleRow {
    pub sample_index: usize,
    pub var_id: usize,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    Command,
    Note,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub at: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

/// The full table set of one fit database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSet {
    // model input tables
    pub ages: Vec<AgeRow>,
    pub times: Vec<TimeRow>,
    pub densities: Vec<DensityRow>,
    pub integrands: Vec<IntegrandRow>,
    pub nodes: NodeTree,
    pub subgroups: Vec<SubgroupRow>,
    pub weights: Vec<WeightRow>,
    pub data: Vec<DataRow>,
    pub covariates: Vec<CovariateRow>,
    pub multipliers: Vec<MultiplierRow>,
    pub rates: Vec<RateRow>,
    pub smooths: Vec<SmoothRow>,
    pub smooth_grids: Vec<SmoothGridRow>,
    pub priors: Vec<PriorRow>,
    pub options: Vec<OptionRow>,

    // engine output tables
    pub fit_results: Vec<FitResultRow>,
    pub samples: Vec<PosteriorSampleRow>,
    pub requests: Vec<PredictionRequest>,
    pub predictions: Vec<Prediction>,

    // relocated seed tables, kept out of the live slots so later engine
    // calls cannot clobber them
    pub seed_requests: Vec<PredictionRequest>,
    pub seed_predict_fit: Vec<Prediction>,
    pub seed_predict_sample: Vec<Prediction>,

    pub log: Vec<LogRow>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value.as_str())
    }

    pub fn set_option(&mut self, name: &str, value: &str) {
        match self.options.iter_mut().find(|o| o.name == name) {
            Some(row) => row.value = value.to_string(),
            None => self.options.push(OptionRow {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn parent_node_name(&self) -> Result<&str, LookupError> {
        self.option(PARENT_NODE_OPTION)
            .ok_or_else(|| LookupError::MissingOption {
                name: PARENT_NODE_OPTION.to_string(),
            })
    }

    pub fn parent_node_id(&self) -> Result<NodeId, LookupError> {
        self.nodes.node_id(self.parent_node_name()?)
    }

    pub fn age(&self, id: AgeId) -> Result<f64, LookupError> {
        self.ages
            .get(id)
            .map(|row| row.age)
            .ok_or(LookupError::TableRow { table: "age", id })
    }

    pub fn time(&self, id: TimeId) -> Result<f64, LookupError> {
        self.times
            .get(id)
            .map(|row| row.time)
            .ok_or(LookupError::TableRow { table: "time", id })
    }

    pub fn prior(&self, id: PriorId) -> Result<&PriorRow, LookupError> {
        self.priors
            .get(id)
            .ok_or(LookupError::TableRow { table: "prior", id })
    }

    pub fn smooth(&self, id: SmoothId) -> Result<&SmoothRow, LookupError> {
        self.smooths
            .get(id)
            .ok_or(LookupError::TableRow { table: "smooth", id })
    }

    pub fn integrand_id(&self, name: &str) -> Result<IntegrandId, LookupError> {
        self.integrands
            .iter()
            .position(|row| row.name == name)
            .ok_or_else(|| LookupError::IntegrandName {
                name: name.to_string(),
            })
    }

    pub fn gaussian_density_id(&self) -> Result<DensityId, LookupError> {
        self.densities
            .iter()
            .position(|row| row.kind == DensityKind::Gaussian)
            .ok_or_else(|| LookupError::Density {
                kind: DensityKind::Gaussian.to_string(),
            })
    }

    /// Grid rows belonging to one smoothing, in table order.
    pub fn grid_of(&self, smooth_id: SmoothId) -> impl Iterator<Item = &SmoothGridRow> {
        self.smooth_grids
            .iter()
            .filter(move |g| g.smooth_id == smooth_id)
    }

    pub fn rate(&self, kind: RateKind) -> Option<(RateId, &RateRow)> {
        self.rates
            .iter()
            .enumerate()
            .find(|(_, row)| row.kind == kind)
    }

    /// Id of the rate row for `kind`, inserting a bare row if absent.
    pub fn rate_id_or_insert(&mut self, kind: RateKind) -> RateId {
        match self.rates.iter().position(|row| row.kind == kind) {
            Some(id) => id,
            None => {
                self.rates.push(RateRow::new(kind));
                self.rates.len() - 1
            }
        }
    }

    /// Name of the integrand that measures a covariate multiplier.
    pub fn multiplier_integrand_name(id: MultiplierId) -> String {
        format!("multiplier_{id}")
    }

    pub fn add_log(&mut self, kind: LogKind, message: impl Into<String>) {
        self.log.push(LogRow {
            at: Utc::now(),
            kind,
            message: message.into(),
        });
    }

    /// Clear every engine output table. The seed slots and the log are
    /// deliberately left alone.
    pub fn clear_outputs(&mut self) {
        self.fit_results.clear();
        self.samples.clear();
        self.requests.clear();
        self.predictions.clear();
    }
}
