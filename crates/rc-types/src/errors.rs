use thiserror::Error;

/// Main error type for the RateCascade system
#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Fit engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Malformed or out-of-range configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("perturbation sigma for {setting} is negative: {sigma}")]
    NegativeSigma { setting: String, sigma: f64 },

    #[error("simulate replicate count {requested} exceeds the ceiling of {ceiling}")]
    SampleCountTooLarge { requested: usize, ceiling: usize },

    #[error("balance spec is not 'covariate value value': {value}")]
    MalformedBalance { value: String },

    #[error("a balance spec is configured but max_fit is not")]
    BalanceWithoutMaxFit,

    #[error("invalid value for setting {name}: {value}")]
    InvalidSetting { name: String, value: String },

    #[error("required setting is missing: {name}")]
    MissingSetting { name: String },
}

/// A database or table contradicts what the cascade expects
#[derive(Error, Debug)]
pub enum ConsistencyError {
    #[error("database records parent node {found}, expected {expected}")]
    ParentNodeMismatch { expected: String, found: String },

    #[error("node {node} is not a descendant of {root}")]
    NotADescendant { node: String, root: String },

    #[error("job split {split} differs from the root split but no split-enabled node lies on the path to {node}")]
    SplitNotOnPath { node: String, split: String },

    #[error("split name {name} collides with a node name; layout would not be injective")]
    AmbiguousLayout { name: String },

    #[error("duplicate seed key: {key}")]
    DuplicateSeedKey { key: String },

    #[error("no point estimate or samples for seed key: {key}")]
    MissingSeedKey { key: String },

    #[error("smoothing {smoothing} carries a grid-level std-scale prior, which propagation does not support")]
    GridScalePrior { smoothing: String },

    #[error("multiplier {multiplier} carries a subgroup-level smoothing, which propagation does not support")]
    SubgroupSmoothing { multiplier: usize },

    #[error("node {node} is not a child of fit node {parent}")]
    NotAChild { node: String, parent: String },

    #[error("malformed job table: {message}")]
    InvalidJobTable { message: String },
}

/// A named row or reference value that should exist does not
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("no covariate reference for covariate {covariate} at node {node}")]
    CovariateReference { node: String, covariate: String },

    #[error("unknown node name: {name}")]
    NodeName { name: String },

    #[error("unknown split reference name: {name}")]
    SplitName { name: String },

    #[error("unknown integrand name: {name}")]
    IntegrandName { name: String },

    #[error("no density row with kind {kind}")]
    Density { kind: String },

    #[error("{table} table has no row {id}")]
    TableRow { table: &'static str, id: usize },

    #[error("option table has no row named {name}")]
    MissingOption { name: String },
}

/// A delegated external-engine operation failed
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("engine does not support command {command}")]
    Unsupported { command: String },
}

/// Registry store access failed
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("registry database error: {message}")]
    Database { message: String },

    #[error("registry contents are malformed: {message}")]
    Malformed { message: String },
}

/// Result type alias for RateCascade operations
pub type CascadeResult<T> = Result<T, CascadeError>;
