//! All-node registry: shared configuration and per-node reference data.
//!
//! The registry lives in an embedded DuckDB file, is written once by
//! upstream tooling ([`AllNodeRegistry::create`]) and loaded once per run
//! into typed read-only state. After loading there is no database handle to
//! contend over, so any number of jobs can read it concurrently.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use rc_types::{
    AgeId, BalanceSpec, CascadeResult, ConfigError, NodeId, SampleMethod, SplitId, SplitTable,
    StoreError, TimeId, SIMULATE_SAMPLE_CEILING,
};

fn store_err(error: duckdb::Error) -> StoreError {
    StoreError::Database {
        message: error.to_string(),
    }
}

/// Typed view of the registry's key/value settings, validated at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryOptions {
    pub result_dir: PathBuf,
    pub root_node_name: String,
    pub root_split_name: Option<String>,
    pub sample_method: SampleMethod,
    pub sample_count: usize,
    pub refit_split: bool,
    pub max_fit: Option<usize>,
    pub max_covariate_effect: Option<f64>,
    pub balance: Option<BalanceSpec>,
    pub perturb_start_sigma: Option<f64>,
    pub perturb_scale_sigma: Option<f64>,
}

impl RegistryOptions {
    /// Parse and validate the raw key/value rows.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        let required = |name: &str| {
            get(name).ok_or_else(|| ConfigError::MissingSetting {
                name: name.to_string(),
            })
        };
        let invalid = |name: &str, value: &str| ConfigError::InvalidSetting {
            name: name.to_string(),
            value: value.to_string(),
        };

        let result_dir = PathBuf::from(required("result_dir")?);
        let root_node_name = required("root_node_name")?.to_string();
        let root_split_name = get("root_split_name").map(str::to_string);

        let sample_method = match get("sample_method") {
            None => SampleMethod::Asymptotic,
            Some(value) => {
                SampleMethod::parse(value).ok_or_else(|| invalid("sample_method", value))?
            }
        };

        let sample_count = match get("sample_count") {
            None => 20,
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| invalid("sample_count", value))?,
        };
        if sample_method == SampleMethod::Simulate && sample_count > SIMULATE_SAMPLE_CEILING {
            return Err(ConfigError::SampleCountTooLarge {
                requested: sample_count,
                ceiling: SIMULATE_SAMPLE_CEILING,
            });
        }

        let refit_split = match get("refit_split") {
            None => false,
            Some("true") => true,
            Some("false") => false,
            Some(value) => return Err(invalid("refit_split", value)),
        };

        let max_fit = match get("max_fit") {
            None => None,
            Some(value) => Some(
                value
                    .parse::<usize>()
                    .map_err(|_| invalid("max_fit", value))?,
            ),
        };

        let max_covariate_effect = match get("max_covariate_effect") {
            None => None,
            Some(value) => Some(
                value
                    .parse::<f64>()
                    .map_err(|_| invalid("max_covariate_effect", value))?,
            ),
        };

        let balance = match get("balance_fit") {
            None => None,
            Some(value) => Some(BalanceSpec::parse(value)?),
        };
        if balance.is_some() && max_fit.is_none() {
            return Err(ConfigError::BalanceWithoutMaxFit);
        }

        // Zero sigma means no perturbation at all.
        let sigma = |name: &str| -> Result<Option<f64>, ConfigError> {
            match get(name) {
                None => Ok(None),
                Some(value) => {
                    let sigma = value.parse::<f64>().map_err(|_| invalid(name, value))?;
                    if sigma < 0.0 {
                        Err(ConfigError::NegativeSigma {
                            setting: name.to_string(),
                            sigma,
                        })
                    } else if sigma == 0.0 {
                        Ok(None)
                    } else {
                        Ok(Some(sigma))
                    }
                }
            }
        };
        let perturb_start_sigma = sigma("perturb_start_sigma")?;
        let perturb_scale_sigma = sigma("perturb_scale_sigma")?;

        Ok(Self {
            result_dir,
            root_node_name,
            root_split_name,
            sample_method,
            sample_count,
            refit_split,
            max_fit,
            max_covariate_effect,
            balance,
            perturb_start_sigma,
            perturb_scale_sigma,
        })
    }
}

/// One per-node covariate reference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateReferenceRow {
    pub node_id: NodeId,
    pub covariate: String,
    pub reference: f64,
}

/// One grid point of a node's background-rate constraint. Age/time ids
/// refer to the shared age and time tables of the root database.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundRateRow {
    pub node_id: NodeId,
    pub age_id: AgeId,
    pub time_id: TimeId,
    pub rate: f64,
}

/// Typed input to [`AllNodeRegistry::create`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryTables {
    pub settings: Vec<(String, String)>,
    pub splits: SplitTable,
    pub split_nodes: Vec<NodeId>,
    pub frozen_multipliers: Vec<(NodeId, SplitId)>,
    pub covariate_references: Vec<CovariateReferenceRow>,
    pub background_rates: Vec<BackgroundRateRow>,
}

/// Process-wide, read-only registry state for one cascade run.
#[derive(Debug)]
pub struct AllNodeRegistry {
    options: RegistryOptions,
    splits: SplitTable,
    split_nodes: HashSet<NodeId>,
    frozen_multipliers: HashSet<(NodeId, SplitId)>,
    covariate_references: HashMap<(NodeId, String), f64>,
    background_rates: Vec<BackgroundRateRow>,
}

impl AllNodeRegistry {
    /// Materialize a registry store from typed tables.
    pub fn create(path: impl AsRef<Path>, tables: &RegistryTables) -> CascadeResult<()> {
        let connection = Connection::open(path.as_ref()).map_err(store_err)?;
        connection
            .execute_batch(
                "CREATE TABLE setting (
                    name TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE split_reference (
                    split_id BIGINT PRIMARY KEY,
                    split_name TEXT NOT NULL,
                    covariate_value DOUBLE NOT NULL
                );
                CREATE TABLE split_node (
                    node_id BIGINT PRIMARY KEY
                );
                CREATE TABLE frozen_multiplier (
                    node_id BIGINT NOT NULL,
                    split_id BIGINT NOT NULL
                );
                CREATE TABLE covariate_reference (
                    node_id BIGINT NOT NULL,
                    covariate_name TEXT NOT NULL,
                    reference DOUBLE NOT NULL
                );
                CREATE TABLE background_rate (
                    node_id BIGINT NOT NULL,
                    age_id BIGINT NOT NULL,
                    time_id BIGINT NOT NULL,
                    rate DOUBLE NOT NULL
                );",
            )
            .map_err(store_err)?;

        let mut insert = connection
            .prepare("INSERT INTO setting (name, value) VALUES (?, ?)")
            .map_err(store_err)?;
        for (name, value) in &tables.settings {
            insert.execute(params![name, value]).map_err(store_err)?;
        }

        let mut insert = connection
            .prepare(
                "INSERT INTO split_reference (split_id, split_name, covariate_value)
                 VALUES (?, ?, ?)",
            )
            .map_err(store_err)?;
        for (split_id, split) in tables.splits.iter() {
            insert
                .execute(params![split_id as i64, split.name, split.covariate_value])
                .map_err(store_err)?;
        }

        let mut insert = connection
            .prepare("INSERT INTO split_node (node_id) VALUES (?)")
            .map_err(store_err)?;
        for &node_id in &tables.split_nodes {
            insert.execute(params![node_id as i64]).map_err(store_err)?;
        }

        let mut insert = connection
            .prepare("INSERT INTO frozen_multiplier (node_id, split_id) VALUES (?, ?)")
            .map_err(store_err)?;
        for &(node_id, split_id) in &tables.frozen_multipliers {
            insert
                .execute(params![node_id as i64, split_id as i64])
                .map_err(store_err)?;
        }

        let mut insert = connection
            .prepare(
                "INSERT INTO covariate_reference (node_id, covariate_name, reference)
                 VALUES (?, ?, ?)",
            )
            .map_err(store_err)?;
        for row in &tables.covariate_references {
            insert
                .execute(params![row.node_id as i64, row.covariate, row.reference])
                .map_err(store_err)?;
        }

        let mut insert = connection
            .prepare(
                "INSERT INTO background_rate (node_id, age_id, time_id, rate)
                 VALUES (?, ?, ?, ?)",
            )
            .map_err(store_err)?;
        for row in &tables.background_rates {
            insert
                .execute(params![
                    row.node_id as i64,
                    row.age_id as i64,
                    row.time_id as i64,
                    row.rate
                ])
                .map_err(store_err)?;
        }

        info!("created all-node registry at {}", path.as_ref().display());
        Ok(())
    }

    /// Load a registry store into typed read-only state.
    pub fn open(path: impl AsRef<Path>) -> CascadeResult<Self> {
        let connection = Connection::open(path.as_ref()).map_err(store_err)?;
        let mut tables = RegistryTables::default();

        let mut stmt = connection
            .prepare("SELECT name, value FROM setting")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(store_err)?;
        for row in rows {
            tables.settings.push(row.map_err(store_err)?);
        }

        let mut stmt = connection
            .prepare(
                "SELECT split_name, covariate_value FROM split_reference ORDER BY split_id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(store_err)?;
        for row in rows {
            let (name, covariate_value) = row.map_err(store_err)?;
            tables.splits.add(&name, covariate_value);
        }

        let mut stmt = connection
            .prepare("SELECT node_id FROM split_node")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(store_err)?;
        for row in rows {
            tables.split_nodes.push(row.map_err(store_err)? as NodeId);
        }

        let mut stmt = connection
            .prepare("SELECT node_id, split_id FROM frozen_multiplier")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(store_err)?;
        for row in rows {
            let (node_id, split_id) = row.map_err(store_err)?;
            tables
                .frozen_multipliers
                .push((node_id as NodeId, split_id as SplitId));
        }

        let mut stmt = connection
            .prepare("SELECT node_id, covariate_name, reference FROM covariate_reference")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CovariateReferenceRow {
                    node_id: row.get::<_, i64>(0)? as NodeId,
                    covariate: row.get(1)?,
                    reference: row.get(2)?,
                })
            })
            .map_err(store_err)?;
        for row in rows {
            tables.covariate_references.push(row.map_err(store_err)?);
        }

        let mut stmt = connection
            .prepare("SELECT node_id, age_id, time_id, rate FROM background_rate")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BackgroundRateRow {
                    node_id: row.get::<_, i64>(0)? as NodeId,
                    age_id: row.get::<_, i64>(1)? as AgeId,
                    time_id: row.get::<_, i64>(2)? as TimeId,
                    rate: row.get(3)?,
                })
            })
            .map_err(store_err)?;
        for row in rows {
            tables.background_rates.push(row.map_err(store_err)?);
        }

        let registry = Self::from_tables(&tables)?;
        info!(
            "loaded all-node registry from {} ({} splits, {} covariate references)",
            path.as_ref().display(),
            registry.splits.len(),
            registry.covariate_references.len(),
        );
        Ok(registry)
    }

    /// Build registry state directly from typed tables, skipping the store.
    pub fn from_tables(tables: &RegistryTables) -> CascadeResult<Self> {
        let options = RegistryOptions::from_pairs(&tables.settings)?;
        Ok(Self {
            options,
            splits: tables.splits.clone(),
            split_nodes: tables.split_nodes.iter().copied().collect(),
            frozen_multipliers: tables.frozen_multipliers.iter().copied().collect(),
            covariate_references: tables
                .covariate_references
                .iter()
                .map(|row| ((row.node_id, row.covariate.clone()), row.reference))
                .collect(),
            background_rates: tables.background_rates.clone(),
        })
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn split_table(&self) -> &SplitTable {
        &self.splits
    }

    pub fn split_enabled_nodes(&self) -> &HashSet<NodeId> {
        &self.split_nodes
    }

    /// Whether this (node, split) pair has its covariate multipliers frozen
    /// across refits.
    pub fn is_frozen(&self, node_id: NodeId, split_id: Option<SplitId>) -> bool {
        match split_id {
            Some(split_id) => self.frozen_multipliers.contains(&(node_id, split_id)),
            None => false,
        }
    }

    pub fn covariate_reference(&self, node_id: NodeId, covariate: &str) -> Option<f64> {
        self.covariate_references
            .get(&(node_id, covariate.to_string()))
            .copied()
    }

    /// Background-rate constraint grid for one node; empty when the node
    /// has none.
    pub fn background_rates_for(&self, node_id: NodeId) -> Vec<&BackgroundRateRow> {
        self.background_rates
            .iter()
            .filter(|row| row.node_id == node_id)
            .collect()
    }
}
