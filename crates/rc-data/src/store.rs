//! Per-job fit database store.
//!
//! Each job owns exactly one [`FitDatabase`]: the typed table set plus its
//! home on disk. The store is a single JSON document per job directory, so
//! the cascade-specific slots (seed tags, relocated seed tables, the log)
//! round-trip unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use rc_types::{CascadeResult, LogKind, TableSet};

/// File name of the fit database inside its job directory. Fixed, so the
/// job-to-path mapping stays stable across reruns.
pub const FIT_DB_FILE: &str = "fit.json";

/// A per-job persistent store with scoped open/create/save access.
#[derive(Debug)]
pub struct FitDatabase {
    path: PathBuf,
    pub tables: TableSet,
}

impl FitDatabase {
    /// Create a new database from a fully assembled table set.
    ///
    /// The document is written to a temp file and renamed into place, so a
    /// partially written database is never visible at `path`.
    pub fn create(path: impl AsRef<Path>, tables: TableSet) -> CascadeResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = Self { path, tables };
        db.save()?;
        debug!("created fit database at {}", db.path.display());
        Ok(db)
    }

    pub fn open(path: impl AsRef<Path>) -> CascadeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read(&path)?;
        let tables = serde_json::from_slice(&raw)?;
        debug!("opened fit database at {}", path.display());
        Ok(Self { path, tables })
    }

    /// Persist the current table set, replacing the on-disk document.
    pub fn save(&self) -> CascadeResult<()> {
        let raw = serde_json::to_vec_pretty(&self.tables)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_log(&mut self, kind: LogKind, message: impl Into<String>) {
        self.tables.add_log(kind, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_types::{
        AgeRow, DensityKind, DensityRow, Prediction, PredictionRequest, SeedQuantity, SeedTag,
        PARENT_NODE_OPTION,
    };
    use tempfile::tempdir;

    fn sample_tables() -> TableSet {
        let mut tables = TableSet::new();
        tables.ages.push(AgeRow { age: 0.0 });
        tables.ages.push(AgeRow { age: 50.0 });
        tables.densities.push(DensityRow {
            kind: DensityKind::Gaussian,
        });
        let world = tables.nodes.add("world", None);
        tables.nodes.add("europe", Some(world));
        tables.set_option(PARENT_NODE_OPTION, "world");
        tables
    }

    #[test]
    fn roundtrip_preserves_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("world").join(FIT_DB_FILE);

        let db = FitDatabase::create(&path, sample_tables()).unwrap();
        let reopened = FitDatabase::open(db.path()).unwrap();

        assert_eq!(reopened.tables, sample_tables());
    }

    #[test]
    fn create_makes_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join("world")
            .join("europe")
            .join("france")
            .join(FIT_DB_FILE);

        FitDatabase::create(&path, sample_tables()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn seed_slots_survive_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FIT_DB_FILE);

        let mut tables = sample_tables();
        let tag = SeedTag {
            quantity: SeedQuantity::Rate(0),
            node_id: Some(1),
            age_id: 0,
            time_id: 0,
        };
        tables.seed_requests.push(PredictionRequest {
            integrand_id: 0,
            node_id: Some(1),
            subgroup_id: 0,
            weight_id: None,
            age_lower: 0.0,
            age_upper: 0.0,
            time_lower: 2000.0,
            time_upper: 2000.0,
            covariates: vec![None],
            tag,
        });
        tables.seed_predict_fit.push(Prediction {
            request_id: 0,
            sample_index: None,
            value: 0.02,
        });

        FitDatabase::create(&path, tables.clone()).unwrap();
        let reopened = FitDatabase::open(&path).unwrap();

        assert_eq!(reopened.tables.seed_requests[0].tag, tag);
        assert_eq!(reopened.tables.seed_predict_fit, tables.seed_predict_fit);
    }

    #[test]
    fn save_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FIT_DB_FILE);

        let mut db = FitDatabase::create(&path, sample_tables()).unwrap();
        db.tables.set_option("stage", "fitted");
        db.save().unwrap();

        let reopened = FitDatabase::open(&path).unwrap();
        assert_eq!(reopened.tables.option("stage"), Some("fitted"));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
