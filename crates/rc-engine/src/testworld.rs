//! Shared test fixtures: a three-node world with one covariate, one primary
//! rate and one covariate multiplier.

use std::path::Path;
use std::sync::Arc;

use rc_data::{
    AllNodeRegistry, BackgroundRateRow, CovariateReferenceRow, FitDatabase, RegistryTables,
    FIT_DB_FILE,
};
use rc_types::{
    AgeRow, CovariateRow, DataRow, DensityKind, DensityRow, FitKind, IntegrandRow, Job, JobTable,
    MultiplierKind, MultiplierRow, NodeTree, PriorRow, RateKind, RateRow, SmoothGridRow, SmoothRow,
    TableSet, TimeRow, PARENT_NODE_OPTION,
};

pub const CHILD_A_INCOME: f64 = 2.5;
pub const CHILD_B_INCOME: f64 = 1.5;
pub const RATE_PRIOR_MEAN: f64 = 0.02;

pub fn tree() -> NodeTree {
    let mut tree = NodeTree::new();
    let world = tree.add("world", None);
    tree.add("child_a", Some(world));
    tree.add("child_b", Some(world));
    tree
}

pub fn registry_tables() -> RegistryTables {
    registry_tables_at("/results")
}

pub fn registry_tables_at(result_dir: impl AsRef<Path>) -> RegistryTables {
    RegistryTables {
        settings: vec![
            (
                "result_dir".to_string(),
                result_dir.as_ref().display().to_string(),
            ),
            ("root_node_name".to_string(), "world".to_string()),
            ("sample_count".to_string(), "4".to_string()),
        ],
        splits: Default::default(),
        split_nodes: vec![],
        frozen_multipliers: vec![],
        covariate_references: vec![
            CovariateReferenceRow {
                node_id: 1,
                covariate: "income".to_string(),
                reference: CHILD_A_INCOME,
            },
            CovariateReferenceRow {
                node_id: 2,
                covariate: "income".to_string(),
                reference: CHILD_B_INCOME,
            },
        ],
        background_rates: vec![
            BackgroundRateRow {
                node_id: 0,
                age_id: 0,
                time_id: 0,
                rate: 0.01,
            },
            BackgroundRateRow {
                node_id: 0,
                age_id: 1,
                time_id: 1,
                rate: 0.015,
            },
        ],
    }
}

pub fn registry() -> AllNodeRegistry {
    AllNodeRegistry::from_tables(&registry_tables()).unwrap()
}

/// The root fit database's input tables: incidence with a 2-point parent
/// smoothing, an income multiplier with a 3-point group smoothing, and a
/// remission rate with no smoothing at all.
pub fn root_tables() -> TableSet {
    let mut tables = TableSet::new();
    tables.ages.push(AgeRow { age: 0.0 });
    tables.ages.push(AgeRow { age: 10.0 });
    tables.times.push(TimeRow { time: 1995.0 });
    tables.times.push(TimeRow { time: 2000.0 });
    tables.densities.push(DensityRow {
        kind: DensityKind::Uniform,
    });
    tables.densities.push(DensityRow {
        kind: DensityKind::Gaussian,
    });
    tables.integrands.push(IntegrandRow::new("incidence"));
    tables.integrands.push(IntegrandRow::new("multiplier_0"));
    tables.nodes = tree();
    tables.covariates.push(CovariateRow {
        name: "income".to_string(),
        reference: 2.0,
        max_difference: None,
    });

    // priors
    tables.priors.push(PriorRow {
        name: "incidence_value".to_string(),
        density_id: 0,
        lower: Some(0.0),
        upper: Some(1.0),
        mean: RATE_PRIOR_MEAN,
        std: None,
        eta: None,
        nu: None,
    });
    tables.priors.push(PriorRow {
        name: "incidence_dage".to_string(),
        density_id: 1,
        lower: None,
        upper: None,
        mean: 0.0,
        std: Some(0.1),
        eta: None,
        nu: None,
    });
    tables.priors.push(PriorRow {
        name: "incidence_dtime".to_string(),
        density_id: 1,
        lower: None,
        upper: None,
        mean: 0.0,
        std: Some(0.1),
        eta: None,
        nu: None,
    });
    tables.priors.push(PriorRow {
        name: "income_effect_value".to_string(),
        density_id: 0,
        lower: Some(-2.0),
        upper: Some(2.0),
        mean: 0.1,
        std: None,
        eta: None,
        nu: None,
    });

    // smoothings: 0 = incidence parent grid (2 points), 1 = income effect
    // grid (3 points)
    tables.smooths.push(SmoothRow::new("incidence_parent"));
    tables.smooths.push(SmoothRow::new("income_effect"));
    tables.smooth_grids.push(SmoothGridRow {
        smooth_id: 0,
        age_id: 0,
        time_id: 0,
        value_prior: Some(0),
        age_diff_prior: Some(1),
        time_diff_prior: Some(2),
        const_value: None,
    });
    tables.smooth_grids.push(SmoothGridRow {
        smooth_id: 0,
        age_id: 1,
        time_id: 1,
        value_prior: Some(0),
        age_diff_prior: None,
        time_diff_prior: None,
        const_value: None,
    });
    for (age_id, time_id) in [(0, 0), (1, 0), (1, 1)] {
        tables.smooth_grids.push(SmoothGridRow {
            smooth_id: 1,
            age_id,
            time_id,
            value_prior: Some(3),
            age_diff_prior: None,
            time_diff_prior: None,
            const_value: None,
        });
    }

    tables.rates.push(RateRow {
        kind: RateKind::Incidence,
        parent_smooth_id: Some(0),
        child_smooth_id: None,
    });
    tables.rates.push(RateRow::new(RateKind::Remission));
    tables.multipliers.push(MultiplierRow {
        kind: MultiplierKind::RateValue,
        covariate_id: 0,
        rate_id: Some(0),
        integrand_id: None,
        group_smooth_id: Some(1),
        subgroup_smooth_id: None,
    });

    for node_id in [1, 2] {
        tables.data.push(DataRow {
            integrand_id: 0,
            node_id,
            density_id: 1,
            hold_out: false,
            age_lower: 0.0,
            age_upper: 10.0,
            time_lower: 1995.0,
            time_upper: 2000.0,
            mean: 0.021,
            std: 0.004,
            covariates: vec![Some(2.0)],
        });
    }

    tables.set_option(PARENT_NODE_OPTION, "world");
    tables
}

/// Jobs: world fits both effects, each child then fits fixed effects.
pub fn job_table() -> JobTable {
    let mut jobs = JobTable::new();
    jobs.push(Job::new(0, None, FitKind::Both).with_children(1, 3));
    jobs.push(Job::new(1, None, FitKind::Fixed));
    jobs.push(Job::new(2, None, FitKind::Fixed));
    jobs
}

/// Materialize the root database under `result_dir` and return the shared
/// run state.
pub fn create_world(result_dir: impl AsRef<Path>) -> (Arc<NodeTree>, Arc<AllNodeRegistry>, JobTable) {
    let result_dir = result_dir.as_ref();
    let registry =
        Arc::new(AllNodeRegistry::from_tables(&registry_tables_at(result_dir)).unwrap());
    let tables = root_tables();
    let tree = Arc::new(tables.nodes.clone());
    FitDatabase::create(result_dir.join("world").join(FIT_DB_FILE), tables).unwrap();
    (tree, registry, job_table())
}
