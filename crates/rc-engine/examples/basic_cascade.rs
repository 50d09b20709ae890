//! End-to-end toy cascade: a world with two child regions, one covariate
//! and one fitted rate, driven by the simulated engine.
//!
//! Run with `cargo run -p rc-engine --example basic_cascade`.

use std::fs;
use std::sync::Arc;

use anyhow::Result;

use rc_data::{
    AllNodeRegistry, CovariateReferenceRow, FitDatabase, RegistryTables, FIT_DB_FILE,
};
use rc_engine::{CascadeRunner, JobExecutor, SimulatedEngine};
use rc_types::{
    AgeRow, CovariateRow, DataRow, DensityKind, DensityRow, FitKind, IntegrandRow, Job, JobTable,
    NodeTree, PriorRow, RateKind, RateRow, SmoothGridRow, SmoothRow, TableSet, TimeRow,
    PARENT_NODE_OPTION,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let base_dir = std::env::temp_dir().join("rate-cascade-demo");
    if base_dir.exists() {
        fs::remove_dir_all(&base_dir)?;
    }
    fs::create_dir_all(&base_dir)?;
    let result_dir = base_dir.join("results");

    // node hierarchy: world -> { north, south }
    let mut tree = NodeTree::new();
    let world = tree.add("world", None);
    tree.add("north", Some(world));
    tree.add("south", Some(world));
    let tree = Arc::new(tree);

    // all-node registry with per-child covariate references
    let registry_path = base_dir.join("all_node.duckdb");
    AllNodeRegistry::create(
        &registry_path,
        &RegistryTables {
            settings: vec![
                (
                    "result_dir".to_string(),
                    result_dir.display().to_string(),
                ),
                ("root_node_name".to_string(), "world".to_string()),
                ("sample_count".to_string(), "10".to_string()),
                ("max_fit".to_string(), "500".to_string()),
            ],
            covariate_references: vec![
                CovariateReferenceRow {
                    node_id: 1,
                    covariate: "income".to_string(),
                    reference: 2.5,
                },
                CovariateReferenceRow {
                    node_id: 2,
                    covariate: "income".to_string(),
                    reference: 1.5,
                },
            ],
            ..Default::default()
        },
    )?;
    let registry = Arc::new(AllNodeRegistry::open(&registry_path)?);

    // root fit database: incidence on a 2x2 age-time grid
    let mut tables = TableSet::new();
    tables.nodes = tree.as_ref().clone();
    for age in [0.0, 50.0] {
        tables.ages.push(AgeRow { age });
    }
    for time in [1990.0, 2010.0] {
        tables.times.push(TimeRow { time });
    }
    tables.densities.push(DensityRow {
        kind: DensityKind::Uniform,
    });
    tables.densities.push(DensityRow {
        kind: DensityKind::Gaussian,
    });
    tables.integrands.push(IntegrandRow::new("incidence"));
    tables.covariates.push(CovariateRow {
        name: "income".to_string(),
        reference: 2.0,
        max_difference: None,
    });
    tables.priors.push(PriorRow {
        name: "incidence_value".to_string(),
        density_id: 0,
        lower: Some(0.0),
        upper: Some(1.0),
        mean: 0.03,
        std: None,
        eta: None,
        nu: None,
    });
    tables.smooths.push(SmoothRow::new("incidence_parent"));
    for (age_id, time_id) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
        tables.smooth_grids.push(SmoothGridRow {
            smooth_id: 0,
            age_id,
            time_id,
            value_prior: Some(0),
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
    for node_id in [1, 2] {
        tables.data.push(DataRow {
            integrand_id: 0,
            node_id,
            density_id: 1,
            hold_out: false,
            age_lower: 0.0,
            age_upper: 50.0,
            time_lower: 1990.0,
            time_upper: 2010.0,
            mean: 0.031,
            std: 0.005,
            covariates: vec![Some(2.0)],
        });
    }
    tables.set_option(PARENT_NODE_OPTION, "world");
    FitDatabase::create(result_dir.join("world").join(FIT_DB_FILE), tables)?;

    // job forest: the world fits both effects, each child fixed effects
    let mut jobs = JobTable::new();
    jobs.push(Job::new(0, None, FitKind::Both).with_children(1, 3));
    jobs.push(Job::new(1, None, FitKind::Fixed));
    jobs.push(Job::new(2, None, FitKind::Fixed));

    let executor = JobExecutor::new(
        registry,
        tree,
        Box::new(SimulatedEngine::with_noise(0.002)),
    )?;
    let runner = CascadeRunner::new(executor, 2);
    let report = runner.run(&jobs, 0)?;

    println!(
        "run {}: {} completed, {} failed",
        report.run_id,
        report.completed.len(),
        report.failed.len()
    );
    for (job_id, error) in &report.failed {
        println!("  job {job_id} failed: {error}");
    }

    let north = FitDatabase::open(result_dir.join("world").join("north").join(FIT_DB_FILE))?;
    println!(
        "north database fits {} with covariate reference {}",
        north.tables.parent_node_name()?,
        north.tables.covariates[0].reference
    );
    Ok(())
}
