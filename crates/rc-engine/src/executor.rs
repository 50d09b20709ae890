//! Job executor: one job's full lifecycle.
//!
//! Resolves the job's database, delegates init/fit/sample/predict to the
//! external engine, then fans out child databases through the seed-request
//! builder and the prior propagation engine. Every step is fatal on error;
//! retry policy belongs to the outer scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rc_data::{AllNodeRegistry, DatabaseLayout, FitDatabase};
use rc_types::{
    CascadeResult, ChildPlan, ConfigError, ConsistencyError, FitEngine, IntegrandId, Job, JobId,
    JobTable, LogKind, LookupError, NodeId, NodeTree, PerturbTarget, PredictSource, RateKind,
    RefitMode, SampleMethod, SmoothGridRow, SmoothRow, TableSet, VarTable,
    SIMULATE_SAMPLE_CEILING,
};

use crate::propagate::{self, ChildTarget};
use crate::seed;

/// What a completed job hands back to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub database: PathBuf,
    pub children: Vec<ChildPlan>,
}

/// Executes jobs against one registry, node tree and engine.
pub struct JobExecutor {
    registry: Arc<AllNodeRegistry>,
    tree: Arc<NodeTree>,
    layout: DatabaseLayout,
    engine: Box<dyn FitEngine>,
}

impl JobExecutor {
    /// Build an executor for one run. The database layout is derived from
    /// the registry's settings and the shared node tree.
    pub fn new(
        registry: Arc<AllNodeRegistry>,
        tree: Arc<NodeTree>,
        engine: Box<dyn FitEngine>,
    ) -> CascadeResult<Self> {
        let options = registry.options();
        let root_node_id = tree.node_id(&options.root_node_name)?;
        let root_split_id = match &options.root_split_name {
            None => None,
            Some(name) => Some(registry.split_table().split_id(name)?),
        };
        let layout = DatabaseLayout::new(
            &options.result_dir,
            tree.clone(),
            registry.split_table().clone(),
            registry.split_enabled_nodes().clone(),
            root_node_id,
            root_split_id,
        )?;
        Ok(Self {
            registry,
            tree,
            layout,
            engine,
        })
    }

    pub fn layout(&self) -> &DatabaseLayout {
        &self.layout
    }

    /// Run one job start to finish: prepare its database, delegate the
    /// fit/sample/predict sequence, then seed every refit child.
    pub fn run_job(
        &self,
        jobs: &JobTable,
        job_id: JobId,
        first_fit: bool,
    ) -> CascadeResult<JobOutcome> {
        let job = jobs.get(job_id).ok_or(LookupError::TableRow {
            table: "job",
            id: job_id,
        })?;
        let node_name = self.tree.name(job.node_id)?.to_string();
        info!("job {job_id}: fitting {node_name}");

        // resolve and open this job's own database; the recorded parent
        // node must be the node this job fits
        let db_path = self.layout.resolve_db(job.node_id, job.split_id)?;
        let mut db = FitDatabase::open(&db_path)?;
        let recorded = db.tables.parent_node_name()?;
        if recorded != node_name {
            return Err(ConsistencyError::ParentNodeMismatch {
                expected: node_name,
                found: recorded.to_string(),
            }
            .into());
        }

        // the first fit of a lineage starts from a clean log and the
        // externally supplied background-rate constraint
        if first_fit {
            db.tables.log.clear();
            if self.install_background_constraint(&mut db.tables, job.node_id)? {
                db.add_log(LogKind::Note, "installed background rate constraint");
            }
        }

        let options = self.registry.options();

        self.engine.init(&mut db.tables)?;
        db.add_log(LogKind::Command, "init");

        if let Some(max_fit) = options.max_fit {
            // frozen-multiplier jobs keep twice as much data
            let max_fit = if self.registry.is_frozen(job.node_id, job.split_id) {
                2 * max_fit
            } else {
                max_fit
            };
            for integrand_id in fit_integrands(&db.tables) {
                let name = db.tables.integrands[integrand_id].name.clone();
                self.engine
                    .hold_out(&mut db.tables, &name, max_fit, options.balance.as_ref())?;
                db.add_log(LogKind::Command, format!("hold_out {name} {max_fit}"));
            }
        }

        if let Some(bound) = options.max_covariate_effect {
            self.engine.bound_covariate_effect(&mut db.tables, bound)?;
            db.add_log(
                LogKind::Command,
                format!("bound_covariate_effect {bound}"),
            );
        }

        for (target, sigma) in [
            (PerturbTarget::StartValues, options.perturb_start_sigma),
            (PerturbTarget::ScaleValues, options.perturb_scale_sigma),
        ] {
            if let Some(sigma) = sigma {
                if sigma < 0.0 {
                    return Err(ConfigError::NegativeSigma {
                        setting: target.as_str().to_string(),
                        sigma,
                    }
                    .into());
                }
                self.engine.perturb(&mut db.tables, target, sigma)?;
                db.add_log(
                    LogKind::Command,
                    format!("perturb {} {sigma}", target.as_str()),
                );
            }
        }

        self.engine.fit(&mut db.tables, job.fit_kind)?;
        db.add_log(LogKind::Command, format!("fit {}", job.fit_kind.as_str()));

        let count = options.sample_count;
        if options.sample_method == SampleMethod::Simulate {
            if count > SIMULATE_SAMPLE_CEILING {
                return Err(ConfigError::SampleCountTooLarge {
                    requested: count,
                    ceiling: SIMULATE_SAMPLE_CEILING,
                }
                .into());
            }
            self.engine
                .set(&mut db.tables, VarTable::Truth, VarTable::Fit)?;
            self.engine.simulate(&mut db.tables, count)?;
            db.add_log(LogKind::Command, format!("simulate {count}"));
        }
        self.engine
            .sample(&mut db.tables, options.sample_method, job.fit_kind, count)?;
        db.add_log(
            LogKind::Command,
            format!("sample {} {count}", options.sample_method),
        );

        let request_count = seed::build_seed_requests(&mut db.tables, &self.registry)?;
        db.add_log(LogKind::Note, format!("built {request_count} seed requests"));

        // predict at the point estimate and at every sample, then relocate
        // all three tables so later steps cannot clobber the seed data
        self.engine
            .predict(&mut db.tables, PredictSource::FitResult)?;
        db.tables.seed_predict_fit = std::mem::take(&mut db.tables.predictions);
        self.engine.predict(&mut db.tables, PredictSource::Samples)?;
        db.tables.seed_predict_sample = std::mem::take(&mut db.tables.predictions);
        db.tables.seed_requests = std::mem::take(&mut db.tables.requests);
        db.add_log(LogKind::Command, "predict");

        let children = self.plan_children(jobs, job)?;

        let targets: Vec<ChildTarget> = children
            .iter()
            .filter(|plan| plan.mode == RefitMode::Refit)
            .map(|plan| {
                Ok(ChildTarget {
                    node_id: plan.node_id,
                    name: self.tree.name(plan.node_id)?.to_string(),
                    database: plan.database.clone(),
                })
            })
            .collect::<CascadeResult<_>>()?;
        propagate::create_child_databases(&db.tables, &self.registry, &targets)?;

        // clean terminal state: the live request slot stays empty
        db.tables.requests.clear();
        db.save()?;

        info!(
            "job {job_id}: completed, {} children ({} refit)",
            children.len(),
            targets.len()
        );
        Ok(JobOutcome {
            job_id,
            database: db_path,
            children,
        })
    }

    /// Resolve every child job's target path and decide whether it refits.
    fn plan_children(&self, jobs: &JobTable, job: &Job) -> CascadeResult<Vec<ChildPlan>> {
        let refit_split = self.registry.options().refit_split;
        let mut plans = Vec::new();
        for child_id in job.child_range() {
            let child = jobs.get(child_id).ok_or(LookupError::TableRow {
                table: "job",
                id: child_id,
            })?;
            let database = self.layout.resolve_db(child.node_id, child.split_id)?;
            let mode = if !refit_split && child.split_id != job.split_id {
                RefitMode::ReuseParentFit
            } else {
                RefitMode::Refit
            };
            debug!(
                "job child {child_id}: node {} mode {mode:?}",
                child.node_id
            );
            plans.push(ChildPlan {
                job_id: child_id,
                node_id: child.node_id,
                split_id: child.split_id,
                database,
                mode,
            });
        }
        Ok(plans)
    }

    /// Install the registry's background-rate constraint as a
    /// constant-valued smoothing on the background rate. Returns false when
    /// the registry carries no grid for this node.
    fn install_background_constraint(
        &self,
        tables: &mut TableSet,
        node_id: NodeId,
    ) -> CascadeResult<bool> {
        let rows = self.registry.background_rates_for(node_id);
        if rows.is_empty() {
            return Ok(false);
        }
        let smooth_id = tables.smooths.len();
        let name = format!("background_constraint_{}", self.tree.name(node_id)?);
        tables.smooths.push(SmoothRow::new(&name));
        for row in rows {
            // the referenced grid points must exist in this database
            tables.age(row.age_id)?;
            tables.time(row.time_id)?;
            tables.smooth_grids.push(SmoothGridRow {
                smooth_id,
                age_id: row.age_id,
                time_id: row.time_id,
                value_prior: None,
                age_diff_prior: None,
                time_diff_prior: None,
                const_value: Some(row.rate),
            });
        }
        let rate_id = tables.rate_id_or_insert(RateKind::BackgroundMortality);
        tables.rates[rate_id].parent_smooth_id = Some(smooth_id);
        tables.rates[rate_id].child_smooth_id = None;
        Ok(true)
    }
}

/// Distinct integrands with held-in data, in id order.
fn fit_integrands(tables: &TableSet) -> Vec<IntegrandId> {
    let mut ids: Vec<IntegrandId> = tables
        .data
        .iter()
        .filter(|row| !row.hold_out)
        .map(|row| row.integrand_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
