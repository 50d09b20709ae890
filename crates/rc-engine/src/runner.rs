//! Cascade runner: a worker pool over the job forest.
//!
//! The only ordering constraint is parent-before-child: a job is dispatched
//! once its parent has completed and written its seed database, so jobs at
//! the same depth run concurrently. A failed job's subtree is never
//! dispatched; retry policy belongs to the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::unbounded;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use rc_types::{
    CascadeResult, JobId, JobRun, JobTable, LookupError, RefitMode,
};

use crate::executor::{JobExecutor, JobOutcome};

/// Aggregate counters, updated as jobs finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStats {
    pub completed: usize,
    pub failed: usize,
    pub reused: usize,
}

/// Final report for one cascade run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeReport {
    pub run_id: Uuid,
    /// Jobs that completed, in completion order.
    pub completed: Vec<JobId>,
    pub failed: Vec<(JobId, String)>,
    /// Children marked reuse-parent-fit; never dispatched.
    pub reused: Vec<JobId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct CascadeRunner {
    executor: Arc<JobExecutor>,
    workers: usize,
    status: Arc<DashMap<JobId, JobRun>>,
    stats: Arc<RwLock<RunnerStats>>,
}

impl CascadeRunner {
    pub fn new(executor: JobExecutor, workers: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            workers: workers.max(1),
            status: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(RunnerStats::default())),
        }
    }

    /// Live per-job run records, observable while `run` is in flight.
    pub fn status(&self) -> Arc<DashMap<JobId, JobRun>> {
        self.status.clone()
    }

    pub fn stats(&self) -> RunnerStats {
        *self.stats.read()
    }

    /// Walk the job forest from `root_job`, fitting every reachable refit
    /// job exactly once.
    pub fn run(&self, jobs: &JobTable, root_job: JobId) -> CascadeResult<CascadeReport> {
        jobs.validate()?;
        jobs.get(root_job).ok_or(LookupError::TableRow {
            table: "job",
            id: root_job,
        })?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "cascade run {run_id}: {} workers over a table of {} jobs",
            self.workers,
            jobs.len()
        );

        let (work_tx, work_rx) = unbounded::<JobId>();
        let (done_tx, done_rx) = unbounded::<(JobId, CascadeResult<JobOutcome>)>();

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut reused = Vec::new();

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let executor = self.executor.clone();
                let status = self.status.clone();
                scope.spawn(move || {
                    for job_id in work_rx.iter() {
                        let mut run = JobRun::new(job_id);
                        run.mark_running();
                        status.insert(job_id, run);
                        let result = executor.run_job(jobs, job_id, true);
                        if done_tx.send((job_id, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            self.status.insert(root_job, JobRun::new(root_job));
            let mut outstanding = 0usize;
            if work_tx.send(root_job).is_ok() {
                outstanding += 1;
            }

            while outstanding > 0 {
                let (job_id, result) = match done_rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                };
                outstanding -= 1;

                match result {
                    Ok(outcome) => {
                        if let Some(mut entry) = self.status.get_mut(&job_id) {
                            entry.mark_completed();
                        }
                        completed.push(job_id);
                        self.stats.write().completed += 1;

                        for plan in &outcome.children {
                            match plan.mode {
                                RefitMode::Refit => {
                                    self.status.insert(plan.job_id, JobRun::new(plan.job_id));
                                    if work_tx.send(plan.job_id).is_ok() {
                                        outstanding += 1;
                                    }
                                }
                                RefitMode::ReuseParentFit => {
                                    reused.push(plan.job_id);
                                    self.stats.write().reused += 1;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        warn!("job {job_id} failed: {error}");
                        let message = error.to_string();
                        if let Some(mut entry) = self.status.get_mut(&job_id) {
                            entry.mark_failed(message.clone());
                        }
                        failed.push((job_id, message));
                        self.stats.write().failed += 1;
                    }
                }
            }
            // workers drain the queue and exit
            drop(work_tx);
        });

        let finished_at = Utc::now();
        info!(
            "cascade run {run_id}: {} completed, {} failed, {} reused",
            completed.len(),
            failed.len(),
            reused.len()
        );
        Ok(CascadeReport {
            run_id,
            completed,
            failed,
            reused,
            started_at,
            finished_at,
        })
    }
}
