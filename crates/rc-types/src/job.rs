//! Job identity and lifecycle records.
//!
//! A [`Job`] is one (node, split) fit unit with a contiguous range of child
//! jobs in the flattened [`JobTable`]. The table is built by the outer
//! scheduler and is read-only here; per-execution state lives in a
//! [`JobRun`] record instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::ConsistencyError;
use crate::hierarchy::{NodeId, SplitId};

/// Index of a job in its [`JobTable`].
pub type JobId = usize;

/// Hard ceiling on the simulate sampling method's replicate count.
pub const SIMULATE_SAMPLE_CEILING: usize = 20;

/// Which effects the delegated fit optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitKind {
    /// Fixed effects only.
    Fixed,
    /// Fixed and random effects.
    Both,
}

impl FitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitKind::Fixed => "fixed",
            FitKind::Both => "both",
        }
    }
}

/// One (node, split) fit unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub node_id: NodeId,
    pub split_id: Option<SplitId>,
    pub fit_kind: FitKind,
    /// First child job id (inclusive).
    pub child_start: JobId,
    /// One past the last child job id.
    pub child_end: JobId,
}

impl Job {
    pub fn new(node_id: NodeId, split_id: Option<SplitId>, fit_kind: FitKind) -> Self {
        Self {
            node_id,
            split_id,
            fit_kind,
            child_start: 0,
            child_end: 0,
        }
    }

    pub fn with_children(mut self, start: JobId, end: JobId) -> Self {
        self.child_start = start;
        self.child_end = end;
        self
    }

    pub fn child_range(&self) -> Range<JobId> {
        self.child_start..self.child_end
    }

    pub fn has_children(&self) -> bool {
        self.child_start < self.child_end
    }
}

/// The flattened job forest. Parents appear strictly before their children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTable {
    jobs: Vec<Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) -> JobId {
        self.jobs.push(job);
        self.jobs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobId, &Job)> {
        self.jobs.iter().enumerate()
    }

    /// Check the structural invariants the cascade relies on: child ranges
    /// stay in bounds and every parent precedes its children.
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        for (id, job) in self.iter() {
            if job.child_start > job.child_end {
                return Err(ConsistencyError::InvalidJobTable {
                    message: format!("job {id} has an inverted child range"),
                });
            }
            if job.child_end > self.jobs.len() {
                return Err(ConsistencyError::InvalidJobTable {
                    message: format!("job {id} child range ends past the table"),
                });
            }
            if job.has_children() && job.child_start <= id {
                return Err(ConsistencyError::InvalidJobTable {
                    message: format!("job {id} does not precede its children"),
                });
            }
        }
        Ok(())
    }
}

/// Lifecycle state for one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Execution record for one job, mirroring how the runner observes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: JobId,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobRun {
    pub fn new(job_id: JobId) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

/// Whether a child gets its own fit or reuses its parent's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefitMode {
    /// The child is seeded with a fresh database and fit independently.
    Refit,
    /// Split-level refitting is disabled for this child; it keeps its
    /// parent's fit and no independent optimization is triggered.
    ReuseParentFit,
}

/// A parent's plan for one of its children, produced by the job executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildPlan {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub split_id: Option<SplitId>,
    pub database: PathBuf,
    pub mode: RefitMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> JobTable {
        let mut table = JobTable::new();
        table.push(Job::new(0, None, FitKind::Both).with_children(1, 3));
        table.push(Job::new(1, None, FitKind::Fixed));
        table.push(Job::new(2, None, FitKind::Fixed));
        table
    }

    #[test]
    fn child_range_iteration() {
        let table = sample_table();
        let root = table.get(0).unwrap();
        assert!(root.has_children());
        assert_eq!(root.child_range().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!table.get(1).unwrap().has_children());
    }

    #[test]
    fn validate_accepts_well_formed_table() {
        assert!(sample_table().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_bounds_children() {
        let mut table = JobTable::new();
        table.push(Job::new(0, None, FitKind::Both).with_children(1, 5));
        assert!(matches!(
            table.validate(),
            Err(ConsistencyError::InvalidJobTable { .. })
        ));
    }

    #[test]
    fn validate_rejects_child_before_parent() {
        let mut table = JobTable::new();
        table.push(Job::new(0, None, FitKind::Fixed));
        table.push(Job::new(1, None, FitKind::Both).with_children(0, 1));
        assert!(table.validate().is_err());
    }

    #[test]
    fn job_run_lifecycle() {
        let mut run = JobRun::new(3);
        assert_eq!(run.status, JobStatus::Pending);
        assert!(run.started_at.is_none());

        run.mark_running();
        assert_eq!(run.status, JobStatus::Running);
        assert!(run.started_at.is_some());

        run.mark_completed();
        assert_eq!(run.status, JobStatus::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn job_run_failure() {
        let mut run = JobRun::new(0);
        run.mark_running();
        run.mark_failed("engine diverged".into());
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("engine diverged"));
    }
}
