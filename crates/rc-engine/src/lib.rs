//! # rc-engine
//!
//! Orchestration for the RateCascade fitting cascade.
//!
//! Provides the seed-request grid builder, the prior propagation engine,
//! the per-job executor and the worker-pool cascade runner, plus a
//! simulated reference engine for tests and examples.

pub mod executor;
pub mod propagate;
pub mod runner;
pub mod seed;
pub mod sim;

#[cfg(test)]
pub(crate) mod testworld;

pub use executor::{JobExecutor, JobOutcome};
pub use propagate::{create_child_databases, ChildTarget};
pub use runner::{CascadeReport, CascadeRunner, RunnerStats};
pub use seed::build_seed_requests;
pub use sim::SimulatedEngine;
