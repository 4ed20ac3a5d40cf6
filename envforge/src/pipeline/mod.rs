//! Stage graph scheduling and execution.
//!
//! This module provides:
//! - The dependency graph with deterministic ordering and cycle detection
//! - Attempt classification and seeded backoff
//! - Failure modes
//! - The runner that drives a graph to a terminal state

mod dag;
mod failure_mode;
mod retry;
mod runner;

#[cfg(test)]
mod integration_tests;

pub use dag::{detect_cycle, StageGraph};
pub use failure_mode::FailureMode;
pub use retry::{
    BackoffStrategy, Classification, ClassificationRule, ClassificationTable, FailureClass, JitterStrategy,
    RetryConfig, RetryController, RetryDecision,
};
pub use runner::{
    default_concurrency, outcome_of, ExecutionPlan, PlannedAction, PlannedStage, Preparation, RunOptions, RunReport,
    Runner,
};
