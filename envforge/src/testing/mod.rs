//! Testing utilities for envforge runs.
//!
//! This module provides:
//! - Scripted executors and probes that never spawn processes
//! - Catalog fixtures and a runner harness
//! - Manifest assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_attempts, assert_blocked_by, assert_last_error_contains, assert_stage_status};
pub use fixtures::{catalog, fan_out_catalog, fast_retry, stage, TestHarness};
pub use mocks::{ScriptedExecutor, ScriptedProbe};
