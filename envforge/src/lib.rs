//! # Envforge
//!
//! A dependency-aware provisioning orchestrator for reproducible runtime
//! environments.
//!
//! Envforge executes a catalog of installation stages with:
//!
//! - **Dependency-ordered execution**: stages form a DAG and run with bounded concurrency
//! - **Verified effects**: a stage succeeds only when its probe confirms the result
//! - **Classified retries**: transient failures back off with seeded jitter
//! - **Durable, resumable state**: every transition is persisted to an atomic manifest
//! - **Readiness reporting**: `GET /health` answers 200 once every required stage succeeded
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use envforge::prelude::*;
//!
//! let platform = Platform::detect();
//! let catalog = Catalog::load(Path::new("envforge.toml"), &platform)?;
//! let runner = Runner::new(
//!     Arc::new(StageGraph::new(catalog)),
//!     Arc::new(ProcessExecutor::new(platform)),
//!     Arc::new(BuiltinProbe::new()),
//!     Arc::new(FileManifestStore::new(".envforge/manifest.json")),
//! );
//!
//! let report = runner.run().await?;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod catalog;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod health;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod platform;
pub mod probe;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::catalog::{ActionSpec, Catalog, ProbeSpec, StageDefinition};
    pub use crate::core::{AttemptOutcome, ExitStatus, RunEvent, RunOutcome, StageRun, StageStatus};
    pub use crate::errors::{
        CatalogError, ContractErrorInfo, CycleDetectedError, EnvforgeError, ManifestError, StageFailure,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{ActionExecutor, ProcessExecutor};
    pub use crate::health::{HealthReport, HealthService};
    pub use crate::manifest::{FileManifestStore, InMemoryManifestStore, Manifest, ManifestEntry, ManifestStore};
    pub use crate::pipeline::{FailureMode, Preparation, RunOptions, RunReport, Runner, StageGraph};
    pub use crate::platform::Platform;
    pub use crate::probe::{BuiltinProbe, ProbeVerdict, VerificationProbe};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
