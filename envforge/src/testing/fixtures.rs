//! Catalog fixtures and a runner harness.

use std::sync::Arc;

use crate::catalog::{ActionSpec, Catalog, StageDefinition};
use crate::events::CollectingEventSink;
use crate::manifest::{InMemoryManifestStore, Manifest};
use crate::pipeline::{
    BackoffStrategy, FailureMode, JitterStrategy, Preparation, RetryConfig, RunOptions, RunReport, Runner, StageGraph,
};

use super::mocks::{ScriptedExecutor, ScriptedProbe};

/// A stage running `true` with the given dependencies.
#[must_use]
pub fn stage(id: &str, deps: &[&str]) -> StageDefinition {
    StageDefinition::new(id, ActionSpec::new("true")).with_dependencies(deps.iter().copied())
}

/// Retry settings with millisecond delays and no jitter.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_backoff(BackoffStrategy::Exponential)
        .with_jitter(JitterStrategy::None)
}

/// Builds a catalog with fast retries.
///
/// # Panics
///
/// Panics if the stages do not form a valid catalog.
#[must_use]
pub fn catalog(stages: Vec<StageDefinition>) -> Catalog {
    Catalog::new("test", stages)
        .map(|c| c.with_retry(fast_retry()))
        .unwrap_or_else(|e| panic!("invalid test catalog: {e}"))
}

/// The `A -> {B, C}` catalog used throughout the tests.
#[must_use]
pub fn fan_out_catalog() -> Catalog {
    catalog(vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["a"])])
}

/// A runner wired to scripted doubles and an in-memory store.
pub struct TestHarness {
    /// The stage graph.
    pub graph: Arc<StageGraph>,
    /// The executor.
    pub executor: Arc<ScriptedExecutor>,
    /// The probe.
    pub probe: Arc<ScriptedProbe>,
    /// The manifest store.
    pub store: Arc<InMemoryManifestStore>,
    /// Collected run events.
    pub events: Arc<CollectingEventSink>,
    /// Run options.
    pub options: RunOptions,
}

impl TestHarness {
    /// Creates a harness with concurrency 2 and fail-fast.
    #[must_use]
    pub fn new(catalog: Catalog) -> Self {
        Self {
            graph: Arc::new(StageGraph::new(catalog)),
            executor: Arc::new(ScriptedExecutor::new()),
            probe: Arc::new(ScriptedProbe::new()),
            store: Arc::new(InMemoryManifestStore::new()),
            events: Arc::new(CollectingEventSink::new()),
            options: RunOptions::default().with_concurrency(2),
        }
    }

    /// Replaces the executor.
    #[must_use]
    pub fn with_executor(mut self, executor: ScriptedExecutor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Replaces the probe.
    #[must_use]
    pub fn with_probe(mut self, probe: ScriptedProbe) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Seeds the store with a manifest from an earlier run.
    #[must_use]
    pub fn with_recorded(mut self, manifest: Manifest) -> Self {
        self.store = Arc::new(InMemoryManifestStore::with_manifest(manifest));
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.options = self.options.with_concurrency(concurrency);
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.options = self.options.with_failure_mode(mode);
        self
    }

    /// Sets the manifest preparation.
    #[must_use]
    pub fn with_preparation(mut self, preparation: Preparation) -> Self {
        self.options = self.options.with_preparation(preparation);
        self
    }

    /// Builds the runner.
    #[must_use]
    pub fn runner(&self) -> Runner {
        Runner::new(
            self.graph.clone(),
            self.executor.clone(),
            self.probe.clone(),
            self.store.clone(),
        )
        .with_options(self.options.clone())
        .with_event_sink(self.events.clone())
    }

    /// Runs to completion.
    ///
    /// # Panics
    ///
    /// Panics if the run returns an error.
    pub async fn run(&self) -> RunReport {
        match self.runner().run().await {
            Ok(report) => report,
            Err(e) => panic!("run failed: {e}"),
        }
    }
}
