//! Executes a stage graph to a terminal state.
//!
//! The coordinator loop owns scheduling: it starts ready stages in catalog
//! declaration order while fewer than `concurrency` are in flight, and
//! reacts to each finished stage by unblocking, blocking, or halting. Each
//! stage runs in its own task through executor, probe and retry controller,
//! persisting every transition through the manifest store.

use super::dag::StageGraph;
use super::failure_mode::FailureMode;
use super::retry::{RetryController, RetryDecision};
use crate::cancellation::CancellationToken;
use crate::core::{kinds, RunEvent, RunOutcome, StageStatus};
use crate::errors::{EnvforgeError, ManifestError, StageFailure};
use crate::events::{EventSink, LoggingEventSink};
use crate::executor::ActionExecutor;
use crate::manifest::{Manifest, ManifestEntry, ManifestStore};
use crate::probe::{ProbeVerdict, VerificationProbe};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Number of stages allowed in flight when none is configured.
#[must_use]
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// How the manifest left by a previous run is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preparation {
    /// Run everything again, except non-idempotent stages that already
    /// succeeded with the same definition.
    #[default]
    Fresh,
    /// Continue the recorded run: skip stages whose success still holds.
    Resume,
    /// Ignore the recorded run entirely.
    Force,
}

impl fmt::Display for Preparation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Resume => write!(f, "resume"),
            Self::Force => write!(f, "force"),
        }
    }
}

/// Runner options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum number of stage actions executing at once.
    pub concurrency: usize,
    /// Reaction to required-stage failures.
    pub failure_mode: FailureMode,
    /// Treatment of the previous manifest.
    pub preparation: Preparation,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            failure_mode: FailureMode::default(),
            preparation: Preparation::default(),
        }
    }
}

impl RunOptions {
    /// Sets the concurrency bound (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Sets the manifest preparation.
    #[must_use]
    pub fn with_preparation(mut self, preparation: Preparation) -> Self {
        self.preparation = preparation;
        self
    }
}

/// What a run would do with a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    /// The action will execute.
    Run,
    /// A recorded success is kept.
    Skip,
}

/// One stage in an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    /// Stage id.
    pub id: String,
    /// Planned action.
    pub action: PlannedAction,
    /// Command line.
    pub command: String,
    /// Direct dependencies.
    pub depends_on: Vec<String>,
    /// Whether the stage gates readiness.
    pub required: bool,
}

/// Dry-run result: the topological plan grouped into waves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Catalog name.
    pub catalog: String,
    /// Manifest preparation the plan assumes.
    pub preparation: Preparation,
    /// Concurrency bound.
    pub concurrency: usize,
    /// Failure mode.
    pub failure_mode: FailureMode,
    /// Waves; stages within a wave have no dependency on each other.
    pub waves: Vec<Vec<PlannedStage>>,
}

impl ExecutionPlan {
    /// All planned stages, wave by wave.
    pub fn stages(&self) -> impl Iterator<Item = &PlannedStage> {
        self.waves.iter().flatten()
    }

    /// Number of stages whose action would execute.
    #[must_use]
    pub fn to_run(&self) -> usize {
        self.stages().filter(|s| s.action == PlannedAction::Run).count()
    }

    /// Number of stages that would be skipped.
    #[must_use]
    pub fn to_skip(&self) -> usize {
        self.stages().filter(|s| s.action == PlannedAction::Skip).count()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Plan for '{}' ({}, {}, concurrency {}): {} to run, {} to skip",
            self.catalog,
            self.preparation,
            self.failure_mode,
            self.concurrency,
            self.to_run(),
            self.to_skip()
        )?;
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f, "wave {}:", i + 1)?;
            for stage in wave {
                let action = match stage.action {
                    PlannedAction::Run => "run ",
                    PlannedAction::Skip => "skip",
                };
                let optional = if stage.required { "" } else { " (optional)" };
                writeln!(f, "  {action} {}{optional}: {}", stage.id, stage.command)?;
            }
        }
        Ok(())
    }
}

/// Result of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// Terminal outcome.
    pub outcome: RunOutcome,
    /// Final manifest.
    pub manifest: Manifest,
    /// Number of executor invocations.
    pub actions_executed: usize,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl RunReport {
    /// Process exit code for the outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Computes the terminal outcome from a final manifest.
#[must_use]
pub fn outcome_of(manifest: &Manifest) -> RunOutcome {
    if manifest.all_succeeded() {
        RunOutcome::Complete
    } else if manifest.required_succeeded() {
        RunOutcome::Partial
    } else {
        RunOutcome::Failed
    }
}

/// State shared by the coordinator and the stage tasks.
struct Shared {
    graph: Arc<StageGraph>,
    executor: Arc<dyn ActionExecutor>,
    probe: Arc<dyn VerificationProbe>,
    store: Arc<dyn ManifestStore>,
    retry: RetryController,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    run_id: String,
    actions: AtomicUsize,
}

impl Shared {
    fn emit(&self, event: RunEvent) {
        self.events.try_emit(event);
    }

    fn stage_event(&self, kind: &str, stage_id: &str) -> RunEvent {
        RunEvent::for_stage(kind, self.run_id.clone(), stage_id)
    }

    async fn fail(&self, stage_id: &str, attempts: u32, failure: StageFailure) -> Result<StageStatus, ManifestError> {
        error!(stage = %stage_id, attempts, error = %failure, "Stage failed");
        let summary = failure.to_string();
        self.store
            .update(stage_id, Box::new(move |e: &mut ManifestEntry| e.mark_failed(&failure)))
            .await?;
        self.emit(
            self.stage_event(kinds::STAGE_FAILED, stage_id)
                .with("attempts", attempts)
                .with("error", summary),
        );
        Ok(StageStatus::Failed)
    }

    async fn block(&self, stage_id: &str, ancestor: &str) -> Result<(), ManifestError> {
        warn!(stage = %stage_id, blocked_by = %ancestor, "Stage blocked");
        let cause = ancestor.to_string();
        self.store
            .update(stage_id, Box::new(move |e: &mut ManifestEntry| e.mark_blocked(&cause)))
            .await?;
        self.emit(self.stage_event(kinds::STAGE_BLOCKED, stage_id).with("blocked_by", ancestor));
        Ok(())
    }
}

/// Outcome of one stage task.
struct StageResult {
    idx: usize,
    outcome: Result<StageStatus, ManifestError>,
}

/// Drives a [`StageGraph`] to completion.
pub struct Runner {
    graph: Arc<StageGraph>,
    executor: Arc<dyn ActionExecutor>,
    probe: Arc<dyn VerificationProbe>,
    store: Arc<dyn ManifestStore>,
    options: RunOptions,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl Runner {
    /// Creates a runner with default options.
    #[must_use]
    pub fn new(
        graph: Arc<StageGraph>,
        executor: Arc<dyn ActionExecutor>,
        probe: Arc<dyn VerificationProbe>,
        store: Arc<dyn ManifestStore>,
    ) -> Self {
        Self {
            graph,
            executor,
            probe,
            store,
            options: RunOptions::default(),
            events: Arc::new(LoggingEventSink::debug()),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The run options.
    #[must_use]
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Builds the manifest this run starts from, without writing it.
    async fn prepare(&self) -> Result<Manifest, EnvforgeError> {
        let catalog = self.graph.catalog();
        let previous = match self.options.preparation {
            Preparation::Force => None,
            Preparation::Fresh | Preparation::Resume => self.store.load().await?,
        };

        let Some(previous) = previous else {
            if self.options.preparation == Preparation::Resume {
                warn!("No manifest to resume from, starting a fresh run");
            }
            return Ok(Manifest::new(catalog));
        };

        let mut manifest = Manifest::new(catalog);
        if self.options.preparation == Preparation::Resume {
            manifest.run_id.clone_from(&previous.run_id);
            manifest.created_at = previous.created_at;
        }
        if previous.catalog_fingerprint != manifest.catalog_fingerprint {
            info!(catalog = %catalog.name(), "Catalog changed since the recorded run");
        }

        for stage in catalog.stages() {
            let Some(recorded) = previous.entry(&stage.id) else {
                continue;
            };
            if recorded.status != StageStatus::Succeeded || !recorded.matches_definition(stage) {
                continue;
            }
            let keep = match self.options.preparation {
                Preparation::Fresh => !stage.idempotent,
                Preparation::Resume if stage.idempotent => match self.probe.verify(stage).await {
                    ProbeVerdict::Confirmed => true,
                    ProbeVerdict::Unconfirmed(reason) => {
                        info!(stage = %stage.id, reason = %reason, "Recorded success no longer holds, stage will run again");
                        false
                    }
                },
                Preparation::Resume => true,
                Preparation::Force => false,
            };
            if keep {
                manifest.stages.insert(stage.id.clone(), recorded.clone());
            }
        }
        Ok(manifest)
    }

    /// Resolves the execution plan without running any action or touching
    /// the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorded manifest cannot be read.
    pub async fn plan(&self) -> Result<ExecutionPlan, EnvforgeError> {
        let manifest = self.prepare().await?;
        let graph = &self.graph;
        let waves = graph
            .waves()
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .map(|idx| {
                        let stage = graph.stage(idx);
                        let kept = manifest
                            .entry(&stage.id)
                            .is_some_and(|e| e.status == StageStatus::Succeeded);
                        PlannedStage {
                            id: stage.id.clone(),
                            action: if kept { PlannedAction::Skip } else { PlannedAction::Run },
                            command: stage.action.display(),
                            depends_on: stage.depends_on.clone(),
                            required: stage.required,
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(ExecutionPlan {
            catalog: graph.catalog().name().to_string(),
            preparation: self.options.preparation,
            concurrency: self.options.concurrency,
            failure_mode: self.options.failure_mode,
            waves,
        })
    }

    /// Runs every stage to a terminal status.
    ///
    /// Stage failures are recorded in the manifest and reflected in the
    /// outcome; they are never returned as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or written.
    pub async fn run(&self) -> Result<RunReport, EnvforgeError> {
        let started = Instant::now();
        let manifest = self.prepare().await?;
        let run_id = manifest.run_id.clone();
        let graph = self.graph.clone();
        let stage_count = graph.stage_count();
        let concurrency = self.options.concurrency.max(1);

        // A recorded success whose ancestors must run again is held as pending
        // until they succeed, and is blocked with them if they fail.
        let mut status = vec![StageStatus::Pending; stage_count];
        let mut held = vec![false; stage_count];
        for &idx in graph.execution_order() {
            let recorded = manifest
                .entry(&graph.stage(idx).id)
                .map_or(StageStatus::Pending, |e| e.status);
            if recorded != StageStatus::Succeeded {
                continue;
            }
            if graph.dependencies(idx).iter().all(|&d| status[d] == StageStatus::Succeeded) {
                status[idx] = StageStatus::Succeeded;
            } else {
                held[idx] = true;
            }
        }
        self.store.replace(manifest).await?;

        let shared = Arc::new(Shared {
            graph: graph.clone(),
            executor: self.executor.clone(),
            probe: self.probe.clone(),
            store: self.store.clone(),
            retry: RetryController::new(graph.catalog().retry().clone(), graph.catalog().classification().clone()),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            run_id: run_id.clone(),
            actions: AtomicUsize::new(0),
        });

        info!(
            run_id = %run_id,
            catalog = %graph.catalog().name(),
            stages = stage_count,
            concurrency,
            mode = %self.options.failure_mode,
            preparation = %self.options.preparation,
            "Run started"
        );
        shared.emit(
            RunEvent::new(kinds::RUN_STARTED, run_id.clone())
                .with("stages", stage_count)
                .with("concurrency", concurrency)
                .with("failure_mode", self.options.failure_mode.to_string())
                .with("preparation", self.options.preparation.to_string()),
        );
        for idx in (0..stage_count).filter(|&i| status[i] == StageStatus::Succeeded) {
            let id = &graph.stage(idx).id;
            info!(stage = %id, "Stage already succeeded, skipping");
            shared.emit(shared.stage_event(kinds::STAGE_SKIPPED, id));
        }

        let mut active: FuturesUnordered<JoinHandle<StageResult>> = FuturesUnordered::new();
        let mut halted_by: Option<String> = None;
        let mut store_error: Option<ManifestError> = None;

        loop {
            if halted_by.is_none() && store_error.is_none() && !self.cancel.is_cancelled() {
                loop {
                    let mut released = false;
                    for idx in 0..stage_count {
                        let ready = status[idx] == StageStatus::Pending
                            && graph
                                .dependencies(idx)
                                .iter()
                                .all(|&d| status[d] == StageStatus::Succeeded);
                        if !ready {
                            continue;
                        }
                        if held[idx] {
                            status[idx] = StageStatus::Succeeded;
                            released = true;
                            let id = &graph.stage(idx).id;
                            info!(stage = %id, "Dependencies succeeded again, keeping recorded success");
                            shared.emit(shared.stage_event(kinds::STAGE_SKIPPED, id));
                        } else if active.len() < concurrency {
                            status[idx] = StageStatus::Running;
                            active.push(spawn_stage_task(shared.clone(), idx));
                        }
                    }
                    if !released {
                        break;
                    }
                }
            }

            let Some(joined) = active.next().await else {
                break;
            };
            let result = joined.map_err(|e| EnvforgeError::Internal(format!("Stage task join error: {e}")))?;
            let stage = graph.stage(result.idx);

            match result.outcome {
                Ok(StageStatus::Succeeded) => status[result.idx] = StageStatus::Succeeded,
                Ok(_) if self.cancel.is_cancelled() => {
                    // unstarted stages stay pending so a resumed run picks them up
                    status[result.idx] = StageStatus::Failed;
                }
                Ok(_) => {
                    status[result.idx] = StageStatus::Failed;
                    for d in graph.descendants(result.idx) {
                        if status[d] == StageStatus::Pending {
                            status[d] = StageStatus::Blocked;
                            if let Err(e) = shared.block(&graph.stage(d).id, &stage.id).await {
                                store_error.get_or_insert(e);
                            }
                        }
                    }
                    if halted_by.is_none() && self.options.failure_mode.halts_on(stage.required) {
                        info!(stage = %stage.id, "Required stage failed, no new stages will start");
                        halted_by = Some(stage.id.clone());
                    }
                }
                Err(e) => {
                    error!(stage = %stage.id, error = %e, "Manifest update failed, tearing the run down");
                    status[result.idx] = StageStatus::Failed;
                    store_error.get_or_insert(e);
                    self.cancel.cancel("manifest store failure");
                }
            }
        }

        if let Some(e) = store_error {
            return Err(e.into());
        }

        if let Some(cause) = halted_by.as_ref().filter(|_| !self.cancel.is_cancelled()) {
            for idx in 0..stage_count {
                if status[idx] == StageStatus::Pending {
                    status[idx] = StageStatus::Blocked;
                    shared.block(&graph.stage(idx).id, cause).await?;
                }
            }
        }

        for idx in (0..stage_count).filter(|&i| held[i] && status[i] == StageStatus::Pending) {
            let id = &graph.stage(idx).id;
            debug!(stage = %id, "Run ended before the stage's dependencies succeeded again");
            self.store
                .update(id, Box::new(|e: &mut ManifestEntry| e.mark_pending()))
                .await?;
        }

        let manifest = self.store.snapshot().await?;
        let outcome = outcome_of(&manifest);
        let actions_executed = shared.actions.load(Ordering::SeqCst);
        let cancelled = self.cancel.is_cancelled();
        let duration = started.elapsed();

        info!(
            run_id = %run_id,
            outcome = %outcome,
            succeeded = manifest.count(StageStatus::Succeeded),
            failed = manifest.count(StageStatus::Failed),
            blocked = manifest.count(StageStatus::Blocked),
            pending = manifest.count(StageStatus::Pending),
            actions = actions_executed,
            cancelled,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Run finished"
        );
        shared.emit(
            RunEvent::new(kinds::RUN_COMPLETED, run_id.clone())
                .with("outcome", outcome.to_string())
                .with("actions", actions_executed)
                .with("cancelled", cancelled),
        );

        Ok(RunReport {
            run_id,
            outcome,
            manifest,
            actions_executed,
            duration,
            cancelled,
        })
    }
}

fn spawn_stage_task(shared: Arc<Shared>, idx: usize) -> JoinHandle<StageResult> {
    tokio::spawn(async move {
        let outcome = match AssertUnwindSafe(run_stage(&shared, idx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "stage task panicked".to_string());
                let failure = StageFailure::Permanent {
                    signature: "panic".to_string(),
                    detail,
                };
                shared.fail(&shared.graph.stage(idx).id, 0, failure).await
            }
        };
        StageResult { idx, outcome }
    })
}

/// The attempt loop: execute, verify, classify, then retry or settle.
async fn run_stage(shared: &Shared, idx: usize) -> Result<StageStatus, ManifestError> {
    let stage = shared.graph.stage(idx);
    let id = stage.id.as_str();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        shared
            .store
            .update(id, Box::new(move |e: &mut ManifestEntry| e.mark_running(attempt)))
            .await?;
        info!(stage = %id, attempt, "Stage attempt started");
        shared.emit(shared.stage_event(kinds::STAGE_STARTED, id).with("attempt", attempt));

        let run = shared.executor.execute(stage, attempt, &shared.cancel).await;
        shared.actions.fetch_add(1, Ordering::SeqCst);
        debug!(
            stage = %id,
            attempt,
            exit = %run.exit_status,
            duration_ms = u64::try_from(run.duration.as_millis()).unwrap_or(u64::MAX),
            stdout_truncated = run.stdout.is_truncated(),
            stderr_truncated = run.stderr.is_truncated(),
            "Stage attempt finished"
        );

        let verdict = if RetryController::exit_accepted(stage, &run) {
            Some(shared.probe.verify(stage).await)
        } else {
            None
        };
        let classification = shared.retry.classify(stage, &run, verdict.as_ref());

        let Some(failure) = classification.failure.clone() else {
            shared
                .store
                .update(id, Box::new(|e: &mut ManifestEntry| e.mark_succeeded()))
                .await?;
            info!(stage = %id, attempts = attempt, "Stage succeeded");
            shared.emit(shared.stage_event(kinds::STAGE_SUCCEEDED, id).with("attempts", attempt));
            return Ok(StageStatus::Succeeded);
        };

        if shared.cancel.is_cancelled() {
            // no retries while the run is being torn down
            return shared.fail(id, attempt, failure).await;
        }

        match shared.retry.decide(id, &classification, attempt, stage.max_retries) {
            RetryDecision::Retry(delay) => {
                let signature = classification.signature().unwrap_or("unknown").to_string();
                warn!(
                    stage = %id,
                    attempt,
                    signature = %signature,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure,
                    "Stage attempt failed, retrying"
                );
                shared.emit(
                    shared
                        .stage_event(kinds::STAGE_RETRYING, id)
                        .with("attempt", attempt)
                        .with("signature", signature)
                        .with("delay_ms", u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
                        .with("error", failure.to_string()),
                );
                let recorded = failure.clone();
                shared
                    .store
                    .update(id, Box::new(move |e: &mut ManifestEntry| e.mark_retrying(&recorded)))
                    .await?;

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shared.cancel.cancelled() => {
                        return shared.fail(id, attempt, failure).await;
                    }
                }
            }
            RetryDecision::GiveUp => return shared.fail(id, attempt, failure.escalate(attempt)).await,
            RetryDecision::NotRetryable => return shared.fail(id, attempt, failure).await,
        }
    }
}
