//! Scripted executors and probes for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::cancellation::CancellationToken;
use crate::catalog::StageDefinition;
use crate::core::{CapturedOutput, ExitStatus, StageRun};
use crate::executor::ActionExecutor;
use crate::probe::{ProbeVerdict, VerificationProbe};
use crate::utils::now_utc;

/// An executor that replays scripted exit statuses instead of spawning
/// processes.
///
/// Each stage has a queue of exit statuses; once the queue is empty every
/// further attempt exits 0. Calls and peak concurrency are recorded.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ExitStatus>>>,
    stderr: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    calls: Mutex<Vec<(String, u32)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    /// Creates an executor where every stage succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues exit statuses for a stage's successive attempts.
    #[must_use]
    pub fn script(mut self, stage_id: &str, statuses: impl IntoIterator<Item = ExitStatus>) -> Self {
        self.scripts
            .get_mut()
            .entry(stage_id.to_string())
            .or_default()
            .extend(statuses);
        self
    }

    /// Makes the first `times` attempts of a stage exit with `code`.
    #[must_use]
    pub fn fail_times(self, stage_id: &str, times: usize, code: i32) -> Self {
        self.script(stage_id, std::iter::repeat(ExitStatus::code(code)).take(times))
    }

    /// Sets the stderr text every attempt of a stage reports.
    #[must_use]
    pub fn with_stderr(mut self, stage_id: &str, text: impl Into<String>) -> Self {
        self.stderr.insert(stage_id.to_string(), text.into());
        self
    }

    /// Makes attempts of one stage take `delay`.
    #[must_use]
    pub fn with_delay(mut self, stage_id: &str, delay: Duration) -> Self {
        self.delays.insert(stage_id.to_string(), delay);
        self
    }

    /// Makes attempts of every other stage take `delay`.
    #[must_use]
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Total number of attempts.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of attempts of one stage.
    #[must_use]
    pub fn calls_for(&self, stage_id: &str) -> usize {
        self.calls.lock().iter().filter(|(id, _)| id == stage_id).count()
    }

    /// Stage ids in the order their attempts started.
    #[must_use]
    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Highest number of attempts observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, stage: &StageDefinition, attempt: u32, cancel: &CancellationToken) -> StageRun {
        let started_at = now_utc();
        let started = Instant::now();
        self.calls.lock().push((stage.id.clone(), attempt));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&stage.id).copied().unwrap_or(self.default_delay);
        let exit_status = if cancel.is_cancelled() {
            ExitStatus::Cancelled
        } else {
            tokio::select! {
                () = tokio::time::sleep(delay) => self
                    .scripts
                    .lock()
                    .get_mut(&stage.id)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| ExitStatus::code(0)),
                () = cancel.cancelled() => ExitStatus::Cancelled,
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let stderr = match &exit_status {
            ExitStatus::Exited { code: Some(0) } => String::new(),
            _ => self.stderr.get(&stage.id).cloned().unwrap_or_default(),
        };
        StageRun {
            stage_id: stage.id.clone(),
            attempt,
            started_at,
            finished_at: now_utc(),
            duration: started.elapsed(),
            exit_status,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput {
                text: stderr,
                truncated_bytes: 0,
            },
        }
    }
}

/// A probe with scripted verdicts. Unscripted stages are confirmed.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, VecDeque<ProbeVerdict>>>,
    always: HashMap<String, ProbeVerdict>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    /// Creates a probe that confirms everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues verdicts for a stage's successive probes.
    #[must_use]
    pub fn script(mut self, stage_id: &str, verdicts: impl IntoIterator<Item = ProbeVerdict>) -> Self {
        self.scripts
            .get_mut()
            .entry(stage_id.to_string())
            .or_default()
            .extend(verdicts);
        self
    }

    /// Makes every probe of a stage come back unconfirmed.
    #[must_use]
    pub fn always_unconfirmed(mut self, stage_id: &str, reason: impl Into<String>) -> Self {
        self.always
            .insert(stage_id.to_string(), ProbeVerdict::Unconfirmed(reason.into()));
        self
    }

    /// Number of probes of one stage.
    #[must_use]
    pub fn calls_for(&self, stage_id: &str) -> usize {
        self.calls.lock().iter().filter(|id| *id == stage_id).count()
    }
}

#[async_trait]
impl VerificationProbe for ScriptedProbe {
    async fn verify(&self, stage: &StageDefinition) -> ProbeVerdict {
        self.calls.lock().push(stage.id.clone());
        if let Some(verdict) = self.always.get(&stage.id) {
            return verdict.clone();
        }
        self.scripts
            .lock()
            .get_mut(&stage.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProbeVerdict::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ActionSpec;

    fn stage(id: &str) -> StageDefinition {
        StageDefinition::new(id, ActionSpec::new("true"))
    }

    #[tokio::test]
    async fn test_scripted_executor_replays_then_succeeds() {
        let executor = ScriptedExecutor::new()
            .fail_times("a", 2, 6)
            .with_stderr("a", "curl: (6) Could not resolve host");
        let cancel = CancellationToken::new();

        let first = executor.execute(&stage("a"), 1, &cancel).await;
        assert_eq!(first.exit_status, ExitStatus::code(6));
        assert_eq!(first.stderr.last_line(), Some("curl: (6) Could not resolve host"));
        executor.execute(&stage("a"), 2, &cancel).await;
        let third = executor.execute(&stage("a"), 3, &cancel).await;
        assert_eq!(third.exit_status, ExitStatus::code(0));
        assert!(third.stderr.text.is_empty());

        assert_eq!(executor.calls_for("a"), 3);
        assert_eq!(executor.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_scripted_executor_observes_cancellation() {
        let executor = ScriptedExecutor::new().with_default_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel("test");
        let run = executor.execute(&stage("a"), 1, &cancel).await;
        assert_eq!(run.exit_status, ExitStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_scripted_probe() {
        let probe = ScriptedProbe::new()
            .script("a", [ProbeVerdict::Unconfirmed("missing".into())])
            .always_unconfirmed("b", "never");

        assert!(!probe.verify(&stage("a")).await.is_confirmed());
        assert!(probe.verify(&stage("a")).await.is_confirmed());
        assert!(!probe.verify(&stage("b")).await.is_confirmed());
        assert!(probe.verify(&stage("c")).await.is_confirmed());
        assert_eq!(probe.calls_for("a"), 2);
    }
}
