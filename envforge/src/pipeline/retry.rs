//! Failure classification and retry policy.
//!
//! Every failed attempt is mapped to a signature (`exit:6`, `timeout`, ...)
//! and the signature is looked up in the catalog's classification table.
//! Nothing is inferred from free-form output. Backoff is exponential with
//! jitter drawn from an RNG seeded by the catalog seed, stage id, signature
//! and attempt number, so the same failure always waits the same time.

use crate::catalog::StageDefinition;
use crate::core::{AttemptOutcome, ExitStatus, StageRun};
use crate::errors::StageFailure;
use crate::probe::ProbeVerdict;
use crate::utils::stable_seed;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Seed for jitter.
    pub seed: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
            seed: 0,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Sets the jitter seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Whether a failure signature may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Never retry.
    Permanent,
}

/// One row of the classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Exact signature, e.g. `exit:6`.
    pub signature: String,
    /// Class assigned to the signature.
    pub class: FailureClass,
}

/// Signature to class mapping supplied with the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationTable {
    /// Class for signatures no rule or built-in covers.
    pub default: FailureClass,
    /// Explicit rules; the first match wins.
    pub rules: Vec<ClassificationRule>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self {
            default: FailureClass::Permanent,
            rules: Vec::new(),
        }
    }
}

impl ClassificationTable {
    /// Adds a rule.
    #[must_use]
    pub fn with_rule(mut self, signature: impl Into<String>, class: FailureClass) -> Self {
        self.rules.push(ClassificationRule {
            signature: signature.into(),
            class,
        });
        self
    }

    /// Looks up a signature: explicit rules, then built-ins, then the default.
    #[must_use]
    pub fn class_of(&self, signature: &str) -> FailureClass {
        if let Some(rule) = self.rules.iter().find(|r| r.signature == signature) {
            return rule.class;
        }
        match signature {
            "timeout" | "cancelled" => FailureClass::Transient,
            "spawn" | "unsupported_platform" => FailureClass::Permanent,
            _ => self.default,
        }
    }
}

/// Result of classifying one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Classified outcome.
    pub outcome: AttemptOutcome,
    /// Failure detail; `None` on success.
    pub failure: Option<StageFailure>,
}

impl Classification {
    fn success() -> Self {
        Self {
            outcome: AttemptOutcome::Success,
            failure: None,
        }
    }

    fn failed(outcome: AttemptOutcome, failure: StageFailure) -> Self {
        Self {
            outcome,
            failure: Some(failure),
        }
    }

    /// Failure signature, if the attempt failed.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        match &self.failure {
            Some(StageFailure::Transient { signature, .. } | StageFailure::Permanent { signature, .. }) => {
                Some(signature.as_str())
            }
            Some(StageFailure::Verification { .. }) => Some("verification"),
            Some(StageFailure::DependencyBlocked { .. }) | None => None,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Classifies attempts and decides whether to retry them.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    config: RetryConfig,
    table: ClassificationTable,
}

impl RetryController {
    /// Creates a controller.
    #[must_use]
    pub fn new(config: RetryConfig, table: ClassificationTable) -> Self {
        Self { config, table }
    }

    /// Returns the retry config.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns true if the attempt's exit status is in the stage's accepted set.
    #[must_use]
    pub fn exit_accepted(stage: &StageDefinition, run: &StageRun) -> bool {
        matches!(run.exit_status, ExitStatus::Exited { code: Some(code) } if stage.accepts_exit_code(code))
    }

    /// Classifies an attempt. `verdict` is the probe result and is only
    /// consulted when the exit status was accepted.
    #[must_use]
    pub fn classify(
        &self,
        stage: &StageDefinition,
        run: &StageRun,
        verdict: Option<&ProbeVerdict>,
    ) -> Classification {
        if Self::exit_accepted(stage, run) {
            return match verdict {
                Some(ProbeVerdict::Confirmed) => Classification::success(),
                Some(ProbeVerdict::Unconfirmed(reason)) => Classification::failed(
                    AttemptOutcome::VerificationFailure,
                    StageFailure::Verification {
                        detail: format!("{} but probe disagreed: {reason}", run.exit_status),
                    },
                ),
                None => Classification::failed(
                    AttemptOutcome::VerificationFailure,
                    StageFailure::Verification {
                        detail: "effect was not verified".to_string(),
                    },
                ),
            };
        }

        let signature = run.exit_status.signature();
        let detail = run.summary();
        match self.table.class_of(&signature) {
            FailureClass::Transient => Classification::failed(
                AttemptOutcome::TransientFailure,
                StageFailure::Transient { signature, detail },
            ),
            FailureClass::Permanent => Classification::failed(
                AttemptOutcome::PermanentFailure,
                StageFailure::Permanent { signature, detail },
            ),
        }
    }

    /// Decides what to do after a failed attempt.
    ///
    /// `attempt` is 1-based; a stage may run at most `max_retries + 1` times.
    #[must_use]
    pub fn decide(
        &self,
        stage_id: &str,
        classification: &Classification,
        attempt: u32,
        max_retries: u32,
    ) -> RetryDecision {
        if !classification.outcome.is_retryable() {
            return RetryDecision::NotRetryable;
        }
        if attempt > max_retries {
            return RetryDecision::GiveUp;
        }
        let signature = classification.signature().unwrap_or("unknown");
        RetryDecision::Retry(self.delay(stage_id, signature, attempt))
    }

    /// Backoff delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, stage_id: &str, signature: &str, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms;
        let max = self.config.max_delay_ms;
        let n = attempt.saturating_sub(1);

        let delay = match self.config.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(n)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let seed = stable_seed(&[
            &self.config.seed.to_string(),
            stage_id,
            signature,
            &attempt.to_string(),
        ]);
        let mut rng = StdRng::seed_from_u64(seed);

        let jittered = match self.config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rng.gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rng.gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}
