//! Stage, attempt, and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a stage as recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started yet.
    #[default]
    Pending,
    /// Stage action is executing (or waiting for a retry).
    Running,
    /// Stage action ran and its effect was verified.
    Succeeded,
    /// Stage failed permanently or exhausted its retries.
    Failed,
    /// Stage was never attempted because an ancestor failed.
    Blocked,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }
}

/// Classified outcome of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// Exit status accepted and probe confirmed.
    Success,
    /// Retryable failure (network, timeout, cancellation).
    TransientFailure,
    /// Non-retryable failure.
    PermanentFailure,
    /// Action looked fine but the probe could not confirm its effect.
    VerificationFailure,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TransientFailure => write!(f, "transient-failure"),
            Self::PermanentFailure => write!(f, "permanent-failure"),
            Self::VerificationFailure => write!(f, "verification-failure"),
        }
    }
}

impl AttemptOutcome {
    /// Returns true if the attempt may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure | Self::VerificationFailure)
    }
}

/// Terminal outcome of a whole provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage succeeded.
    Complete,
    /// Every required stage succeeded; some optional stages did not.
    Partial,
    /// A required stage failed or was blocked.
    Failed,
}

impl RunOutcome {
    /// Process exit code for the outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete | Self::Partial => 0,
            Self::Failed => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
