//! How the runner reacts to a required stage failing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How to handle stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Stop scheduling after the first required-stage failure (default).
    /// Running stages finish; everything unstarted is recorded `blocked`.
    #[default]
    FailFast,
    /// Record the failure, block its descendants, keep running unrelated
    /// branches.
    ContinueOnError,
}

impl FailureMode {
    /// Chooses the mode from the `--continue-on-error` flag.
    #[must_use]
    pub fn from_flag(continue_on_error: bool) -> Self {
        if continue_on_error {
            Self::ContinueOnError
        } else {
            Self::FailFast
        }
    }

    /// Returns true if a failure of a stage with the given `required` flag
    /// stops the scheduling of new stages.
    #[must_use]
    pub fn halts_on(self, required: bool) -> bool {
        matches!(self, Self::FailFast) && required
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::ContinueOnError => write!(f, "continue-on-error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mode_default() {
        assert_eq!(FailureMode::default(), FailureMode::FailFast);
        assert_eq!(FailureMode::from_flag(true), FailureMode::ContinueOnError);
    }

    #[test]
    fn test_halts_only_on_required_in_fail_fast() {
        assert!(FailureMode::FailFast.halts_on(true));
        assert!(!FailureMode::FailFast.halts_on(false));
        assert!(!FailureMode::ContinueOnError.halts_on(true));
    }

    #[test]
    fn test_failure_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureMode::ContinueOnError).unwrap(),
            "\"continue-on-error\""
        );
        assert_eq!(FailureMode::FailFast.to_string(), "fail-fast");
    }
}
