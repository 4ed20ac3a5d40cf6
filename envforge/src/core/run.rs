//! A single recorded execution attempt of a stage.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the stage action's process ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    /// The process exited on its own. `None` means killed by a signal.
    Exited {
        /// Exit code, if any.
        code: Option<i32>,
    },
    /// The stage timeout expired and the process tree was killed.
    TimedOut,
    /// The run was cancelled and the process tree was killed.
    Cancelled,
    /// The process could not be started at all.
    SpawnFailed {
        /// OS error message.
        message: String,
    },
    /// The stage was refused before spawning because the target platform is not supported.
    UnsupportedPlatform {
        /// Target platform identifier.
        platform: String,
    },
}

impl ExitStatus {
    /// Convenience constructor for a normal exit.
    #[must_use]
    pub fn code(code: i32) -> Self {
        Self::Exited { code: Some(code) }
    }

    /// Failure signature used by the classification table.
    #[must_use]
    pub fn signature(&self) -> String {
        match self {
            Self::Exited { code: Some(code) } => format!("exit:{code}"),
            Self::Exited { code: None } => "signal".to_string(),
            Self::TimedOut => "timeout".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::SpawnFailed { .. } => "spawn".to_string(),
            Self::UnsupportedPlatform { .. } => "unsupported_platform".to_string(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => write!(f, "terminated by signal"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SpawnFailed { message } => write!(f, "failed to start: {message}"),
            Self::UnsupportedPlatform { platform } => {
                write!(f, "platform '{platform}' is not supported by this stage")
            }
        }
    }
}

/// Prefix of the marker appended to a capture that hit its limit.
pub const TRUNCATION_MARKER_PREFIX: &str = "[... truncated";

/// Output captured from one stream, bounded in size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Captured text, lossily decoded, with a truncation marker if cut.
    pub text: String,
    /// Bytes discarded after the capture limit was reached.
    pub truncated_bytes: u64,
}

impl CapturedOutput {
    /// Returns true if the capture hit its limit.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated_bytes > 0
    }

    /// Last non-empty line, used for error summaries. The truncation marker
    /// is not a line of output and is skipped.
    #[must_use]
    pub fn last_line(&self) -> Option<&str> {
        self.text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with(TRUNCATION_MARKER_PREFIX))
    }
}

/// One execution attempt of a stage. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    /// The stage id.
    pub stage_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: Timestamp,
    /// When the attempt ended.
    pub finished_at: Timestamp,
    /// Wall-clock duration.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Raw exit status.
    pub exit_status: ExitStatus,
    /// Captured standard output.
    pub stdout: CapturedOutput,
    /// Captured standard error.
    pub stderr: CapturedOutput,
}

impl StageRun {
    /// Short human-readable description of why the attempt ended the way it did.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.stderr.last_line().or_else(|| self.stdout.last_line()) {
            Some(line) => format!("{}: {line}", self.exit_status),
            None => self.exit_status.to_string(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn run_with(exit_status: ExitStatus, stderr: &str) -> StageRun {
        let now = Utc::now();
        StageRun {
            stage_id: "solvers".to_string(),
            attempt: 1,
            started_at: now,
            finished_at: now,
            duration: Duration::from_millis(12),
            exit_status,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput {
                text: stderr.to_string(),
                truncated_bytes: 0,
            },
        }
    }

    #[test]
    fn test_signatures() {
        assert_eq!(ExitStatus::code(6).signature(), "exit:6");
        assert_eq!(ExitStatus::TimedOut.signature(), "timeout");
        assert_eq!(ExitStatus::Cancelled.signature(), "cancelled");
        assert_eq!(
            ExitStatus::SpawnFailed { message: "x".into() }.signature(),
            "spawn"
        );
        assert_eq!(ExitStatus::Exited { code: None }.signature(), "signal");
    }

    #[test]
    fn test_summary_uses_last_stderr_line() {
        let run = run_with(ExitStatus::code(22), "downloading\ncurl: (22) 404 Not Found\n\n");
        assert_eq!(run.summary(), "exited with code 22: curl: (22) 404 Not Found");

        let run = run_with(ExitStatus::TimedOut, "");
        assert_eq!(run.summary(), "timed out");
    }

    #[test]
    fn test_duration_serialized_as_millis() {
        let run = run_with(ExitStatus::code(0), "");
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["duration"], 12);
        assert_eq!(json["exit_status"]["kind"], "exited");
    }
}
