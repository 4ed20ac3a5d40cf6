//! Readiness derived from a manifest.

use crate::core::StageStatus;
use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Health detail for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHealth {
    /// Recorded status.
    pub status: StageStatus,
    /// Whether the stage gates readiness.
    pub required: bool,
    /// Attempts made.
    pub attempts: u32,
    /// Most recent failure summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Blocking ancestor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

/// Readiness of the provisioned environment.
///
/// `ready` holds iff every required stage succeeded. The id lists name
/// every stage (required or not) that has not succeeded; running stages
/// count as pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether the environment is usable.
    pub ready: bool,
    /// Run the report was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Stages not yet finished.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
    /// Stages that failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
    /// Stages blocked by a failed ancestor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<String>,
    /// Per-stage detail.
    #[serde(default)]
    pub stages: BTreeMap<String, StageHealth>,
    /// Why the manifest could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// Derives the report from a manifest.
    #[must_use]
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut pending = Vec::new();
        let mut failed = Vec::new();
        let mut blocked = Vec::new();
        for (id, entry) in &manifest.stages {
            match entry.status {
                StageStatus::Pending | StageStatus::Running => pending.push(id.clone()),
                StageStatus::Failed => failed.push(id.clone()),
                StageStatus::Blocked => blocked.push(id.clone()),
                StageStatus::Succeeded => {}
            }
        }

        let stages = manifest
            .stages
            .iter()
            .map(|(id, e)| {
                (
                    id.clone(),
                    StageHealth {
                        status: e.status,
                        required: e.required,
                        attempts: e.attempts,
                        last_error: e.last_error.clone(),
                        blocked_by: e.blocked_by.clone(),
                    },
                )
            })
            .collect();

        Self {
            ready: manifest.required_succeeded(),
            run_id: Some(manifest.run_id.clone()),
            pending,
            failed,
            blocked,
            stages,
            error: None,
        }
    }

    /// A not-ready report for a manifest that could not be read.
    #[must_use]
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            ready: false,
            run_id: None,
            pending: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            stages: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    /// Process exit code for the `health` command.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.ready)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", if self.ready { "ready" } else { "not ready" })?;
        if let Some(error) = &self.error {
            writeln!(f, "  error: {error}")?;
        }
        for (label, ids) in [("pending", &self.pending), ("failed", &self.failed), ("blocked", &self.blocked)] {
            if !ids.is_empty() {
                writeln!(f, "  {label}: {}", ids.join(", "))?;
            }
        }
        for (id, stage) in &self.stages {
            write!(f, "  {id}: {}", stage.status)?;
            if !stage.required {
                write!(f, " (optional)")?;
            }
            if let Some(error) = &stage.last_error {
                write!(f, " - {error}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{catalog, stage};
    use pretty_assertions::assert_eq;

    fn manifest() -> Manifest {
        Manifest::new(&catalog(vec![
            stage("toolchain", &[]),
            stage("solvers", &["toolchain"]),
            stage("extras", &["toolchain"]).optional(),
        ]))
    }

    #[test]
    fn test_ready_ignores_optional_stages() {
        let mut m = manifest();
        m.stages.get_mut("toolchain").unwrap().mark_succeeded();
        m.stages.get_mut("solvers").unwrap().mark_succeeded();
        m.stages.get_mut("extras").unwrap().mark_running(1);

        let report = HealthReport::from_manifest(&m);
        assert!(report.ready);
        assert_eq!(report.pending, vec!["extras"]);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_not_ready_lists_failed_and_blocked() {
        let mut m = manifest();
        m.stages.get_mut("toolchain").unwrap().mark_failed(&crate::errors::StageFailure::Permanent {
            signature: "exit:100".to_string(),
            detail: "dpkg error".to_string(),
        });
        m.stages.get_mut("solvers").unwrap().mark_blocked("toolchain");
        m.stages.get_mut("extras").unwrap().mark_blocked("toolchain");

        let report = HealthReport::from_manifest(&m);
        assert!(!report.ready);
        assert_eq!(report.failed, vec!["toolchain"]);
        assert_eq!(report.blocked, vec!["extras", "solvers"]);
        assert_eq!(report.stages["solvers"].blocked_by.as_deref(), Some("toolchain"));
        assert_eq!(report.exit_code(), 1);
        assert!(report.to_string().starts_with("not ready"));
    }

    #[test]
    fn test_ready_json_omits_empty_lists() {
        let mut m = manifest();
        for entry in m.stages.values_mut() {
            entry.mark_succeeded();
        }
        let json = serde_json::to_value(HealthReport::from_manifest(&m)).unwrap();
        assert_eq!(json["ready"], true);
        assert!(json.get("pending").is_none());
        assert!(json.get("failed").is_none());
        assert_eq!(json["stages"]["solvers"]["status"], "succeeded");
    }
}
