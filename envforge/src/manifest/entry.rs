//! Manifest document and per-stage entries.

use crate::catalog::{Catalog, StageDefinition};
use crate::core::StageStatus;
use crate::errors::{ManifestError, StageFailure};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Manifest schema version written by this build.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Persisted state of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Current status.
    pub status: StageStatus,
    /// Attempts made in the current run.
    pub attempts: u32,
    /// Summary of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The ancestor that kept this stage from running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    /// Whether the stage gates readiness.
    pub required: bool,
    /// Hash of the definition the status refers to.
    pub definition_hash: String,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the stage reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Last modification.
    pub updated_at: Timestamp,
}

impl ManifestEntry {
    /// A fresh entry for a stage.
    #[must_use]
    pub fn pending(stage: &StageDefinition) -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            last_error: None,
            blocked_by: None,
            required: stage.required,
            definition_hash: stage.definition_hash(),
            started_at: None,
            finished_at: None,
            updated_at: now_utc(),
        }
    }

    /// Returns true if the entry refers to the stage's current definition.
    #[must_use]
    pub fn matches_definition(&self, stage: &StageDefinition) -> bool {
        self.definition_hash == stage.definition_hash()
    }

    /// Records the start of an attempt.
    pub fn mark_running(&mut self, attempt: u32) {
        self.status = StageStatus::Running;
        self.attempts = attempt;
        self.blocked_by = None;
        if self.started_at.is_none() {
            self.started_at = Some(now_utc());
        }
    }

    /// Records a failed attempt that will be retried.
    pub fn mark_retrying(&mut self, failure: &StageFailure) {
        self.last_error = Some(failure.to_string());
    }

    /// Records success.
    pub fn mark_succeeded(&mut self) {
        self.status = StageStatus::Succeeded;
        self.last_error = None;
        self.finished_at = Some(now_utc());
    }

    /// Records a terminal failure.
    pub fn mark_failed(&mut self, failure: &StageFailure) {
        self.status = StageStatus::Failed;
        self.last_error = Some(failure.to_string());
        self.finished_at = Some(now_utc());
    }

    /// Withdraws a recorded success whose ancestors did not complete again.
    pub fn mark_pending(&mut self) {
        self.status = StageStatus::Pending;
        self.finished_at = None;
    }

    /// Records that the stage will not run because of `ancestor`.
    pub fn mark_blocked(&mut self, ancestor: &str) {
        let failure = StageFailure::DependencyBlocked {
            ancestor: ancestor.to_string(),
        };
        self.status = StageStatus::Blocked;
        self.last_error = Some(failure.to_string());
        self.blocked_by = Some(ancestor.to_string());
        self.finished_at = Some(now_utc());
    }
}

/// The persisted run document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Run identifier, kept across `--resume`.
    pub run_id: String,
    /// Catalog name.
    pub catalog: String,
    /// Fingerprint of the catalog the entries refer to.
    pub catalog_fingerprint: String,
    /// When the run was created.
    pub created_at: Timestamp,
    /// Per-stage entries.
    pub stages: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// A manifest with every stage pending and a new run id.
    #[must_use]
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: uuid::Uuid::new_v4().to_string(),
            catalog: catalog.name().to_string(),
            catalog_fingerprint: catalog.fingerprint(),
            created_at: now_utc(),
            stages: catalog
                .stages()
                .iter()
                .map(|s| (s.id.clone(), ManifestEntry::pending(s)))
                .collect(),
        }
    }

    /// Looks up an entry.
    #[must_use]
    pub fn entry(&self, stage_id: &str) -> Option<&ManifestEntry> {
        self.stages.get(stage_id)
    }

    /// Ids of stages with a given status, in id order.
    #[must_use]
    pub fn ids_with_status(&self, status: StageStatus) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of stages with a given status.
    #[must_use]
    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.values().filter(|e| e.status == status).count()
    }

    /// Returns true if every required stage succeeded.
    #[must_use]
    pub fn required_succeeded(&self) -> bool {
        self.stages
            .values()
            .filter(|e| e.required)
            .all(|e| e.status == StageStatus::Succeeded)
    }

    /// Returns true if every stage succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.stages.values().all(|e| e.status == StageStatus::Succeeded)
    }

    /// Parses a manifest, checking the schema version before anything else.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnsupportedSchema`] for an unknown version
    /// and [`ManifestError::Malformed`] for anything unparsable.
    pub fn from_json(path: &Path, contents: &str) -> Result<Self, ManifestError> {
        let malformed = |message: String| ManifestError::Malformed {
            path: path.to_path_buf(),
            message,
        };

        let value: serde_json::Value = serde_json::from_str(contents).map_err(|e| malformed(e.to_string()))?;
        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| malformed("missing schema_version".to_string()))?;
        if version != u64::from(MANIFEST_SCHEMA_VERSION) {
            return Err(ManifestError::UnsupportedSchema {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                expected: MANIFEST_SCHEMA_VERSION,
            });
        }
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
    }

    /// Pretty JSON rendering; map keys are ordered so the output is stable.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ActionSpec;
    use pretty_assertions::assert_eq;

    fn catalog() -> Catalog {
        Catalog::new(
            "test",
            vec![
                StageDefinition::new("toolchain", ActionSpec::new("true")),
                StageDefinition::new("extras", ActionSpec::new("true"))
                    .with_dependency("toolchain")
                    .optional(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_manifest_all_pending() {
        let manifest = Manifest::new(&catalog());
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
        assert_eq!(manifest.count(StageStatus::Pending), 2);
        assert!(!manifest.entry("extras").unwrap().required);
        assert!(uuid::Uuid::parse_str(&manifest.run_id).is_ok());
    }

    #[test]
    fn test_entry_transitions() {
        let catalog = catalog();
        let mut entry = ManifestEntry::pending(&catalog.stages()[0]);

        entry.mark_running(1);
        assert_eq!(entry.status, StageStatus::Running);
        let started = entry.started_at;
        entry.mark_retrying(&StageFailure::Transient {
            signature: "timeout".to_string(),
            detail: "timed out".to_string(),
        });
        entry.mark_running(2);
        assert_eq!(entry.started_at, started);
        assert_eq!(entry.attempts, 2);

        entry.mark_succeeded();
        assert_eq!(entry.status, StageStatus::Succeeded);
        assert!(entry.last_error.is_none());
        assert!(entry.finished_at.is_some());

        entry.mark_blocked("toolchain");
        assert_eq!(entry.blocked_by.as_deref(), Some("toolchain"));
        assert_eq!(
            entry.last_error.as_deref(),
            Some("blocked: dependency 'toolchain' did not succeed")
        );
    }

    #[test]
    fn test_required_succeeded_ignores_optional() {
        let mut manifest = Manifest::new(&catalog());
        manifest.stages.get_mut("toolchain").unwrap().mark_succeeded();
        manifest.stages.get_mut("extras").unwrap().mark_blocked("toolchain");
        assert!(manifest.required_succeeded());
        assert!(!manifest.all_succeeded());
        assert_eq!(manifest.ids_with_status(StageStatus::Blocked), vec!["extras"]);
    }

    #[test]
    fn test_json_roundtrip_and_schema_check() {
        let manifest = Manifest::new(&catalog());
        let json = manifest.to_json().unwrap();
        let path = Path::new("manifest.json");
        assert_eq!(Manifest::from_json(path, &json).unwrap(), manifest);

        let future = json.replacen("\"schema_version\": 1", "\"schema_version\": 9", 1);
        assert!(matches!(
            Manifest::from_json(path, &future),
            Err(ManifestError::UnsupportedSchema { found: 9, expected: 1 })
        ));
        assert!(matches!(
            Manifest::from_json(path, "{not json"),
            Err(ManifestError::Malformed { .. })
        ));
    }
}
