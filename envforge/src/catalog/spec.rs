//! Stage definitions.

use crate::errors::{CatalogError, ContractErrorInfo};
use crate::platform::Platform;
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// The system call a stage performs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Program to execute.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherits the orchestrator's when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Environment overlay applied on top of the orchestrator's environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ActionSpec {
    /// Creates an action for a program.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable to the overlay.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The command line as a single display string.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Verification predicate declared by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Trust the exit status alone.
    #[default]
    None,
    /// A program that must exit 0, e.g. `ipopt --version`.
    Command {
        /// Program to run.
        program: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Substring that must appear on stdout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect: Option<String>,
    },
    /// A file or directory that must exist.
    PathExists {
        /// Path to check.
        path: PathBuf,
    },
    /// A file whose SHA-256 must match.
    FileSha256 {
        /// Path to hash.
        path: PathBuf,
        /// Expected hex digest.
        sha256: String,
    },
}

/// One provisioning step with declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique id.
    pub id: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// The action to run.
    pub action: ActionSpec,
    /// Ids of stages that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Safe to re-run without side effects.
    pub idempotent: bool,
    /// Gates readiness. Optional stages may fail without failing the run.
    pub required: bool,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Exit codes treated as "the action ran".
    pub accepted_exit_codes: Vec<i32>,
    /// Platforms this stage supports; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    /// Verification predicate.
    #[serde(default)]
    pub probe: ProbeSpec,
}

impl StageDefinition {
    /// Creates a stage with orchestrator defaults.
    #[must_use]
    pub fn new(id: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            action,
            depends_on: Vec::new(),
            idempotent: true,
            required: true,
            timeout_secs: super::DEFAULT_TIMEOUT_SECS,
            max_retries: super::DEFAULT_MAX_RETRIES,
            accepted_exit_codes: vec![0],
            platforms: Vec::new(),
            probe: ProbeSpec::None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Marks the stage optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Marks the stage unsafe to re-run.
    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Sets the verification probe.
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = probe;
        self
    }

    /// Restricts the stage to the given platforms.
    #[must_use]
    pub fn with_platforms(mut self, platforms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if the stage targets `platform`; an empty list means any.
    #[must_use]
    pub fn supports(&self, platform: &Platform) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| platform.matches(p))
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns true if the exit code counts as the action having run.
    #[must_use]
    pub fn accepts_exit_code(&self, code: i32) -> bool {
        self.accepted_exit_codes.contains(&code)
    }

    /// Hash of everything that determines the stage's effect. A stage whose
    /// hash changed since it succeeded must run again.
    #[must_use]
    pub fn definition_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&json)[..16].to_string()
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is blank, the command is blank, the stage
    /// depends on itself, or no exit code is accepted.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.id.trim().is_empty() {
            return Err(CatalogError::new("Stage id cannot be empty or whitespace-only"));
        }
        if self.action.command.trim().is_empty() {
            return Err(CatalogError::new(format!(
                "Stage '{}' has an empty action command",
                self.id
            ))
            .with_stages(vec![self.id.clone()]));
        }
        if self.depends_on.contains(&self.id) {
            return Err(CatalogError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.id
            ))
            .with_stages(vec![self.id.clone()])
            .with_error_info(ContractErrorInfo::new(
                "CATALOG-004-CYCLE",
                "Self dependency",
            )));
        }
        if self.accepted_exit_codes.is_empty() {
            return Err(CatalogError::new(format!(
                "Stage '{}' accepts no exit codes",
                self.id
            ))
            .with_stages(vec![self.id.clone()]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str) -> StageDefinition {
        StageDefinition::new(id, ActionSpec::new("true"))
    }

    #[test]
    fn test_stage_creation() {
        let spec = stage("lib")
            .with_dependencies(["toolchain", "runtime"])
            .with_max_retries(4)
            .optional();

        assert_eq!(spec.depends_on, vec!["toolchain", "runtime"]);
        assert_eq!(spec.max_retries, 4);
        assert!(!spec.required);
        assert!(spec.idempotent);
        assert!(spec.accepts_exit_code(0));
        assert!(!spec.accepts_exit_code(1));
    }

    #[test]
    fn test_stage_self_dependency() {
        let spec = stage("lib").with_dependency("lib");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_stage_blank_id_and_command() {
        assert!(stage("  ").validate().is_err());
        assert!(StageDefinition::new("x", ActionSpec::new(" ")).validate().is_err());
    }

    #[test]
    fn test_definition_hash_tracks_action() {
        let a = stage("lib");
        let b = StageDefinition::new("lib", ActionSpec::new("true").with_args(["-v"]));
        assert_eq!(a.definition_hash(), stage("lib").definition_hash());
        assert_ne!(a.definition_hash(), b.definition_hash());
        assert_eq!(a.definition_hash().len(), 16);
    }

    #[test]
    fn test_probe_spec_deserialize() {
        let probe: ProbeSpec =
            toml::from_str("kind = \"command\"\nprogram = \"ipopt\"\nargs = [\"--version\"]").unwrap();
        assert_eq!(
            probe,
            ProbeSpec::Command {
                program: "ipopt".to_string(),
                args: vec!["--version".to_string()],
                expect: None,
            }
        );
    }

    #[test]
    fn test_action_display() {
        let action = ActionSpec::new("pip").with_args(["install", "numpy"]);
        assert_eq!(action.display(), "pip install numpy");
    }
}
