//! Error types for the envforge orchestrator.
//!
//! Two families live here: the errors returned by library operations
//! (catalog loading, manifest persistence) and the per-stage failure
//! taxonomy recorded in the manifest. Stage failures never propagate as
//! `Err` out of the runner; they are data.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for envforge operations.
#[derive(Debug, Error)]
pub enum EnvforgeError {
    /// The catalog is invalid.
    #[error("{0}")]
    Catalog(#[from] CatalogError),

    /// A cycle was detected in the stage graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// The manifest could not be read or written.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// Invalid flags, environment or settings.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvforgeError {
    /// Returns true if the error stems from invalid user-supplied configuration.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Catalog(_)
                | Self::CycleDetected(_)
                | Self::Config(_)
                | Self::Manifest(ManifestError::UnsupportedSchema { .. } | ManifestError::Malformed { .. })
        )
    }
}

/// Metadata about a catalog contract violation for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CATALOG-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a catalog fails to load or validate.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CatalogError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl CatalogError {
    /// Creates a new catalog error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Shorthand for a catalog that references a stage id that does not exist.
    #[must_use]
    pub fn missing_dependency(stage: &str, dependency: &str) -> Self {
        Self::new(format!(
            "Stage '{stage}' depends on '{dependency}', which is not in the catalog"
        ))
        .with_stages(vec![stage.to_string(), dependency.to_string()])
        .with_error_info(
            ContractErrorInfo::new("CATALOG-004-MISSING_DEP", "Dependency id not found")
                .with_fix_hint(ContractSuggestions::get("CATALOG-004-MISSING_DEP").unwrap_or_default()),
        )
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in catalog: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CATALOG-004-CYCLE",
            format!("Catalog contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for CatalogError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Errors raised by manifest stores.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading or writing the manifest file failed.
    #[error("Manifest IO error at {path}: {source}")]
    Io {
        /// The manifest path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest file is not valid JSON for the expected schema.
    #[error("Manifest at {path} is malformed: {message}")]
    Malformed {
        /// The manifest path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// The manifest was written by an incompatible schema version.
    #[error("Manifest schema version {found} is not supported (expected {expected})")]
    UnsupportedSchema {
        /// Version found in the file.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// A manifest update referenced a stage that is not in the manifest.
    #[error("Stage '{0}' is not present in the manifest")]
    UnknownStage(String),

    /// The store lock could not be acquired in time.
    #[error("Timed out waiting for the manifest store")]
    Timeout,
}

/// Classified reason a stage did not succeed.
///
/// Every non-success terminal manifest entry carries one of these,
/// rendered into its `last_error` summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// Network failure, timeout, rate limiting. Retried automatically.
    Transient {
        /// Failure signature (e.g. `timeout`, `exit:6`).
        signature: String,
        /// Human readable detail.
        detail: String,
    },
    /// The action reported success but the probe disagreed.
    Verification {
        /// Probe explanation.
        detail: String,
    },
    /// Unsupported configuration, checksum mismatch, bad arguments.
    Permanent {
        /// Failure signature.
        signature: String,
        /// Human readable detail.
        detail: String,
    },
    /// Never attempted because an ancestor failed.
    DependencyBlocked {
        /// The failed ancestor.
        ancestor: String,
    },
}

impl StageFailure {
    /// Returns true if the failure may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Verification { .. })
    }

    /// Promotes a retryable failure to a permanent one once retries are exhausted.
    #[must_use]
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            Self::Transient { signature, detail } => Self::Permanent {
                signature,
                detail: format!("{detail} (gave up after {attempts} attempts)"),
            },
            Self::Verification { detail } => Self::Permanent {
                signature: "verification".to_string(),
                detail: format!("{detail} (gave up after {attempts} attempts)"),
            },
            other => other,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { signature, detail } => {
                write!(f, "transient failure [{signature}]: {detail}")
            }
            Self::Verification { detail } => write!(f, "verification failed: {detail}"),
            Self::Permanent { signature, detail } => {
                write!(f, "permanent failure [{signature}]: {detail}")
            }
            Self::DependencyBlocked { ancestor } => {
                write!(f, "blocked: dependency '{ancestor}' did not succeed")
            }
        }
    }
}

/// Provides default suggestions for common catalog error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "CATALOG-004-CYCLE" => Some(
                "Check your stage dependencies for circular references. \
                 Use a linear chain or fan-out pattern instead.",
            ),
            "CATALOG-004-MISSING_DEP" => Some(
                "Ensure all dependencies reference stages that exist in the catalog. \
                 Check for typos in stage ids.",
            ),
            "CATALOG-004-DUPLICATE" => Some("Give every stage a unique id."),
            "CATALOG-004-EMPTY" => Some("Add at least one stage to the catalog."),
            "CATALOG-005-TEMPLATE" => Some(
                "Define the placeholder under [vars] or use one of: platform, os, arch.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "solvers");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"solvers".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info.code, "CATALOG-004-CYCLE");

        let catalog: CatalogError = err.into();
        assert_eq!(catalog.stages.len(), 3);
    }

    #[test]
    fn test_missing_dependency_error() {
        let err = CatalogError::missing_dependency("lib", "runtime");
        assert!(err.message.contains("'runtime'"));
        assert_eq!(
            err.error_info.map(|i| i.code),
            Some("CATALOG-004-MISSING_DEP".to_string())
        );
    }

    #[test]
    fn test_stage_failure_escalation() {
        let failure = StageFailure::Transient {
            signature: "timeout".to_string(),
            detail: "action exceeded 5s".to_string(),
        };
        assert!(failure.is_retryable());

        let escalated = failure.escalate(3);
        assert!(!escalated.is_retryable());
        assert!(escalated.to_string().contains("gave up after 3 attempts"));
        assert!(escalated.to_string().starts_with("permanent failure [timeout]"));
    }

    #[test]
    fn test_blocked_summary_names_ancestor() {
        let failure = StageFailure::DependencyBlocked {
            ancestor: "toolchain".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "blocked: dependency 'toolchain' did not succeed"
        );
    }

    #[test]
    fn test_configuration_errors() {
        let err = EnvforgeError::from(CatalogError::new("bad"));
        assert!(err.is_configuration());
        assert!(EnvforgeError::Config("--concurrency must be at least 1".to_string()).is_configuration());
        let err = EnvforgeError::Internal("x".to_string());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_contract_suggestions() {
        assert!(ContractSuggestions::get("CATALOG-004-CYCLE").is_some());
        assert!(ContractSuggestions::get("UNKNOWN").is_none());
    }
}
