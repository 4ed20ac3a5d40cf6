//! Provisioning settings resolved from flags and environment.

use crate::catalog::default_catalog_path;
use crate::errors::EnvforgeError;
use crate::manifest::default_manifest_path;
use crate::pipeline::{default_concurrency, FailureMode, Preparation, RunOptions};
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = EnvforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(EnvforgeError::Config(format!(
                "unknown log format '{other}', expected 'text' or 'json'"
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Everything `envforge provision` needs, after flag and environment
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Catalog file.
    pub catalog_path: PathBuf,
    /// Manifest file.
    pub manifest_path: PathBuf,
    /// Maximum concurrent actions.
    pub concurrency: usize,
    /// Target platform.
    pub platform: Platform,
    /// Plan only.
    pub dry_run: bool,
    /// Manifest preparation.
    pub preparation: Preparation,
    /// Failure mode.
    pub failure_mode: FailureMode,
    /// Address to serve `/health` on during the run.
    pub serve: Option<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            manifest_path: default_manifest_path(),
            concurrency: default_concurrency(),
            platform: Platform::detect(),
            dry_run: false,
            preparation: Preparation::Fresh,
            failure_mode: FailureMode::FailFast,
            serve: None,
        }
    }
}

impl ProvisionConfig {
    /// Picks the manifest preparation from the `--resume`/`--force` flags.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if both are set.
    pub fn preparation_from_flags(resume: bool, force: bool) -> Result<Preparation, EnvforgeError> {
        match (resume, force) {
            (true, true) => Err(EnvforgeError::Config(
                "--resume and --force cannot be combined".to_string(),
            )),
            (true, false) => Ok(Preparation::Resume),
            (false, true) => Ok(Preparation::Force),
            (false, false) => Ok(Preparation::Fresh),
        }
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero concurrency or an empty path.
    pub fn validate(&self) -> Result<(), EnvforgeError> {
        if self.concurrency == 0 {
            return Err(EnvforgeError::Config("concurrency must be at least 1".to_string()));
        }
        if self.catalog_path.as_os_str().is_empty() {
            return Err(EnvforgeError::Config("catalog path is empty".to_string()));
        }
        if self.manifest_path.as_os_str().is_empty() {
            return Err(EnvforgeError::Config("manifest path is empty".to_string()));
        }
        if self.serve.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(EnvforgeError::Config("--serve address is empty".to_string()));
        }
        Ok(())
    }

    /// Runner options for these settings.
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        RunOptions::default()
            .with_concurrency(self.concurrency)
            .with_failure_mode(self.failure_mode)
            .with_preparation(self.preparation)
    }
}
