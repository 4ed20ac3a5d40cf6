//! The stage catalog: declarative, ordered stage definitions.
//!
//! A catalog file is TOML (or JSON when the path ends in `.json`):
//!
//! ```toml
//! name = "process-modeling"
//!
//! [vars]
//! release = "3.4.0"
//!
//! [defaults]
//! timeout_secs = 900
//! max_retries = 2
//!
//! [retry]
//! base_delay_ms = 2000
//! seed = 42
//!
//! [classification]
//! default = "permanent"
//! rules = [{ signature = "exit:6", class = "transient" }]
//!
//! [[stages]]
//! id = "solvers"
//! depends_on = ["runtime"]
//! action = { command = "idaes", args = ["get-extensions", "--release", "{{release}}"] }
//! probe = { kind = "command", program = "ipopt", args = ["--version"] }
//! ```
//!
//! Declaration order is significant: it is the scheduling tie-break.

mod spec;
mod template;

pub use spec::{ActionSpec, ProbeSpec, StageDefinition};
pub use template::TemplateContext;

use crate::errors::{CatalogError, ContractErrorInfo, ContractSuggestions};
use crate::pipeline::{detect_cycle, ClassificationTable, RetryConfig};
use crate::platform::Platform;
use crate::utils::sha256_hex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Catalog-wide stage defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageDefaults {
    /// Timeout in seconds.
    pub timeout_secs: u64,
    /// Retry budget.
    pub max_retries: u32,
    /// Idempotency flag.
    pub idempotent: bool,
    /// Required flag.
    pub required: bool,
    /// Accepted exit codes.
    pub accepted_exit_codes: Vec<i32>,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            idempotent: true,
            required: true,
            accepted_exit_codes: vec![0],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageEntry {
    id: String,
    #[serde(default)]
    description: String,
    action: ActionSpec,
    #[serde(default)]
    depends_on: Vec<String>,
    idempotent: Option<bool>,
    required: Option<bool>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    accepted_exit_codes: Option<Vec<i32>>,
    #[serde(default)]
    platforms: Vec<String>,
    #[serde(default)]
    probe: ProbeSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CatalogFile {
    name: Option<String>,
    vars: BTreeMap<String, String>,
    defaults: StageDefaults,
    retry: RetryConfig,
    classification: ClassificationTable,
    stages: Vec<StageEntry>,
}

/// A validated, rendered catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    name: String,
    retry: RetryConfig,
    classification: ClassificationTable,
    stages: Vec<StageDefinition>,
}

impl Catalog {
    /// Creates a catalog from already-rendered stages.
    ///
    /// # Errors
    ///
    /// Returns an error if the stages violate any catalog invariant.
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Result<Self, CatalogError> {
        let catalog = Self {
            name: name.into(),
            retry: RetryConfig::default(),
            classification: ClassificationTable::default(),
            stages,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Sets the retry config.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the classification table.
    #[must_use]
    pub fn with_classification(mut self, table: ClassificationTable) -> Self {
        self.classification = table;
        self
    }

    /// Loads, renders and validates a catalog file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, references an
    /// unknown placeholder, or violates a catalog invariant.
    pub fn load(path: &Path, platform: &Platform) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::new(format!("Cannot read catalog {}: {e}", path.display()))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let catalog = if is_json {
            Self::parse_json(&contents, platform)
        } else {
            Self::parse_toml(&contents, platform)
        }?;

        tracing::debug!(
            catalog = %catalog.name,
            path = %path.display(),
            stages = catalog.len(),
            "Catalog loaded"
        );
        Ok(catalog)
    }

    /// Parses a TOML catalog.
    ///
    /// # Errors
    ///
    /// See [`Catalog::load`].
    pub fn parse_toml(contents: &str, platform: &Platform) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(contents)
            .map_err(|e| CatalogError::new(format!("Invalid catalog TOML: {e}")))?;
        Self::from_file(file, platform)
    }

    /// Parses a JSON catalog.
    ///
    /// # Errors
    ///
    /// See [`Catalog::load`].
    pub fn parse_json(contents: &str, platform: &Platform) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(contents)
            .map_err(|e| CatalogError::new(format!("Invalid catalog JSON: {e}")))?;
        Self::from_file(file, platform)
    }

    fn from_file(file: CatalogFile, platform: &Platform) -> Result<Self, CatalogError> {
        let ctx = TemplateContext::new(file.vars)
            .with_var("platform", platform.id())
            .with_var("os", platform.os.clone())
            .with_var("arch", platform.arch.clone());
        let defaults = file.defaults;

        let stages = file
            .stages
            .into_iter()
            .map(|entry| render_stage(entry, &defaults, &ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let stages = retain_platform(stages, platform);

        Ok(Self::new(file.name.unwrap_or_else(|| "catalog".to_string()), stages)?
            .with_retry(file.retry)
            .with_classification(file.classification))
    }

    /// Checks every catalog invariant.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: empty catalog, invalid stage,
    /// duplicate id, unknown dependency, or cycle.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.stages.is_empty() {
            return Err(CatalogError::new("Catalog has no stages").with_error_info(
                ContractErrorInfo::new("CATALOG-004-EMPTY", "Empty catalog")
                    .with_fix_hint(ContractSuggestions::get("CATALOG-004-EMPTY").unwrap_or_default()),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.id.as_str()) {
                return Err(CatalogError::new(format!("Duplicate stage id '{}'", stage.id))
                    .with_stages(vec![stage.id.clone()])
                    .with_error_info(
                        ContractErrorInfo::new("CATALOG-004-DUPLICATE", "Duplicate stage id")
                            .with_fix_hint(
                                ContractSuggestions::get("CATALOG-004-DUPLICATE").unwrap_or_default(),
                            ),
                    ));
            }
        }

        for stage in &self.stages {
            if let Some(dep) = stage.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(CatalogError::missing_dependency(&stage.id, dep));
            }
        }

        if let Some(cycle) = detect_cycle(&self.stages) {
            return Err(cycle.into());
        }
        Ok(())
    }

    /// Catalog name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if there are no stages (never true for a validated catalog).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Retry configuration.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Failure classification table.
    #[must_use]
    pub fn classification(&self) -> &ClassificationTable {
        &self.classification
    }

    /// Fingerprint over all stage definitions, in order.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let joined = self
            .stages
            .iter()
            .map(StageDefinition::definition_hash)
            .collect::<Vec<_>>()
            .join(":");
        sha256_hex(joined.as_bytes())
    }
}

fn render_stage(
    entry: StageEntry,
    defaults: &StageDefaults,
    ctx: &TemplateContext,
) -> Result<StageDefinition, CatalogError> {
    let id = entry.id;
    let render = |s: &str| ctx.render(&id, s);

    let action = ActionSpec {
        command: render(&entry.action.command)?,
        args: entry
            .action
            .args
            .iter()
            .map(|a| render(a))
            .collect::<Result<_, _>>()?,
        working_dir: entry
            .action
            .working_dir
            .as_deref()
            .map(|p| ctx.render_path(&id, p))
            .transpose()?,
        env: entry
            .action
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), render(v)?)))
            .collect::<Result<_, CatalogError>>()?,
    };

    let probe = match entry.probe {
        ProbeSpec::None => ProbeSpec::None,
        ProbeSpec::Command { program, args, expect } => ProbeSpec::Command {
            program: render(&program)?,
            args: args.iter().map(|a| render(a)).collect::<Result<_, _>>()?,
            expect,
        },
        ProbeSpec::PathExists { path } => ProbeSpec::PathExists {
            path: ctx.render_path(&id, &path)?,
        },
        ProbeSpec::FileSha256 { path, sha256 } => ProbeSpec::FileSha256 {
            path: ctx.render_path(&id, &path)?,
            sha256: render(&sha256)?.to_ascii_lowercase(),
        },
    };

    Ok(StageDefinition {
        description: entry.description,
        action,
        depends_on: entry.depends_on,
        idempotent: entry.idempotent.unwrap_or(defaults.idempotent),
        required: entry.required.unwrap_or(defaults.required),
        timeout_secs: entry.timeout_secs.unwrap_or(defaults.timeout_secs),
        max_retries: entry.max_retries.unwrap_or(defaults.max_retries),
        accepted_exit_codes: entry
            .accepted_exit_codes
            .unwrap_or_else(|| defaults.accepted_exit_codes.clone()),
        platforms: entry.platforms,
        probe,
        id,
    })
}

/// Drops the stages that do not target `platform`.
///
/// Dependents of a dropped stage inherit its dependencies, so the remaining
/// stages keep their relative order.
fn retain_platform(stages: Vec<StageDefinition>, platform: &Platform) -> Vec<StageDefinition> {
    let dropped: BTreeMap<String, Vec<String>> = stages
        .iter()
        .filter(|s| !s.supports(platform))
        .map(|s| (s.id.clone(), s.depends_on.clone()))
        .collect();
    if dropped.is_empty() {
        return stages;
    }
    for id in dropped.keys() {
        tracing::info!(stage = %id, platform = %platform, "Stage does not target this platform, leaving it out");
    }

    stages
        .into_iter()
        .filter(|s| !dropped.contains_key(&s.id))
        .map(|mut s| {
            s.depends_on = inherit_dependencies(&s.depends_on, &dropped);
            s
        })
        .collect()
}

fn inherit_dependencies(deps: &[String], dropped: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut resolved = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<&String> = deps.iter().rev().collect();
    while let Some(dep) = stack.pop() {
        if !visited.insert(dep.as_str()) {
            continue;
        }
        match dropped.get(dep) {
            Some(inherited) => stack.extend(inherited.iter().rev()),
            None => resolved.push(dep.clone()),
        }
    }
    resolved
}

/// Default catalog path when neither flag nor environment supplies one.
#[must_use]
pub fn default_catalog_path() -> PathBuf {
    PathBuf::from("envforge.toml")
}
