//! `{{name}}` placeholder rendering for stage actions and probes.

use crate::errors::{CatalogError, ContractErrorInfo, ContractSuggestions};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// The pattern is a literal; it cannot fail to compile.
#[allow(clippy::unwrap_used)]
fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap())
}

/// Renders placeholders from a fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Creates a context from variables.
    #[must_use]
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Adds or replaces a variable.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Renders one string.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unknown placeholder.
    pub fn render(&self, stage_id: &str, input: &str) -> Result<String, CatalogError> {
        let mut missing: Option<String> = None;
        let rendered = placeholder().replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            if let Some(value) = self.vars.get(name) {
                value.clone()
            } else {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        });

        match missing {
            Some(name) => Err(CatalogError::new(format!(
                "Stage '{stage_id}' references unknown placeholder '{{{{{name}}}}}'"
            ))
            .with_stages(vec![stage_id.to_string()])
            .with_error_info(
                ContractErrorInfo::new("CATALOG-005-TEMPLATE", "Unknown placeholder")
                    .with_fix_hint(ContractSuggestions::get("CATALOG-005-TEMPLATE").unwrap_or_default())
                    .with_context_entry("placeholder", name),
            )),
            None => Ok(rendered.into_owned()),
        }
    }

    /// Renders a path.
    ///
    /// # Errors
    ///
    /// See [`TemplateContext::render`].
    pub fn render_path(&self, stage_id: &str, path: &Path) -> Result<PathBuf, CatalogError> {
        self.render(stage_id, &path.to_string_lossy()).map(PathBuf::from)
    }
}
