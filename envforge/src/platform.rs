//! Target platform resolution.
//!
//! A platform identifier has the form `<os>-<arch>` (for example
//! `linux-x86_64`). Common aliases are folded onto one canonical spelling so
//! that catalog `platforms` filters and templated download URLs agree with
//! whatever the operator passes in `ENVFORGE_PLATFORM`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Architecture aliases, `(alias, canonical)`.
pub const ARCH_ALIASES: &[(&str, &str)] = &[
    ("x86_64", "x86_64"),
    ("amd64", "x86_64"),
    ("x64", "x86_64"),
    ("aarch64", "aarch64"),
    ("arm64", "aarch64"),
];

/// Operating system aliases, `(alias, canonical)`.
pub const OS_ALIASES: &[(&str, &str)] = &[
    ("linux", "linux"),
    ("darwin", "darwin"),
    ("macos", "darwin"),
    ("osx", "darwin"),
    ("mac", "darwin"),
    ("windows", "windows"),
    ("win", "windows"),
    ("win64", "windows"),
];

/// A resolved target platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Canonical operating system (or distribution) name.
    pub os: String,
    /// Canonical architecture.
    pub arch: String,
}

fn canonical(aliases: &[(&str, &str)], value: &str) -> String {
    let lower = value.trim().to_ascii_lowercase();
    aliases
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map_or(lower, |(_, canonical)| (*canonical).to_string())
}

/// Returns the canonical architecture name for an alias.
#[must_use]
pub fn canonical_arch(arch: &str) -> String {
    canonical(ARCH_ALIASES, arch)
}

/// Returns the canonical OS name for an alias. Unknown names (e.g. a Linux
/// distribution such as `ubuntu2204`) are kept, lowercased.
#[must_use]
pub fn canonical_os(os: &str) -> String {
    canonical(OS_ALIASES, os)
}

impl Platform {
    /// Creates a platform from possibly-aliased parts.
    #[must_use]
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: canonical_os(os),
            arch: canonical_arch(arch),
        }
    }

    /// Detects the platform this process is running on.
    #[must_use]
    pub fn detect() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Parses `<os>-<arch>`. The split happens at the last dash so that
    /// distribution names containing dashes survive.
    #[must_use]
    pub fn parse(id: &str) -> Option<Self> {
        let (os, arch) = id.trim().rsplit_once('-')?;
        if os.is_empty() || arch.is_empty() {
            return None;
        }
        Some(Self::new(os, arch))
    }

    /// Resolves an optional override (typically `ENVFORGE_PLATFORM`), falling
    /// back to detection when the override is absent or unparsable.
    #[must_use]
    pub fn resolve(override_id: Option<&str>) -> Self {
        match override_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => Self::parse(id).unwrap_or_else(|| {
                tracing::warn!(platform = id, "Unparsable platform override, using detected platform");
                Self::detect()
            }),
            None => Self::detect(),
        }
    }

    /// The `<os>-<arch>` identifier.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    /// Returns true if `candidate` names this platform, allowing aliases.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        Self::parse(candidate).is_some_and(|p| &p == self)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_fold() {
        assert_eq!(canonical_arch("AMD64"), "x86_64");
        assert_eq!(canonical_arch("arm64"), "aarch64");
        assert_eq!(canonical_os("macos"), "darwin");
        assert_eq!(canonical_os("ubuntu2204"), "ubuntu2204");
    }

    #[test]
    fn test_parse_splits_at_last_dash() {
        let p = Platform::parse("rocky-8-amd64").unwrap();
        assert_eq!(p.os, "rocky-8");
        assert_eq!(p.arch, "x86_64");
        assert_eq!(p.id(), "rocky-8-x86_64");

        assert!(Platform::parse("linux").is_none());
        assert!(Platform::parse("-x86_64").is_none());
    }

    #[test]
    fn test_matches_with_aliases() {
        let p = Platform::new("linux", "x86_64");
        assert!(p.matches("linux-amd64"));
        assert!(p.matches("Linux-x64"));
        assert!(!p.matches("darwin-x86_64"));
    }

    #[test]
    fn test_resolve_override() {
        let p = Platform::resolve(Some("osx-arm64"));
        assert_eq!(p.id(), "darwin-aarch64");
        assert_eq!(Platform::resolve(None), Platform::detect());
        assert_eq!(Platform::resolve(Some("  ")), Platform::detect());
    }
}
