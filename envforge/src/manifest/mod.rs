//! Durable per-stage run state.
//!
//! The manifest is the only mutable state shared between concurrently
//! running stages. Every change goes through [`ManifestStore::update`],
//! which serializes writers behind an async lock and persists the whole
//! document before returning.

mod entry;
mod store;

pub use entry::{Manifest, ManifestEntry, MANIFEST_SCHEMA_VERSION};
pub use store::{EntryUpdate, FileManifestStore, InMemoryManifestStore, ManifestStore};

use std::path::PathBuf;

/// Default manifest path when neither flag nor environment supplies one.
#[must_use]
pub fn default_manifest_path() -> PathBuf {
    PathBuf::from(".envforge").join("manifest.json")
}
