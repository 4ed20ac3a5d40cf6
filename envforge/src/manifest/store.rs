//! Manifest stores.

use super::{Manifest, ManifestEntry};
use crate::errors::ManifestError;
use crate::utils::now_utc;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A mutation applied to one entry under the store lock.
pub type EntryUpdate = Box<dyn FnOnce(&mut ManifestEntry) + Send>;

/// Durable, atomically updated manifest storage.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Reads the persisted manifest, `None` if nothing has been written yet.
    async fn load(&self) -> Result<Option<Manifest>, ManifestError>;

    /// Returns a consistent copy of the current manifest.
    async fn snapshot(&self) -> Result<Manifest, ManifestError>;

    /// Replaces the whole manifest.
    async fn replace(&self, manifest: Manifest) -> Result<(), ManifestError>;

    /// Atomically applies `mutate` to one entry, persists the result and
    /// returns the updated entry. Updates never interleave.
    async fn update(&self, stage_id: &str, mutate: EntryUpdate) -> Result<ManifestEntry, ManifestError>;
}

fn apply(manifest: &mut Manifest, stage_id: &str, mutate: EntryUpdate) -> Result<ManifestEntry, ManifestError> {
    let entry = manifest
        .stages
        .get_mut(stage_id)
        .ok_or_else(|| ManifestError::UnknownStage(stage_id.to_string()))?;
    mutate(entry);
    entry.updated_at = now_utc();
    Ok(entry.clone())
}

/// Persists the manifest as pretty JSON next to a temp file that is renamed
/// into place, so readers never observe a torn file.
#[derive(Debug)]
pub struct FileManifestStore {
    path: PathBuf,
    state: Mutex<Option<Manifest>>,
}

impl FileManifestStore {
    /// Creates a store for a path. Nothing is read until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    /// The manifest path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ManifestError {
        ManifestError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn read_file(&self) -> Result<Option<Manifest>, ManifestError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Manifest::from_json(&self.path, &contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn write_file(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let json = manifest.to_json().map_err(|e| ManifestError::Malformed {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| self.io_error(e))?;

        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "manifest.json".into(), |n| n.to_string_lossy().into_owned());
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| self.io_error(e))?;
        file.write_all(json.as_bytes()).await.map_err(|e| self.io_error(e))?;
        file.write_all(b"\n").await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_error(e))?;

        sync_dir(&dir).await;
        Ok(())
    }
}

/// Flushes a directory entry so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        if let Err(e) = handle.sync_all().await {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory sync failed");
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

#[async_trait]
impl ManifestStore for FileManifestStore {
    async fn load(&self) -> Result<Option<Manifest>, ManifestError> {
        let loaded = self.read_file().await?;
        if let Some(manifest) = &loaded {
            tracing::debug!(
                path = %self.path.display(),
                run_id = %manifest.run_id,
                stages = manifest.stages.len(),
                "Manifest loaded"
            );
        }
        Ok(loaded)
    }

    async fn snapshot(&self) -> Result<Manifest, ManifestError> {
        let state = self.state.lock().await;
        if let Some(manifest) = state.as_ref() {
            return Ok(manifest.clone());
        }
        drop(state);
        self.read_file().await?.ok_or_else(|| {
            self.io_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no manifest has been written yet",
            ))
        })
    }

    async fn replace(&self, manifest: Manifest) -> Result<(), ManifestError> {
        let mut state = self.state.lock().await;
        self.write_file(&manifest).await?;
        *state = Some(manifest);
        Ok(())
    }

    async fn update(&self, stage_id: &str, mutate: EntryUpdate) -> Result<ManifestEntry, ManifestError> {
        let mut state = self.state.lock().await;
        let mut next = match state.as_ref() {
            Some(manifest) => manifest.clone(),
            None => self
                .read_file()
                .await?
                .ok_or_else(|| ManifestError::UnknownStage(stage_id.to_string()))?,
        };
        let entry = apply(&mut next, stage_id, mutate)?;
        self.write_file(&next).await?;
        *state = Some(next);
        Ok(entry)
    }
}

/// Keeps the manifest in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    state: Mutex<Option<Manifest>>,
    writes: AtomicUsize,
}

impl InMemoryManifestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds a manifest, as if written by an
    /// earlier run.
    #[must_use]
    pub fn with_manifest(manifest: Manifest) -> Self {
        Self {
            state: Mutex::new(Some(manifest)),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of writes (replace or update) performed.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn load(&self) -> Result<Option<Manifest>, ManifestError> {
        Ok(self.state.lock().await.clone())
    }

    async fn snapshot(&self) -> Result<Manifest, ManifestError> {
        self.state.lock().await.clone().ok_or_else(|| {
            ManifestError::Malformed {
                path: PathBuf::from("<memory>"),
                message: "no manifest has been written yet".to_string(),
            }
        })
    }

    async fn replace(&self, manifest: Manifest) -> Result<(), ManifestError> {
        *self.state.lock().await = Some(manifest);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, stage_id: &str, mutate: EntryUpdate) -> Result<ManifestEntry, ManifestError> {
        let mut state = self.state.lock().await;
        let manifest = state
            .as_mut()
            .ok_or_else(|| ManifestError::UnknownStage(stage_id.to_string()))?;
        let entry = apply(manifest, stage_id, mutate)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(entry)
    }
}
