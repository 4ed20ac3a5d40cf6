//! Readiness reporting.
//!
//! [`HealthService`] derives a [`HealthReport`] from the manifest store;
//! [`router`] exposes it as `GET /health`, answering 200 when ready and
//! 503 otherwise.

mod http;
mod report;

pub use http::{router, HealthServer};
pub use report::{HealthReport, StageHealth};

use crate::manifest::ManifestStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Bound on how long a health check waits for the manifest store.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Reads readiness from a manifest store.
#[derive(Clone)]
pub struct HealthService {
    store: Arc<dyn ManifestStore>,
    timeout: Duration,
}

impl HealthService {
    /// Creates a service over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ManifestStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Sets the store read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks readiness. A store error or timeout reports not ready.
    pub async fn check(&self) -> HealthReport {
        match tokio::time::timeout(self.timeout, self.store.snapshot()).await {
            Ok(Ok(manifest)) => HealthReport::from_manifest(&manifest),
            Ok(Err(e)) => {
                warn!(error = %e, "Health check could not read the manifest");
                HealthReport::unavailable(e.to_string())
            }
            Err(_) => {
                warn!(timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX), "Health check timed out");
                HealthReport::unavailable(crate::errors::ManifestError::Timeout.to_string())
            }
        }
    }
}

impl std::fmt::Debug for HealthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthService")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ManifestError;
    use crate::manifest::{EntryUpdate, InMemoryManifestStore, Manifest, ManifestEntry};
    use crate::testing::{catalog, stage};
    use async_trait::async_trait;

    struct StalledStore;

    #[async_trait]
    impl ManifestStore for StalledStore {
        async fn load(&self) -> Result<Option<Manifest>, ManifestError> {
            Ok(None)
        }

        async fn snapshot(&self) -> Result<Manifest, ManifestError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ManifestError::Timeout)
        }

        async fn replace(&self, _manifest: Manifest) -> Result<(), ManifestError> {
            Ok(())
        }

        async fn update(&self, stage_id: &str, _mutate: EntryUpdate) -> Result<ManifestEntry, ManifestError> {
            Err(ManifestError::UnknownStage(stage_id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_check_reads_store() {
        let mut manifest = Manifest::new(&catalog(vec![stage("a", &[])]));
        manifest.stages.get_mut("a").unwrap().mark_succeeded();
        let service = HealthService::new(Arc::new(InMemoryManifestStore::with_manifest(manifest)));
        assert!(service.check().await.ready);
    }

    #[tokio::test]
    async fn test_check_without_manifest_is_not_ready() {
        let report = HealthService::new(Arc::new(InMemoryManifestStore::new())).check().await;
        assert!(!report.ready);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_check_times_out() {
        let service = HealthService::new(Arc::new(StalledStore)).with_timeout(Duration::from_millis(20));
        let report = tokio::time::timeout(Duration::from_secs(5), service.check()).await.unwrap();
        assert!(!report.ready);
        assert!(report.error.unwrap().contains("Timed out"));
    }
}
