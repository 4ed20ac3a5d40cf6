//! Lifecycle events emitted while a run progresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event type names.
pub mod kinds {
    /// The runner prepared the manifest and is about to schedule stages.
    pub const RUN_STARTED: &str = "run.started";
    /// Every stage reached a terminal status, or the run was torn down.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// An attempt was handed to the executor.
    pub const STAGE_STARTED: &str = "stage.started";
    /// An attempt failed and another one is scheduled after a backoff.
    pub const STAGE_RETRYING: &str = "stage.retrying";
    /// The stage ran and its effect was verified.
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    /// The stage failed for good.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// The stage will not run because an ancestor did not succeed.
    pub const STAGE_BLOCKED: &str = "stage.blocked";
    /// The stage already succeeded in a previous run.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
}

/// An event emitted by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// The event type, e.g. `stage.retrying`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// Run the event belongs to.
    pub run_id: String,

    /// Stage the event is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,

    /// Event payload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl RunEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            run_id: run_id.into(),
            stage_id: None,
            data: BTreeMap::new(),
        }
    }

    /// Creates a stage-level event.
    #[must_use]
    pub fn for_stage(
        event_type: impl Into<String>,
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(event_type, run_id);
        event.stage_id = Some(stage_id.into());
        event
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns a data field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}
