//! Test assertions for manifests.

use crate::core::StageStatus;
use crate::manifest::Manifest;

/// Asserts that a stage has the expected status.
pub fn assert_stage_status(manifest: &Manifest, stage_id: &str, expected: StageStatus) {
    let actual = manifest.entry(stage_id).map(|e| e.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage_id}' to be {expected}, got {actual:?}"
    );
}

/// Asserts that a stage was blocked by a specific ancestor.
pub fn assert_blocked_by(manifest: &Manifest, stage_id: &str, ancestor: &str) {
    assert_stage_status(manifest, stage_id, StageStatus::Blocked);
    let blocked_by = manifest.entry(stage_id).and_then(|e| e.blocked_by.as_deref());
    assert_eq!(
        blocked_by,
        Some(ancestor),
        "Expected stage '{stage_id}' to be blocked by '{ancestor}'"
    );
}

/// Asserts that a stage's last error mentions `needle`.
pub fn assert_last_error_contains(manifest: &Manifest, stage_id: &str, needle: &str) {
    let error = manifest.entry(stage_id).and_then(|e| e.last_error.clone());
    assert!(
        error.as_deref().is_some_and(|e| e.contains(needle)),
        "Expected last error of '{stage_id}' to contain '{needle}', got {error:?}"
    );
}

/// Asserts the number of attempts recorded for a stage.
pub fn assert_attempts(manifest: &Manifest, stage_id: &str, expected: u32) {
    let actual = manifest.entry(stage_id).map(|e| e.attempts);
    assert_eq!(
        actual,
        Some(expected),
        "Expected {expected} attempts for '{stage_id}', got {actual:?}"
    );
}
