//! Core value types shared across the orchestrator.

mod event;
mod run;
mod status;

pub use event::{kinds, RunEvent};
pub use run::{CapturedOutput, ExitStatus, StageRun, TRUNCATION_MARKER_PREFIX};
pub use status::{AttemptOutcome, RunOutcome, StageStatus};
