//! Event sinks for run observability.
//!
//! The runner reports every state transition as a [`crate::core::RunEvent`];
//! sinks decide where they go (logs, memory, several places at once).

mod sink;

pub use sink::{CollectingEventSink, EventSink, FanoutEventSink, LoggingEventSink, NoOpEventSink};
