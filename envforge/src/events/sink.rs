//! Event sink trait and implementations.

use crate::core::RunEvent;
use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Receives run lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: RunEvent);

    /// Emits an event without blocking. Must never panic; failures are
    /// logged and suppressed.
    fn try_emit(&self, event: RunEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: RunEvent) {}

    fn try_emit(&self, _event: RunEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &RunEvent) {
        let stage = event.stage_id.as_deref().unwrap_or("-");
        let data = serde_json::to_string(&event.data).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                run_id = %event.run_id,
                stage = %stage,
                data = %data,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                event_type = %event.event_type,
                run_id = %event.run_id,
                stage = %stage,
                data = %data,
                "Event: {}", event.event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: RunEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: RunEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<RunEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose type starts with a prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the events about one stage.
    #[must_use]
    pub fn events_for_stage(&self, stage_id: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_id.as_deref() == Some(stage_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: RunEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: RunEvent) {
        self.events.write().push(event);
    }
}

/// Forwards every event to several sinks.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Creates a fan-out over the given sinks.
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: RunEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }

    fn try_emit(&self, event: RunEvent) {
        for sink in &self.sinks {
            sink.try_emit(event.clone());
        }
    }
}
