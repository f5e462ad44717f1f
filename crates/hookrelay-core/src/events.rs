//! Dispatch notifications for decoupled observers.
//!
//! The dispatcher emits a `DispatchEvent` at every step of a delivery
//! lineage. Observers such as metrics exporters or audit sinks implement
//! `EventHandler` and are handed to the dispatcher at construction, without
//! the dispatcher knowing what they do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::EventId;

/// Events emitted while dispatching webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchEvent {
    /// An attempt is about to be sent.
    AttemptStarted(AttemptStartedEvent),

    /// The destination answered.
    Delivered(DeliveredEvent),

    /// The attempt failed and may be retried.
    AttemptFailed(AttemptFailedEvent),

    /// The lineage gave up.
    Exhausted(ExhaustedEvent),

    /// An event matched no destination.
    Skipped(SkippedEvent),
}

impl DispatchEvent {
    /// Event the notification concerns.
    pub fn event_id(&self) -> &EventId {
        match self {
            Self::AttemptStarted(e) => &e.event_id,
            Self::Delivered(e) => &e.event_id,
            Self::AttemptFailed(e) => &e.event_id,
            Self::Exhausted(e) => &e.event_id,
            Self::Skipped(e) => &e.event_id,
        }
    }
}

/// Emitted right before an attempt is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStartedEvent {
    /// Event being delivered.
    pub event_id: EventId,

    /// Destination name.
    pub destination: String,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// When the attempt started.
    pub started_at: DateTime<Utc>,
}

/// Emitted when the destination returned any HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredEvent {
    /// Event that was delivered.
    pub event_id: EventId,

    /// Destination name.
    pub destination: String,

    /// HTTP status returned.
    pub http_status: u16,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// Attempt latency in milliseconds.
    pub latency_ms: u64,

    /// When delivery finished.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt failed at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    /// Event that failed.
    pub event_id: EventId,

    /// Destination name.
    pub destination: String,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// Error that caused the failure.
    pub error_message: String,

    /// Delay before the next attempt.
    pub next_retry_in_ms: u64,

    /// When the failure occurred.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when a lineage fails terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustedEvent {
    /// Event that failed.
    pub event_id: EventId,

    /// Destination name.
    pub destination: String,

    /// Retries consumed.
    pub retry_count: u32,

    /// Last error.
    pub error_message: String,

    /// When the lineage gave up.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when no rule routes an event anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEvent {
    /// Event that was skipped.
    pub event_id: EventId,

    /// Its source label.
    pub source: String,
}

/// Trait for observing dispatch events.
///
/// Handlers must not block dispatching. Failures are logged by the handler
/// and never propagated back.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a dispatch event.
    async fn handle_event(&self, event: DispatchEvent);
}

/// Handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DispatchEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped() -> DispatchEvent {
        DispatchEvent::Skipped(SkippedEvent {
            event_id: EventId::new("evt_1"),
            source: "github".to_string(),
        })
    }

    #[tokio::test]
    async fn no_op_handler_discards_events() {
        NoOpEventHandler::new().handle_event(skipped()).await;
    }

    #[test]
    fn event_id_accessor_covers_variants() {
        let event = DispatchEvent::Exhausted(ExhaustedEvent {
            event_id: EventId::new("evt_9"),
            destination: "web".to_string(),
            retry_count: 2,
            error_message: "request timed out".to_string(),
            failed_at: Utc::now(),
        });
        assert_eq!(event.event_id().as_str(), "evt_9");
        assert_eq!(skipped().event_id().as_str(), "evt_1");
    }
}
