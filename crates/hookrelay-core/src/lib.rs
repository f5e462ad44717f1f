//! Core domain models and notifications for the webhook relay.
//!
//! Provides strongly-typed events, destinations, routing rules and delivery
//! outcomes shared by the dispatcher, the broker client and the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AttemptFailedEvent, AttemptStartedEvent, DeliveredEvent, DispatchEvent, EventHandler,
    ExhaustedEvent, NoOpEventHandler, SkippedEvent,
};
pub use models::{
    BodyEncoding, DeliveryOutcome, DeliveryRecord, DeliveryRule, DeliveryTask, Destination,
    EventId, EventStatus, HealthProbe, HealthRecord, LineageKey, OriginRequest, OutcomeStatus,
    RoutingConfig, SourceMatch, StatusUpdate, WebhookEvent, DEFAULT_MAX_RETRIES,
};
pub use time::{Clock, RealClock, TestClock};
