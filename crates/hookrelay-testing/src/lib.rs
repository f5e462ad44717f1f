//! Test infrastructure for deterministic dispatcher testing.
//!
//! Provides event and routing builders, wiremock-backed destinations, a
//! recording event handler and a harness wiring the dispatcher to an
//! in-memory broker with virtual time.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod fixtures;
pub mod harness;
pub mod http;

pub use events::RecordingEventHandler;
pub use fixtures::{destination, probed_destination, routing, rule, scenarios, EventBuilder};
pub use harness::{fast_config, TestHarness, FAST_CLIENT_TIMEOUT};
pub use hookrelay_core::TestClock;
pub use hookrelay_delivery::source::mock::MockEventSource;
pub use http::{closed_address, refused_url, FailureKind, MockDestination};
