//! Webhook dispatcher with retries and health-gated routing.
//!
//! This crate polls a remote broker for captured webhook events, routes each
//! event to its destinations by source, forwards the original request and
//! writes every attempt and status change back to the broker.
//!
//! # Architecture
//!
//! One task runs per (event, destination) lineage:
//!
//! 1. **Intake** - Poll the broker, deduplicate by event id
//! 2. **Routing** - Match rules against the event source
//! 3. **Health Gate** - Skip destinations whose last probe failed
//! 4. **Delivery** - Forward method, headers and body verbatim
//! 5. **Retry** - Back off and retry until the budget is spent
//!
//! # Key Features
//!
//! - **Fan-out** - Independent lineages per destination
//! - **Recovery** - Events left `processing` resume on restart
//! - **Replay** - Terminal events can be re-sent without touching history
//! - **Hot Reload** - Routing snapshots are swapped atomically
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookrelay_core::{NoOpEventHandler, RealClock, RoutingConfig};
//! use hookrelay_delivery::{BrokerClient, BrokerConfig, Dispatcher, DispatcherConfig};
//!
//! # async fn example() -> hookrelay_delivery::Result<()> {
//! let broker = Arc::new(BrokerClient::new(BrokerConfig::new("http://broker:8080/api"))?);
//! let dispatcher = Dispatcher::new(
//!     broker.clone(),
//!     broker,
//!     RoutingConfig::default(),
//!     DispatcherConfig::default(),
//!     Arc::new(RealClock::new()),
//!     Arc::new(NoOpEventHandler::new()),
//! )?;
//!
//! dispatcher.start();
//! # dispatcher.shutdown().await
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod engine;
pub mod error;
pub mod health;
pub mod intake;
pub mod retry;
pub mod routing;
pub mod source;

pub use broker::{BrokerClient, BrokerConfig};
pub use client::{Attempt, ClientConfig, DeliveryClient};
pub use engine::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use health::{HealthConfig, HealthMonitor};
pub use intake::{EventIntake, IntakeConfig};
pub use retry::{BackoffStrategy, RetryCoordinator, RetryPolicy};
pub use source::{EventSource, OutcomeSink};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = hookrelay_core::models::DEFAULT_MAX_RETRIES;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
