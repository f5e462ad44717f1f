//! Dispatcher wired to an in-memory broker and a virtual clock.
//!
//! Backoff sleeps complete instantly on the `TestClock`, so retry sequences
//! run in milliseconds. HTTP still goes over real loopback sockets to
//! `MockDestination` servers.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use hookrelay_core::{
    models::{EventId, EventStatus, RoutingConfig, StatusUpdate, WebhookEvent},
    Clock, TestClock,
};
use hookrelay_delivery::{
    source::mock::MockEventSource, BackoffStrategy, ClientConfig, Dispatcher, DispatcherConfig,
    HealthConfig, IntakeConfig, RetryPolicy,
};

use crate::events::RecordingEventHandler;

/// Client timeout used by `fast_config`.
pub const FAST_CLIENT_TIMEOUT: Duration = Duration::from_millis(100);

/// A dispatcher plus everything needed to drive and observe it.
#[derive(Debug)]
pub struct TestHarness {
    /// In-memory broker serving events and recording writes.
    pub broker: MockEventSource,
    /// Virtual clock driving backoff and probe intervals.
    pub clock: TestClock,
    /// Every notification the dispatcher emitted.
    pub events: Arc<RecordingEventHandler>,
    /// The dispatcher under test.
    pub dispatcher: Dispatcher,
}

impl TestHarness {
    /// Harness using `fast_config`.
    pub fn new(routing: RoutingConfig) -> Result<Self> {
        Self::with_config(routing, fast_config())
    }

    /// Harness with an explicit configuration.
    pub fn with_config(routing: RoutingConfig, config: DispatcherConfig) -> Result<Self> {
        let broker = MockEventSource::new();
        let clock = TestClock::new();
        let events = RecordingEventHandler::new();

        let dispatcher = Dispatcher::new(
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            routing,
            config,
            Arc::new(clock.clone()) as Arc<dyn Clock>,
            events.clone(),
        )?;

        Ok(Self { broker, clock, events, dispatcher })
    }

    /// Runs the seeding poll so later events count as new.
    pub async fn seed(&self) -> Result<()> {
        self.dispatcher.poll_once().await?;
        self.settle().await;
        Ok(())
    }

    /// Queues an event at the broker.
    pub async fn publish(&self, event: WebhookEvent) {
        self.broker.add_event(event).await;
    }

    /// Polls once and waits for every lineage it started.
    pub async fn poll_and_settle(&self) -> Result<usize> {
        let started = self.dispatcher.poll_once().await?;
        self.settle().await;
        Ok(started)
    }

    /// Waits for all running lineages.
    pub async fn settle(&self) {
        self.dispatcher.drain().await;
    }

    /// Current broker-side status of an event.
    pub async fn status(&self, id: &str) -> Option<EventStatus> {
        self.broker.event(&EventId::new(id)).await.map(|event| event.status)
    }

    /// Status writes for an event as `(status, retry_count)` pairs.
    pub async fn history(&self, id: &str) -> Vec<(EventStatus, Option<u32>)> {
        self.broker
            .status_history(&EventId::new(id))
            .await
            .into_iter()
            .map(|StatusUpdate { status, retry_count, .. }| (status, retry_count))
            .collect()
    }
}

/// Configuration tuned for tests: short client timeout, no jitter.
pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        intake: IntakeConfig {
            webhook_scope: "test".to_string(),
            poll_interval: Duration::from_secs(1),
        },
        client: ClientConfig { timeout: FAST_CLIENT_TIMEOUT, ..ClientConfig::default() },
        health: HealthConfig {
            probe_timeout: Duration::from_millis(200),
            healthy_interval: Duration::from_secs(5),
            unhealthy_interval: Duration::from_secs(1),
        },
        retry: RetryPolicy::deterministic(
            Duration::from_secs(1),
            Duration::from_secs(60),
            BackoffStrategy::Exponential,
        ),
        gate_on_health: true,
        shutdown_timeout: Duration::from_secs(5),
    }
}
