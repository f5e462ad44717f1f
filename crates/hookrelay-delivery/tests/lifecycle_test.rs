//! Integration tests for replay, routing reload, recovery and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use hookrelay_core::{
    models::{EventId, EventStatus, RoutingConfig},
    DispatchEvent, NoOpEventHandler, RealClock, TestClock,
};
use hookrelay_delivery::{
    retry::INTERRUPTED_ERROR, BackoffStrategy, ClientConfig, DeliveryError, Dispatcher,
    DispatcherConfig, IntakeConfig, RetryPolicy,
};
use hookrelay_testing::{
    destination, fast_config, refused_url, routing, EventBuilder, FailureKind, MockDestination,
    MockEventSource, RecordingEventHandler, TestHarness,
};

async fn delivered_harness(web: &MockDestination) -> Result<TestHarness> {
    let harness = TestHarness::new(routing(
        vec![destination("web", web.url()), destination("audit", web.url_for("/audit"))],
        &[("stripe", "web")],
    ))?;
    harness.seed().await?;
    harness.publish(EventBuilder::new().id("e1").build()).await;
    harness.poll_and_settle().await?;
    Ok(harness)
}

#[tokio::test]
async fn replay_resends_without_touching_original_status() -> Result<()> {
    let web = MockDestination::healthy().await;
    let harness = delivered_harness(&web).await?;
    let history_before = harness.history("e1").await;

    let replay_id = harness.dispatcher.replay(&EventId::new("e1"), None).await?;
    harness.settle().await;

    assert!(replay_id.as_str().starts_with("e1:replay:"));
    assert_eq!(web.forwarded_count().await, 2);
    assert_eq!(harness.history("e1").await, history_before);
    assert!(harness.history(replay_id.as_str()).await.is_empty());

    let outcomes = harness.broker.outcomes_for(&EventId::new("e1"), "web").await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[1].lineage_id, replay_id);
    assert_eq!(outcomes[1].attempt_number, 1);
    Ok(())
}

#[tokio::test]
async fn replay_to_named_destination_ignores_rules() -> Result<()> {
    let web = MockDestination::healthy().await;
    let harness = delivered_harness(&web).await?;

    harness.dispatcher.replay(&EventId::new("e1"), Some("audit")).await?;
    harness.settle().await;

    let paths: Vec<_> =
        web.forwarded_requests().await.iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(paths, vec!["/", "/audit"]);
    Ok(())
}

#[tokio::test]
async fn replay_rejects_unknown_and_active_events() -> Result<()> {
    let web = MockDestination::healthy().await;
    let harness = delivered_harness(&web).await?;
    harness.publish(EventBuilder::new().id("queued").build()).await;

    let err = harness.dispatcher.replay(&EventId::new("missing"), None).await.unwrap_err();
    assert_eq!(err, DeliveryError::not_found("missing"));

    let err = harness.dispatcher.replay(&EventId::new("queued"), None).await.unwrap_err();
    assert_eq!(err.to_string(), "event queued is pending and cannot be replayed");

    let err = harness.dispatcher.replay(&EventId::new("e1"), Some("nowhere")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    Ok(())
}

#[tokio::test]
async fn replay_of_failed_event_gets_fresh_budget() -> Result<()> {
    let web = MockDestination::start().await;
    web.fail_then_succeed(FailureKind::SLOW, 2).await;
    let harness =
        TestHarness::new(routing(vec![destination("web", web.url())], &[("stripe", "web")]))?;
    harness.seed().await?;

    harness.publish(EventBuilder::new().id("e1").max_retries(1).build()).await;
    harness.poll_and_settle().await?;
    assert_eq!(harness.status("e1").await, Some(EventStatus::Failed));

    harness.dispatcher.replay(&EventId::new("e1"), None).await?;
    harness.settle().await;

    assert_eq!(harness.status("e1").await, Some(EventStatus::Failed));
    let outcomes = harness.broker.outcomes_for(&EventId::new("e1"), "web").await;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2].outcome.http_status, Some(200));
    Ok(())
}

#[tokio::test]
async fn reloaded_routing_applies_to_new_events() -> Result<()> {
    let old = MockDestination::healthy().await;
    let new = MockDestination::healthy().await;
    let harness =
        TestHarness::new(routing(vec![destination("old", old.url())], &[("stripe", "old")]))?;
    harness.seed().await?;

    harness
        .dispatcher
        .reload_routing(routing(vec![destination("new", new.url())], &[("*", "new")]));
    harness.publish(EventBuilder::new().id("e1").build()).await;
    harness.poll_and_settle().await?;

    assert_eq!(old.forwarded_count().await, 0);
    assert_eq!(new.forwarded_count().await, 1);
    assert!(harness.dispatcher.routing().destination("old").is_none());
    Ok(())
}

#[tokio::test]
async fn interrupted_event_resumes_with_spent_attempt_counted() -> Result<()> {
    let web = MockDestination::healthy().await;
    let harness =
        TestHarness::new(routing(vec![destination("web", web.url())], &[("stripe", "web")]))?;
    harness
        .publish(
            EventBuilder::new().id("e1").status(EventStatus::Processing).retry_count(1).build(),
        )
        .await;

    assert_eq!(harness.poll_and_settle().await?, 1);

    assert_eq!(harness.history("e1").await, vec![
        (EventStatus::Pending, Some(2)),
        (EventStatus::Completed, Some(2)),
    ]);
    assert_eq!(web.forwarded_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn interrupted_event_without_budget_fails() -> Result<()> {
    let web = MockDestination::healthy().await;
    let harness =
        TestHarness::new(routing(vec![destination("web", web.url())], &[("stripe", "web")]))?;
    harness
        .publish(
            EventBuilder::new()
                .id("e1")
                .status(EventStatus::Processing)
                .retry_count(3)
                .max_retries(3)
                .build(),
        )
        .await;

    assert_eq!(harness.poll_and_settle().await?, 0);

    let event = harness.broker.event(&EventId::new("e1")).await.unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry_count, 3);
    assert_eq!(
        event.failure_reason.unwrap(),
        format!("network connection failed: {INTERRUPTED_ERROR}")
    );
    assert_eq!(web.forwarded_count().await, 0);
    Ok(())
}

fn dispatcher_on(
    broker: &MockEventSource,
    routing: RoutingConfig,
    config: DispatcherConfig,
    clock: Arc<dyn hookrelay_core::Clock>,
) -> Result<Dispatcher> {
    Ok(Dispatcher::new(
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        routing,
        config,
        clock,
        Arc::new(NoOpEventHandler::new()),
    )?)
}

#[tokio::test]
async fn restart_resumes_event_waiting_on_retry() -> Result<()> {
    let broker = MockEventSource::new();
    let id = EventId::new("e1");

    let first = dispatcher_on(
        &broker,
        routing(vec![destination("web", refused_url())], &[("stripe", "web")]),
        DispatcherConfig {
            retry: RetryPolicy::deterministic(
                Duration::from_secs(30),
                Duration::from_secs(30),
                BackoffStrategy::Fixed,
            ),
            ..fast_config()
        },
        Arc::new(RealClock::new()),
    )?;
    first.poll_once().await?;
    broker.add_event(EventBuilder::new().id("e1").build()).await;
    assert_eq!(first.poll_once().await?, 1);
    while broker.event(&id).await.unwrap().retry_count == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    first.shutdown().await?;
    let waiting = broker.event(&id).await.unwrap();
    assert_eq!((waiting.status, waiting.retry_count), (EventStatus::Pending, 1));

    let web = MockDestination::healthy().await;
    let second = dispatcher_on(
        &broker,
        routing(vec![destination("web", web.url())], &[("stripe", "web")]),
        fast_config(),
        Arc::new(TestClock::new()),
    )?;
    assert_eq!(second.poll_once().await?, 1);
    second.drain().await;

    assert_eq!(web.forwarded_count().await, 1);
    let event = broker.event(&id).await.unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.retry_count, 1);

    let outcomes = broker.outcomes_for(&id, "web").await;
    assert_eq!(outcomes.iter().map(|r| r.attempt_number).collect::<Vec<_>>(), vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn interrupted_event_without_destinations_is_skipped() -> Result<()> {
    let harness = TestHarness::new(routing(vec![], &[]))?;
    harness
        .publish(EventBuilder::new().id("e1").status(EventStatus::Processing).build())
        .await;

    assert_eq!(harness.poll_and_settle().await?, 0);

    assert!(harness.history("e1").await.is_empty());
    assert_eq!(harness.dispatcher.stats().events_skipped, 1);
    assert_eq!(harness.events.count(|e| matches!(e, DispatchEvent::Skipped(_))), 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_aborts_in_flight_delivery_and_keeps_processing() -> Result<()> {
    let web = MockDestination::start().await;
    web.always_fail(FailureKind::Timeout { delay: Duration::from_secs(30) }).await;

    let broker = MockEventSource::new();
    let events = RecordingEventHandler::new();
    let config = DispatcherConfig {
        intake: IntakeConfig {
            webhook_scope: "test".into(),
            poll_interval: Duration::from_millis(20),
        },
        client: ClientConfig { timeout: Duration::from_secs(60), ..ClientConfig::default() },
        shutdown_timeout: Duration::from_secs(5),
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        routing(vec![destination("web", web.url())], &[("stripe", "web")]),
        config,
        Arc::new(RealClock::new()),
        events.clone(),
    )?;

    dispatcher.start();
    dispatcher.start();
    while broker.list_calls().await < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    broker.add_event(EventBuilder::new().id("e1").build()).await;
    events.wait_for(1, |e| matches!(e, DispatchEvent::AttemptStarted(_))).await;
    assert_eq!(dispatcher.stats().in_flight, 1);

    dispatcher.shutdown().await?;

    let id = EventId::new("e1");
    assert_eq!(broker.event(&id).await.unwrap().status, EventStatus::Processing);
    assert!(broker.recorded_outcomes().await.is_empty());
    assert_eq!(dispatcher.stats().in_flight, 0);

    let calls = broker.list_calls().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.list_calls().await, calls);
    Ok(())
}
