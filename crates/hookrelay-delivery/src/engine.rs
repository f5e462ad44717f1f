//! Dispatcher wiring intake, routing, health gating, delivery and retries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ EventIntake  │──▶│ routing        │──▶│ RetryCoordinator │
//! │ (poll+dedup) │   │ (fan-out)      │   │ (lineage state)  │
//! └──────────────┘   └────────────────┘   └──────────────────┘
//!                                                  │ one task per lineage
//!                                                  ▼
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ HealthMonitor│──▶│ health gate    │──▶│ DeliveryClient   │
//! └──────────────┘   └────────────────┘   └──────────────────┘
//!                                                  │
//!                                                  ▼
//!                                        OutcomeSink / EventSource
//! ```
//!
//! Each (event, destination) lineage runs as one task on a `TaskTracker`:
//! gate, send, record, decide, back off, repeat. Cancelling the shutdown
//! token aborts in-flight HTTP calls. Interrupted events keep the status
//! last reported (`processing`, or `pending` while a retry was due) and are
//! picked up again on the next start.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use hookrelay_core::{
    events::{
        AttemptFailedEvent, AttemptStartedEvent, DeliveredEvent, DispatchEvent, EventHandler,
        ExhaustedEvent, SkippedEvent,
    },
    models::{
        DeliveryRecord, DeliveryTask, Destination, EventId, EventStatus, RoutingConfig,
        StatusUpdate, WebhookEvent,
    },
    time::Clock,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    client::{Attempt, ClientConfig, DeliveryClient},
    error::{DeliveryError, ErrorCategory, Result},
    health::{HealthConfig, HealthMonitor},
    intake::{EventIntake, IntakeConfig},
    retry::{Next, Plan, RetryCoordinator, RetryPolicy},
    routing,
    source::{EventSource, OutcomeSink},
};

/// Configuration for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Polling scope and interval.
    pub intake: IntakeConfig,

    /// HTTP client settings for forwarding.
    pub client: ClientConfig,

    /// Probe timing.
    pub health: HealthConfig,

    /// Backoff between attempts.
    pub retry: RetryPolicy,

    /// Skip attempts to destinations whose last probe failed.
    pub gate_on_health: bool,

    /// Maximum time to wait for lineage tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            intake: IntakeConfig::default(),
            client: ClientConfig::default(),
            health: HealthConfig::default(),
            retry: RetryPolicy::default(),
            gate_on_health: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Events that produced at least one lineage.
    pub events_dispatched: u64,
    /// Events that matched no destination.
    pub events_skipped: u64,
    /// Attempts that got an HTTP response.
    pub successful_attempts: u64,
    /// Attempts that failed or were gated.
    pub failed_attempts: u64,
    /// Lineages that ended in `failed`.
    pub permanent_failures: u64,
    /// Lineages currently running or waiting on a retry.
    pub in_flight: usize,
}

/// The webhook dispatcher.
///
/// Cheap to clone; all clones drive the same state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// How an event reached the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    /// First seen by this process.
    Fresh,
    /// Left in `processing` by a previous run.
    Interrupted,
    /// Left waiting on a retry by a previous run.
    Resumed,
}

#[derive(Debug)]
struct Inner {
    config: DispatcherConfig,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn OutcomeSink>,
    routing: RwLock<Arc<RoutingConfig>>,
    client: DeliveryClient,
    health: HealthMonitor,
    coordinator: RetryCoordinator,
    intake: EventIntake,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    stats: RwLock<DispatcherStats>,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    intake_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given collaborators.
    ///
    /// Nothing runs until `start` or `poll_once` is called.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if an HTTP client cannot be
    /// built.
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn OutcomeSink>,
        routing: RoutingConfig,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let cancellation_token = CancellationToken::new();
        let client = DeliveryClient::new(config.client.clone())?;
        let health = HealthMonitor::new(
            config.health.clone(),
            Arc::clone(&clock),
            cancellation_token.clone(),
        )?;
        let coordinator = RetryCoordinator::new(config.retry.clone());
        let intake = EventIntake::new(Arc::clone(&source), config.intake.clone());

        routing::warn_issues(&routing);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                sink,
                routing: RwLock::new(Arc::new(routing)),
                client,
                health,
                coordinator,
                intake,
                clock,
                event_handler,
                stats: RwLock::new(DispatcherStats::default()),
                cancellation_token,
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                intake_loop: Mutex::new(None),
            }),
        })
    }

    /// Starts health probing and the polling loop.
    ///
    /// Returns immediately; calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let routing = self.routing();
        self.inner.health.start(&routing.destinations);

        info!(
            scope = %self.inner.config.intake.webhook_scope,
            poll_interval_ms = self.inner.config.intake.poll_interval.as_millis(),
            destinations = routing.destinations.len(),
            rules = routing.rules.len(),
            "starting dispatcher"
        );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_intake().await });
        *self.inner.intake_loop.lock() = Some(handle);
    }

    /// Polls the source once and dispatches what it yields.
    ///
    /// Returns the number of lineages started.
    ///
    /// # Errors
    ///
    /// Returns the source error when polling fails.
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.poll_once().await
    }

    /// Routes an event and starts its lineages, bypassing deduplication.
    ///
    /// Returns the number of lineages started.
    pub async fn deliver_event(&self, event: WebhookEvent) -> usize {
        self.inner.dispatch(Arc::new(event), Arrival::Fresh).await
    }

    /// Re-submits a terminal event as a new lineage.
    ///
    /// The replay gets its own identifier and retry counter, records attempts
    /// against the original and never changes the original's status. With a
    /// `destination`, only that destination receives it; otherwise the
    /// current rules decide.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the source does not know the event
    /// - `NotReplayable` if the event is not `completed` or `failed`
    /// - `ConfigurationError` for an unknown destination name or one without
    ///   an absolute URL
    pub async fn replay(&self, event_id: &EventId, destination: Option<&str>) -> Result<EventId> {
        let original = self.inner.source.get_event_by_id(event_id).await?;
        if !original.is_terminal() {
            return Err(DeliveryError::not_replayable(event_id.as_str(), original.status));
        }

        let routing = self.routing();
        let destinations = match destination {
            Some(name) => {
                let target = routing.destination(name).ok_or_else(|| {
                    DeliveryError::configuration(format!("unknown destination '{name}'"))
                })?;
                if !routing::is_routable(target) {
                    return Err(DeliveryError::configuration(format!(
                        "destination '{name}' has non-absolute url '{}'",
                        target.url
                    )));
                }
                vec![target.clone()]
            },
            None => routing::resolve(&original.source, &routing),
        };

        let replay_id = EventId::new(format!("{}:replay:{}", original.id, Uuid::new_v4()));
        info!(
            event_id = %original.id,
            replay_id = %replay_id,
            original_retry_count = original.retry_count,
            destinations = destinations.len(),
            "replaying event"
        );

        let replay = WebhookEvent {
            id: replay_id.clone(),
            status: EventStatus::Pending,
            retry_count: 0,
            failure_reason: None,
            replay_of: Some(original.id.clone()),
            ..original
        };
        self.inner.intake.mark_seen(&replay_id);

        let plan = self.inner.coordinator.begin(Arc::new(replay), &destinations);
        self.inner.spawn_plan(plan);
        Ok(replay_id)
    }

    /// Installs a new routing snapshot and restarts probing for it.
    pub fn reload_routing(&self, routing: RoutingConfig) {
        let issues = routing::warn_issues(&routing);
        let routing = Arc::new(routing);
        *self.inner.routing.write() = Arc::clone(&routing);

        let running = self.inner.started.load(Ordering::Acquire)
            && !self.inner.cancellation_token.is_cancelled();
        if running {
            self.inner.health.start(&routing.destinations);
        }

        info!(
            destinations = routing.destinations.len(),
            rules = routing.rules.len(),
            issues,
            "routing configuration reloaded"
        );
    }

    /// Current routing snapshot.
    pub fn routing(&self) -> Arc<RoutingConfig> {
        Arc::clone(&self.inner.routing.read())
    }

    /// Health monitor feeding the gate.
    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    /// Returns current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        let mut stats = self.inner.stats.read().clone();
        stats.in_flight = self.inner.coordinator.in_flight();
        stats
    }

    /// Waits until every lineage started so far has finished.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Stops polling, probing and in-flight deliveries.
    ///
    /// Interrupted events keep their `processing` status.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if lineage tasks do not stop
    /// within the shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        info!(in_flight = self.inner.coordinator.in_flight(), "shutting down dispatcher");

        self.inner.cancellation_token.cancel();
        self.inner.health.stop();
        self.inner.tracker.close();

        let intake_loop = self.inner.intake_loop.lock().take();
        if let Some(handle) = intake_loop {
            if let Err(join_error) = handle.await {
                warn!(error = %join_error, "intake loop ended abnormally");
            }
        }

        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_err() {
            warn!(timeout_ms = timeout.as_millis(), "lineage tasks did not stop in time");
            return Err(DeliveryError::internal(format!(
                "shutdown timed out after {}ms",
                timeout.as_millis()
            )));
        }

        info!("dispatcher stopped");
        Ok(())
    }
}

impl Inner {
    async fn run_intake(self: Arc<Self>) {
        let poll_interval = self.config.intake.poll_interval;

        loop {
            match self.poll_once().await {
                Ok(0) => {},
                Ok(started) => debug!(started, "poll dispatched lineages"),
                Err(error) => warn!(
                    error = %error,
                    category = %ErrorCategory::from(&error),
                    "poll failed, retrying next interval"
                ),
            }

            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(poll_interval) => {},
            }
        }

        info!("intake loop stopped");
    }

    async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let batch = self.intake.poll_once().await?;
        let mut started = 0;

        for event in batch.interrupted {
            started += self.dispatch(Arc::new(event), Arrival::Interrupted).await;
        }
        for event in batch.resumed {
            started += self.dispatch(Arc::new(event), Arrival::Resumed).await;
        }
        for event in batch.fresh {
            started += self.dispatch(Arc::new(event), Arrival::Fresh).await;
        }

        Ok(started)
    }

    fn resolve(&self, event: &WebhookEvent) -> Vec<Destination> {
        let routing = Arc::clone(&self.routing.read());
        routing::resolve(&event.source, &routing)
    }

    async fn dispatch(self: &Arc<Self>, event: Arc<WebhookEvent>, arrival: Arrival) -> usize {
        let destinations = self.resolve(&event);
        if destinations.is_empty() {
            self.skip(&event, arrival).await;
            return 0;
        }

        let plan = match arrival {
            Arrival::Fresh => self.coordinator.begin(Arc::clone(&event), &destinations),
            Arrival::Interrupted => {
                info!(
                    event_id = %event.id,
                    retry_count = event.retry_count,
                    destinations = destinations.len(),
                    "recovering interrupted event"
                );
                self.coordinator.recover(Arc::clone(&event), &destinations)
            },
            Arrival::Resumed => {
                info!(
                    event_id = %event.id,
                    retry_count = event.retry_count,
                    destinations = destinations.len(),
                    "resuming event that was waiting on a retry"
                );
                self.coordinator.resume(Arc::clone(&event), &destinations)
            },
        };

        if !plan.tasks.is_empty() {
            self.stats.write().events_dispatched += 1;
        }
        if let Some(update) = &plan.update {
            self.report(&event, update).await;
        }
        self.spawn_plan(plan)
    }

    async fn skip(&self, event: &WebhookEvent, arrival: Arrival) {
        info!(
            event_id = %event.id,
            source = %event.source,
            status = %event.status,
            ?arrival,
            "no matching rule, event skipped"
        );
        self.stats.write().events_skipped += 1;
        self.event_handler
            .handle_event(DispatchEvent::Skipped(SkippedEvent {
                event_id: event.id.clone(),
                source: event.source.clone(),
            }))
            .await;
    }

    fn spawn_plan(self: &Arc<Self>, plan: Plan) -> usize {
        let started = plan.tasks.len();
        for (task, delay) in plan.tasks {
            let span = info_span!(
                "lineage",
                event_id = %task.event.id,
                destination = %task.destination.name
            );
            let inner = Arc::clone(self);
            self.tracker.spawn(inner.run_lineage(task, delay).instrument(span));
        }
        started
    }

    async fn run_lineage(self: Arc<Self>, mut task: DeliveryTask, mut delay: Duration) {
        loop {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    () = self.cancellation_token.cancelled() => {
                        self.coordinator.abandon(&task.key());
                        return;
                    },
                    () = self.clock.sleep(delay) => {},
                }
            }

            let Some(attempt) = self.attempt(&task).await else {
                debug!(attempt = task.attempt_number, "attempt aborted by shutdown");
                self.coordinator.abandon(&task.key());
                return;
            };

            self.record(&task, &attempt).await;
            let transition = self.coordinator.on_outcome(&task, &attempt);
            if let Some(update) = &transition.update {
                self.report(&task.event, update).await;
            }

            match transition.next {
                Next::Retry { task: next, delay: backoff } => {
                    self.notify_failure(&task, &attempt, backoff).await;
                    task = next;
                    delay = backoff;
                },
                Next::Done => {
                    if transition.lineage_status == EventStatus::Failed {
                        self.notify_exhausted(&task, &attempt, transition.retry_count).await;
                    }
                    break;
                },
            }
        }
    }

    /// Runs one attempt, or returns `None` if shutdown interrupted it.
    async fn attempt(&self, task: &DeliveryTask) -> Option<Attempt> {
        if self.config.gate_on_health && !self.health.is_deliverable(&task.destination.name) {
            debug!(attempt = task.attempt_number, "destination unhealthy, attempt skipped");
            return Some(Attempt::rejected(DeliveryError::unhealthy(&task.destination.name)));
        }

        self.event_handler
            .handle_event(DispatchEvent::AttemptStarted(AttemptStartedEvent {
                event_id: task.event.id.clone(),
                destination: task.destination.name.clone(),
                attempt_number: task.attempt_number,
                started_at: self.clock.now_utc(),
            }))
            .await;

        tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => None,
            attempt = self.client.execute(task) => Some(attempt),
        }
    }

    async fn record(&self, task: &DeliveryTask, attempt: &Attempt) {
        {
            let mut stats = self.stats.write();
            if attempt.outcome.is_success() {
                stats.successful_attempts += 1;
            } else {
                stats.failed_attempts += 1;
            }
        }

        if let Some(http_status) = attempt.outcome.http_status {
            self.event_handler
                .handle_event(DispatchEvent::Delivered(DeliveredEvent {
                    event_id: task.event.id.clone(),
                    destination: task.destination.name.clone(),
                    http_status,
                    attempt_number: task.attempt_number,
                    latency_ms: attempt.outcome.latency_ms,
                    delivered_at: self.clock.now_utc(),
                }))
                .await;
        }

        let record = DeliveryRecord {
            event_id: task.event.trace_id().clone(),
            lineage_id: task.event.id.clone(),
            destination: task.destination.name.clone(),
            attempt_number: task.attempt_number,
            outcome: attempt.outcome.clone(),
            attempted_at: self.clock.now_utc(),
        };

        if let Err(error) = self.sink.record_delivery_outcome(record).await {
            warn!(
                attempt = task.attempt_number,
                error = %error,
                "failed to record delivery outcome"
            );
        }
    }

    /// Writes an aggregate status change back to the broker.
    ///
    /// Replays never touch the original's status.
    async fn report(&self, event: &WebhookEvent, update: &StatusUpdate) {
        if event.replay_of.is_some() {
            debug!(event_id = %event.id, status = %update.status, "replay status kept local");
            return;
        }

        let retry_count = update.retry_count.unwrap_or(event.retry_count);
        let result = match update.status {
            EventStatus::Completed => self.sink.mark_completed(&event.id, retry_count).await,
            EventStatus::Failed => {
                let reason = update.failure_reason.as_deref().unwrap_or("delivery failed");
                self.sink.mark_failed(&event.id, retry_count, reason).await
            },
            EventStatus::Pending | EventStatus::Processing => {
                self.source.update_event_status(&event.id, update.clone()).await
            },
        };

        match result {
            Ok(()) => debug!(
                event_id = %event.id,
                status = %update.status,
                retry_count,
                "status reported"
            ),
            Err(error) => warn!(
                event_id = %event.id,
                status = %update.status,
                error = %error,
                "failed to report status"
            ),
        }
    }

    async fn notify_failure(&self, task: &DeliveryTask, attempt: &Attempt, backoff: Duration) {
        let error_message = attempt.outcome.error.clone().unwrap_or_default();
        warn!(
            attempt = task.attempt_number,
            error = %error_message,
            next_retry_in_ms = backoff.as_millis(),
            "attempt failed, retry scheduled"
        );

        self.event_handler
            .handle_event(DispatchEvent::AttemptFailed(AttemptFailedEvent {
                event_id: task.event.id.clone(),
                destination: task.destination.name.clone(),
                attempt_number: task.attempt_number,
                error_message,
                next_retry_in_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                failed_at: self.clock.now_utc(),
            }))
            .await;
    }

    async fn notify_exhausted(&self, task: &DeliveryTask, attempt: &Attempt, retry_count: u32) {
        let error_message = attempt.outcome.error.clone().unwrap_or_default();
        warn!(
            attempt = task.attempt_number,
            retry_count,
            error = %error_message,
            "delivery failed permanently"
        );
        self.stats.write().permanent_failures += 1;

        self.event_handler
            .handle_event(DispatchEvent::Exhausted(ExhaustedEvent {
                event_id: task.event.id.clone(),
                destination: task.destination.name.clone(),
                retry_count,
                error_message,
                failed_at: self.clock.now_utc(),
            }))
            .await;
    }
}
