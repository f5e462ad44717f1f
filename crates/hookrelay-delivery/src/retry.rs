//! Retry bookkeeping and backoff timing.
//!
//! `RetryPolicy` computes capped, jittered delays between attempts.
//! `RetryCoordinator` owns the per-(event, destination) lineage state,
//! decides whether a failed attempt is retried or permanently failed, and
//! folds lineage states into the single status reported for the event.
//!
//! # Lineage lifecycle
//!
//! ```text
//! begin ──▶ processing ──success──▶ completed
//!               │
//!            failure
//!               ├── retry_count < max_retries ──▶ pending(n+1) ──▶ next attempt
//!               └── otherwise ─────────────────▶ failed
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use hookrelay_core::models::{
    DeliveryTask, Destination, EventId, EventStatus, LineageKey, StatusUpdate, WebhookEvent,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::client::Attempt;

/// Error recorded for attempts cut short by a previous shutdown.
pub const INTERRUPTED_ERROR: &str = "delivery interrupted before completion";

/// Backoff timing between attempts of one lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// How delays grow between retries.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay grows by the base amount each retry.
    Linear,
    /// Delay doubles each retry.
    #[default]
    Exponential,
}

impl RetryPolicy {
    /// Policy without jitter, for deterministic schedules.
    pub fn deterministic(
        base_delay: Duration,
        max_delay: Duration,
        strategy: BackoffStrategy,
    ) -> Self {
        Self { base_delay, max_delay, jitter_factor: 0.0, backoff_strategy: strategy }
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        let retry_number = retry_number.max(1);
        let base_delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_number),
            BackoffStrategy::Exponential => {
                let exponent = (retry_number - 1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped_delay = base_delay.min(self.max_delay);
        apply_jitter(capped_delay, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes a delay by ±jitter_factor.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}

/// Tasks to run after starting or recovering an event.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// First tasks of each new lineage, paired with the delay before they run.
    pub tasks: Vec<(DeliveryTask, Duration)>,
    /// Status to report for the event, if it changed.
    pub update: Option<StatusUpdate>,
}

/// What happens to a lineage after an attempt.
#[derive(Debug, Clone)]
pub enum Next {
    /// Run another attempt after `delay`.
    Retry {
        /// Task for the next attempt.
        task: DeliveryTask,
        /// Backoff before it runs.
        delay: Duration,
    },
    /// The lineage is finished.
    Done,
}

/// Decision taken for one attempt outcome.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Lineage status after the attempt.
    pub lineage_status: EventStatus,
    /// Retries consumed by the lineage.
    pub retry_count: u32,
    /// Follow-up for the lineage.
    pub next: Next,
    /// Aggregate status to report for the event, if it changed.
    pub update: Option<StatusUpdate>,
}

#[derive(Debug, Clone)]
struct Lineage {
    destination: Destination,
    status: EventStatus,
    retry_count: u32,
    max_retries: u32,
    last_error: Option<String>,
}

#[derive(Debug)]
struct Progress {
    event: Arc<WebhookEvent>,
    lineages: HashMap<String, Lineage>,
    reported: Option<StatusUpdate>,
}

impl Progress {
    fn aggregate(&self) -> Option<StatusUpdate> {
        if self.lineages.is_empty() {
            return None;
        }

        let retry_count = self.lineages.values().map(|l| l.retry_count).max().unwrap_or(0);
        let all_terminal = self.lineages.values().all(|l| l.status.is_terminal());

        if all_terminal {
            let failure = self
                .lineages
                .values()
                .filter(|l| l.status == EventStatus::Failed)
                .max_by_key(|l| l.retry_count);
            return Some(match failure {
                Some(failed) => StatusUpdate::failed(
                    retry_count,
                    failed.last_error.clone().unwrap_or_else(|| "delivery failed".to_string()),
                ),
                None => StatusUpdate::new(EventStatus::Completed, retry_count),
            });
        }

        let waiting = self.lineages.values().any(|l| l.status == EventStatus::Pending);
        let status = if waiting { EventStatus::Pending } else { EventStatus::Processing };
        Some(StatusUpdate::new(status, retry_count))
    }

    /// Returns the aggregate only when it differs from what was reported.
    fn changed_aggregate(&mut self) -> Option<StatusUpdate> {
        let aggregate = self.aggregate()?;
        if self.reported.as_ref() == Some(&aggregate) {
            return None;
        }
        self.reported = Some(aggregate.clone());
        Some(aggregate)
    }

    fn is_finished(&self) -> bool {
        self.lineages.values().all(|l| l.status.is_terminal())
    }
}

/// Owns retry state for every event with live lineages.
///
/// A lineage exists from `begin` until it completes or fails, which also
/// guarantees at most one in-flight task per (event, destination).
#[derive(Debug)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    progress: Mutex<HashMap<EventId, Progress>>,
}

impl RetryCoordinator {
    /// Creates a coordinator using the given backoff policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, progress: Mutex::new(HashMap::new()) }
    }

    /// Backoff policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Starts one lineage per destination.
    ///
    /// Terminal events and destinations that already have a live lineage for
    /// this event produce no task. Lineages resume from the event's retry
    /// count; the budget is the destination override or the event's own.
    pub fn begin(&self, event: Arc<WebhookEvent>, destinations: &[Destination]) -> Plan {
        self.start(event, destinations, EventStatus::Processing)
    }

    fn start(
        &self,
        event: Arc<WebhookEvent>,
        destinations: &[Destination],
        initial: EventStatus,
    ) -> Plan {
        if event.is_terminal() {
            tracing::debug!(
                event_id = %event.id,
                status = %event.status,
                "terminal event not started"
            );
            return Plan::default();
        }

        let mut progress = self.progress.lock();
        let entry = progress.entry(event.id.clone()).or_insert_with(|| Progress {
            event: Arc::clone(&event),
            lineages: HashMap::new(),
            reported: None,
        });

        let mut tasks = Vec::new();
        for destination in destinations {
            if entry.lineages.contains_key(&destination.name) {
                tracing::debug!(
                    event_id = %event.id,
                    destination = %destination.name,
                    "lineage already in flight"
                );
                continue;
            }

            let lineage = Lineage {
                destination: destination.clone(),
                status: initial,
                retry_count: event.retry_count,
                max_retries: destination.max_retries.unwrap_or(event.max_retries),
                last_error: None,
            };
            tasks.push((
                DeliveryTask {
                    event: Arc::clone(&entry.event),
                    destination: destination.clone(),
                    attempt_number: lineage.retry_count + 1,
                },
                Duration::ZERO,
            ));
            entry.lineages.insert(destination.name.clone(), lineage);
        }

        let update = if tasks.is_empty() { None } else { entry.changed_aggregate() };
        if entry.lineages.is_empty() {
            progress.remove(&event.id);
        }

        Plan { tasks, update }
    }

    /// Restarts an event whose previous attempt was interrupted.
    ///
    /// The interrupted attempt counts as a retryable failure, so each
    /// lineage either retries immediately or fails if its budget is spent.
    pub fn recover(&self, event: Arc<WebhookEvent>, destinations: &[Destination]) -> Plan {
        let started = self.begin(event, destinations);
        let interrupted =
            Attempt::rejected(crate::error::DeliveryError::network(INTERRUPTED_ERROR));

        let mut plan = Plan::default();
        for (task, _) in started.tasks {
            let transition = self.on_outcome(&task, &interrupted);
            if let Next::Retry { task, .. } = transition.next {
                plan.tasks.push((task, Duration::ZERO));
            }
            if transition.update.is_some() {
                plan.update = transition.update;
            }
        }
        plan
    }

    /// Continues an event that was waiting on a retry when the previous run
    /// stopped.
    ///
    /// Retries already spent stay spent: each lineage runs its next attempt
    /// right away. The broker already shows `pending` at the event's retry
    /// count, so that status is not reported again.
    pub fn resume(&self, event: Arc<WebhookEvent>, destinations: &[Destination]) -> Plan {
        let current = StatusUpdate::new(EventStatus::Pending, event.retry_count);
        let mut plan = self.start(event, destinations, EventStatus::Pending);
        if plan.update.as_ref() == Some(&current) {
            plan.update = None;
        }
        plan
    }

    /// Records an attempt result and decides what happens next.
    pub fn on_outcome(&self, task: &DeliveryTask, attempt: &Attempt) -> Transition {
        let key = task.key();
        let mut progress = self.progress.lock();

        let Some(entry) = progress.get_mut(&key.event_id) else {
            tracing::warn!(lineage = %key, "outcome for unknown lineage ignored");
            return Transition {
                lineage_status: EventStatus::Failed,
                retry_count: task.attempt_number.saturating_sub(1),
                next: Next::Done,
                update: None,
            };
        };
        let Some(lineage) = entry.lineages.get_mut(&key.destination) else {
            tracing::warn!(lineage = %key, "outcome for unknown lineage ignored");
            return Transition {
                lineage_status: EventStatus::Failed,
                retry_count: task.attempt_number.saturating_sub(1),
                next: Next::Done,
                update: None,
            };
        };

        let next = if attempt.outcome.is_success() {
            lineage.status = EventStatus::Completed;
            lineage.last_error = None;
            Next::Done
        } else {
            lineage.last_error = attempt.outcome.error.clone();
            if attempt.is_retryable() && lineage.retry_count < lineage.max_retries {
                lineage.retry_count += 1;
                lineage.status = EventStatus::Pending;
                Next::Retry {
                    task: DeliveryTask {
                        event: Arc::clone(&entry.event),
                        destination: lineage.destination.clone(),
                        attempt_number: lineage.retry_count + 1,
                    },
                    delay: self.policy.delay_for(lineage.retry_count),
                }
            } else {
                lineage.status = EventStatus::Failed;
                Next::Done
            }
        };

        let lineage_status = lineage.status;
        let retry_count = lineage.retry_count;
        let update = entry.changed_aggregate();
        if entry.is_finished() {
            progress.remove(&key.event_id);
        }

        Transition { lineage_status, retry_count, next, update }
    }

    /// Drops a lineage without recording an outcome, e.g. on shutdown.
    pub fn abandon(&self, key: &LineageKey) {
        let mut progress = self.progress.lock();
        if let Some(entry) = progress.get_mut(&key.event_id) {
            entry.lineages.remove(&key.destination);
            if entry.lineages.is_empty() || entry.is_finished() {
                progress.remove(&key.event_id);
            }
        }
    }

    /// Whether the lineage currently has a task running or scheduled.
    pub fn is_in_flight(&self, key: &LineageKey) -> bool {
        self.progress
            .lock()
            .get(&key.event_id)
            .and_then(|entry| entry.lineages.get(&key.destination))
            .is_some_and(|lineage| !lineage.status.is_terminal())
    }

    /// Number of live lineages.
    pub fn in_flight(&self) -> usize {
        self.progress
            .lock()
            .values()
            .flat_map(|entry| entry.lineages.values())
            .filter(|lineage| !lineage.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hookrelay_core::models::{DeliveryOutcome, OriginRequest};

    use super::*;
    use crate::error::DeliveryError;

    fn event(max_retries: u32) -> Arc<WebhookEvent> {
        let mut event = WebhookEvent::new("evt_1", "stripe", OriginRequest::post("{}", Utc::now()));
        event.max_retries = max_retries;
        Arc::new(event)
    }

    fn coordinator() -> RetryCoordinator {
        RetryCoordinator::new(RetryPolicy::deterministic(
            Duration::from_secs(1),
            Duration::from_secs(60),
            BackoffStrategy::Exponential,
        ))
    }

    fn success() -> Attempt {
        Attempt {
            outcome: DeliveryOutcome::success(
                200,
                HashMap::new(),
                String::new(),
                Default::default(),
                Duration::ZERO,
            ),
            error: None,
        }
    }

    fn timeout() -> Attempt {
        Attempt::rejected(DeliveryError::timeout(1000))
    }

    #[test]
    fn exponential_backoff_increases_and_caps() {
        let policy = RetryPolicy::deterministic(
            Duration::from_secs(1),
            Duration::from_secs(10),
            BackoffStrategy::Exponential,
        );
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy::deterministic(
            Duration::from_secs(5),
            Duration::from_secs(60),
            BackoffStrategy::Linear,
        );
        assert_eq!(linear.delay_for(1), Duration::from_secs(5));
        assert_eq!(linear.delay_for(3), Duration::from_secs(15));

        let fixed = RetryPolicy::deterministic(
            Duration::from_secs(5),
            Duration::from_secs(60),
            BackoffStrategy::Fixed,
        );
        assert_eq!(fixed.delay_for(1), fixed.delay_for(7));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base_delay = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let jittered = apply_jitter(base_delay, 0.5);
            assert!(jittered >= Duration::from_secs(5) && jittered <= Duration::from_secs(15));
            seen.insert(jittered.as_millis());
        }
        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn begin_reports_processing_once() {
        let coordinator = coordinator();
        let plan = coordinator.begin(event(3), &[Destination::new("web", "http://localhost:1/")]);

        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].0.attempt_number, 1);
        assert_eq!(plan.update, Some(StatusUpdate::new(EventStatus::Processing, 0)));
        assert_eq!(coordinator.in_flight(), 1);
    }

    #[test]
    fn duplicate_begin_is_guarded() {
        let coordinator = coordinator();
        let destinations = [Destination::new("web", "http://localhost:1/")];
        let event = event(3);

        assert_eq!(coordinator.begin(Arc::clone(&event), &destinations).tasks.len(), 1);
        let second = coordinator.begin(event, &destinations);
        assert!(second.tasks.is_empty());
        assert!(second.update.is_none());
    }

    #[test]
    fn terminal_events_get_no_tasks() {
        let coordinator = coordinator();
        let mut completed = (*event(3)).clone();
        completed.status = EventStatus::Completed;

        let destinations = [Destination::new("web", "http://localhost:1/")];
        let plan = coordinator.begin(Arc::new(completed), &destinations);
        assert!(plan.tasks.is_empty());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn retries_until_budget_then_fails_with_last_error() {
        let coordinator = coordinator();
        let plan = coordinator.begin(event(2), &[Destination::new("web", "http://localhost:1/")]);
        let (mut task, _) = plan.tasks.into_iter().next().unwrap();

        let mut updates = Vec::new();
        let mut delays = Vec::new();
        loop {
            let transition = coordinator.on_outcome(&task, &timeout());
            updates.extend(transition.update);
            match transition.next {
                Next::Retry { task: next, delay } => {
                    delays.push(delay);
                    task = next;
                },
                Next::Done => break,
            }
        }

        assert_eq!(task.attempt_number, 3);
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(
            updates,
            vec![
                StatusUpdate::new(EventStatus::Pending, 1),
                StatusUpdate::new(EventStatus::Pending, 2),
                StatusUpdate::failed(2, "request timed out after 1000ms"),
            ]
        );
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn non_retryable_failure_fails_immediately() {
        let coordinator = coordinator();
        let plan = coordinator.begin(event(5), &[Destination::new("web", "/relative")]);
        let (task, _) = &plan.tasks[0];

        let rejected = Attempt::rejected(DeliveryError::configuration("relative url"));
        let transition = coordinator.on_outcome(task, &rejected);
        assert!(matches!(transition.next, Next::Done));
        assert_eq!(transition.lineage_status, EventStatus::Failed);
        assert_eq!(transition.retry_count, 0);
    }

    #[test]
    fn destination_override_replaces_event_budget() {
        let coordinator = coordinator();
        let destination = Destination::new("web", "http://localhost:1/").with_max_retries(0);
        let plan = coordinator.begin(event(5), &[destination]);

        let transition = coordinator.on_outcome(&plan.tasks[0].0, &timeout());
        assert!(matches!(transition.next, Next::Done));
        assert_eq!(
            transition.update,
            Some(StatusUpdate::failed(0, "request timed out after 1000ms"))
        );
    }

    #[test]
    fn aggregate_waits_for_every_lineage() {
        let coordinator = coordinator();
        let destinations =
            [
                Destination::new("a", "http://localhost:1/"),
                Destination::new("b", "http://localhost:2/"),
            ];
        let plan = coordinator.begin(event(1), &destinations);
        let (a, b) = (&plan.tasks[0].0, &plan.tasks[1].0);

        let first = coordinator.on_outcome(a, &success());
        assert_eq!(first.update, None, "still processing while b is in flight");

        let second = coordinator.on_outcome(b, &success());
        assert_eq!(second.update, Some(StatusUpdate::new(EventStatus::Completed, 0)));
    }

    #[test]
    fn mixed_outcomes_aggregate_to_failed() {
        let coordinator = coordinator();
        let destinations =
            [
                Destination::new("a", "http://localhost:1/"),
                Destination::new("b", "http://localhost:2/"),
            ];
        let plan = coordinator.begin(event(0), &destinations);

        coordinator.on_outcome(&plan.tasks[0].0, &success());
        let transition = coordinator.on_outcome(&plan.tasks[1].0, &timeout());
        assert_eq!(
            transition.update,
            Some(StatusUpdate::failed(0, "request timed out after 1000ms"))
        );
    }

    #[test]
    fn recovery_counts_interrupted_attempt() {
        let coordinator = coordinator();
        let mut interrupted = (*event(3)).clone();
        interrupted.status = EventStatus::Processing;
        interrupted.retry_count = 1;

        let destinations = [Destination::new("web", "http://localhost:1/")];
        let plan = coordinator.recover(Arc::new(interrupted), &destinations);

        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].0.attempt_number, 3);
        assert_eq!(plan.tasks[0].1, Duration::ZERO);
        assert_eq!(plan.update, Some(StatusUpdate::new(EventStatus::Pending, 2)));
    }

    #[test]
    fn recovery_with_spent_budget_fails() {
        let coordinator = coordinator();
        let mut interrupted = (*event(1)).clone();
        interrupted.status = EventStatus::Processing;
        interrupted.retry_count = 1;

        let destinations = [Destination::new("web", "http://localhost:1/")];
        let plan = coordinator.recover(Arc::new(interrupted), &destinations);

        assert!(plan.tasks.is_empty());
        assert_eq!(
            plan.update,
            Some(StatusUpdate::failed(1, format!("network connection failed: {INTERRUPTED_ERROR}")))
        );
    }

    #[test]
    fn resumed_event_continues_where_it_stopped() {
        let coordinator = coordinator();
        let mut waiting = (*event(3)).clone();
        waiting.retry_count = 2;
        let destinations = [Destination::new("web", "http://localhost:1/")];

        let plan = coordinator.resume(Arc::new(waiting), &destinations);

        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].0.attempt_number, 3);
        assert_eq!(plan.tasks[0].1, Duration::ZERO);
        assert_eq!(plan.update, None);

        let transition = coordinator.on_outcome(&plan.tasks[0].0, &timeout());
        assert!(matches!(transition.next, Next::Retry { .. }));
        assert_eq!(transition.update, Some(StatusUpdate::new(EventStatus::Pending, 3)));

        let Next::Retry { task, .. } = transition.next else { unreachable!() };
        let transition = coordinator.on_outcome(&task, &timeout());
        assert_eq!(transition.lineage_status, EventStatus::Failed);
        assert_eq!(transition.retry_count, 3);
    }

    #[test]
    fn abandon_releases_guard() {
        let coordinator = coordinator();
        let destinations = [Destination::new("web", "http://localhost:1/")];
        let plan = coordinator.begin(event(3), &destinations);
        let key = plan.tasks[0].0.key();

        assert!(coordinator.is_in_flight(&key));
        coordinator.abandon(&key);
        assert!(!coordinator.is_in_flight(&key));
        assert_eq!(coordinator.begin(event(3), &destinations).tasks.len(), 1);
    }
}
