//! Event intake with per-process deduplication.
//!
//! The first successful poll seeds the seen-set: events already queued at
//! startup are not delivered again, except those a previous run left behind.
//! Events in `processing` were cut off mid-attempt and are handed back for
//! recovery; `pending` events with spent retries were waiting on a backoff
//! and are handed back to resume. Every later poll yields only identifiers
//! never seen before.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use hookrelay_core::models::{EventId, EventStatus, WebhookEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::Result, source::EventSource};

/// Polling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Broker scope whose events are polled.
    pub webhook_scope: String,
    /// Delay between polls.
    pub poll_interval: Duration,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self { webhook_scope: "default".to_string(), poll_interval: Duration::from_secs(5) }
    }
}

/// Events produced by one poll.
#[derive(Debug, Clone, Default)]
pub struct IntakeBatch {
    /// Never-seen, non-terminal events to dispatch.
    pub fresh: Vec<WebhookEvent>,
    /// Events found in `processing` when the seen-set was seeded.
    pub interrupted: Vec<WebhookEvent>,
    /// Events found waiting on a retry when the seen-set was seeded.
    pub resumed: Vec<WebhookEvent>,
}

impl IntakeBatch {
    /// Whether the poll produced nothing to do.
    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty() && self.interrupted.is_empty() && self.resumed.is_empty()
    }
}

/// Polls the event source and filters previously seen events.
#[derive(Debug)]
pub struct EventIntake {
    source: Arc<dyn EventSource>,
    config: IntakeConfig,
    seen: Mutex<HashSet<EventId>>,
    seeded: AtomicBool,
}

impl EventIntake {
    /// Creates an intake that has not polled yet.
    pub fn new(source: Arc<dyn EventSource>, config: IntakeConfig) -> Self {
        Self { source, config, seen: Mutex::new(HashSet::new()), seeded: AtomicBool::new(false) }
    }

    /// Polling configuration.
    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Polls once and returns the events to act on.
    ///
    /// # Errors
    ///
    /// Returns the source error unchanged. Nothing is marked seen on failure,
    /// so the next poll picks up where this one left off.
    pub async fn poll_once(&self) -> Result<IntakeBatch> {
        let events = self.source.list_events(&self.config.webhook_scope).await?;
        let mut batch = IntakeBatch::default();
        let mut seen = self.seen.lock();

        if !self.seeded.load(Ordering::Acquire) {
            for event in events {
                seen.insert(event.id.clone());
                match event.status {
                    EventStatus::Processing => batch.interrupted.push(event),
                    EventStatus::Pending if event.retry_count > 0 => batch.resumed.push(event),
                    _ => {},
                }
            }
            self.seeded.store(true, Ordering::Release);
            tracing::info!(
                seeded = seen.len(),
                interrupted = batch.interrupted.len(),
                resumed = batch.resumed.len(),
                "seen-set seeded from first poll"
            );
            return Ok(batch);
        }

        for event in events {
            if !seen.insert(event.id.clone()) {
                continue;
            }
            if event.is_terminal() {
                tracing::debug!(
                    event_id = %event.id,
                    status = %event.status,
                    "terminal event ignored"
                );
                continue;
            }
            batch.fresh.push(event);
        }

        if !batch.fresh.is_empty() {
            tracing::debug!(fresh = batch.fresh.len(), "new events discovered");
        }
        Ok(batch)
    }

    /// Marks an identifier as seen without polling.
    ///
    /// Returns `false` if it was already seen.
    pub fn mark_seen(&self, id: &EventId) -> bool {
        self.seen.lock().insert(id.clone())
    }

    /// Whether the first poll has completed.
    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    /// Number of identifiers seen so far.
    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }
}
