//! Recording event handler for asserting on dispatcher notifications.
//!
//! Waits are bounded by `DEFAULT_EVENT_TIMEOUT` so a missing notification
//! fails the test instead of hanging CI.

use std::{sync::Arc, time::Duration};

use hookrelay_core::{DispatchEvent, EventHandler, EventId};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Upper bound for waiting on notifications.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler that keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    history: Mutex<Vec<DispatchEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All notifications in arrival order.
    pub fn history(&self) -> Vec<DispatchEvent> {
        self.history.lock().clone()
    }

    /// Notifications concerning one event.
    pub fn history_for(&self, event_id: &EventId) -> Vec<DispatchEvent> {
        self.history.lock().iter().filter(|e| e.event_id() == event_id).cloned().collect()
    }

    /// Number of notifications matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&DispatchEvent) -> bool) -> usize {
        self.history.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Waits until at least `count` notifications match `predicate`.
    ///
    /// # Panics
    ///
    /// Panics if `DEFAULT_EVENT_TIMEOUT` elapses first.
    pub async fn wait_for(&self, count: usize, predicate: impl Fn(&DispatchEvent) -> bool) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.count(&predicate) >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        assert!(
            result.is_ok(),
            "expected {count} matching notifications within {DEFAULT_EVENT_TIMEOUT:?}, saw {}",
            self.count(&predicate)
        );
    }

    /// Forgets recorded notifications.
    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DispatchEvent) {
        self.history.lock().push(event);
        self.notify.notify_waiters();
    }
}

/// Matches terminal failure notifications.
pub fn is_exhausted(event: &DispatchEvent) -> bool {
    matches!(event, DispatchEvent::Exhausted(_))
}

/// Matches notifications for a received HTTP response.
pub fn is_delivered(event: &DispatchEvent) -> bool {
    matches!(event, DispatchEvent::Delivered(_))
}

/// Matches notifications for a scheduled retry.
pub fn is_retry(event: &DispatchEvent) -> bool {
    matches!(event, DispatchEvent::AttemptFailed(_))
}
