//! Collaborator abstractions for the remote broker.
//!
//! The dispatcher reads events through `EventSource` and writes attempt
//! history through `OutcomeSink`. Production wires both to the HTTP
//! `BrokerClient`; tests use the in-memory `mock::MockEventSource`, which
//! records every status transition for verification.

use futures::future::BoxFuture;
use hookrelay_core::models::{DeliveryRecord, EventId, StatusUpdate, WebhookEvent};

use crate::error::Result;

/// Read side of the remote broker.
pub trait EventSource: Send + Sync + std::fmt::Debug + 'static {
    /// Lists the events queued under a webhook scope.
    fn list_events<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Result<Vec<WebhookEvent>>>;

    /// Fetches one event.
    ///
    /// Returns `DeliveryError::NotFound` when the broker does not know it.
    fn get_event_by_id<'a>(&'a self, id: &'a EventId) -> BoxFuture<'a, Result<WebhookEvent>>;

    /// Writes back a non-terminal status transition.
    fn update_event_status<'a>(
        &'a self,
        id: &'a EventId,
        update: StatusUpdate,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Write side for attempt history and terminal status.
pub trait OutcomeSink: Send + Sync + std::fmt::Debug + 'static {
    /// Stores one attempt.
    fn record_delivery_outcome(&self, record: DeliveryRecord) -> BoxFuture<'_, Result<()>>;

    /// Marks the event delivered.
    fn mark_completed<'a>(&'a self, id: &'a EventId, retry_count: u32) -> BoxFuture<'a, Result<()>>;

    /// Marks the event permanently failed with its last error.
    fn mark_failed<'a>(
        &'a self,
        id: &'a EventId,
        retry_count: u32,
        failure_reason: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

pub mod mock {
    //! In-memory broker for dispatcher tests.

    use std::{collections::HashMap, sync::Arc};

    use futures::future::BoxFuture;
    use hookrelay_core::models::{
        DeliveryRecord, EventId, EventStatus, StatusUpdate, WebhookEvent,
    };
    use tokio::sync::RwLock;

    use super::{EventSource, OutcomeSink};
    use crate::error::{DeliveryError, Result};

    /// Mock broker implementing both collaborator traits.
    ///
    /// Stores events in insertion order, applies status updates to them and
    /// keeps the full update history. Errors can be injected for the next
    /// list or sink call.
    #[derive(Debug, Clone, Default)]
    pub struct MockEventSource {
        events: Arc<RwLock<Vec<WebhookEvent>>>,
        history: Arc<RwLock<Vec<(EventId, StatusUpdate)>>>,
        outcomes: Arc<RwLock<Vec<DeliveryRecord>>>,
        list_error: Arc<RwLock<Option<String>>>,
        sink_error: Arc<RwLock<Option<String>>>,
        list_calls: Arc<RwLock<usize>>,
    }

    impl MockEventSource {
        /// Creates an empty broker.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues an event; later polls include it.
        pub async fn add_event(&self, event: WebhookEvent) {
            let mut events = self.events.write().await;
            match events.iter_mut().find(|e| e.id == event.id) {
                Some(existing) => *existing = event,
                None => events.push(event),
            }
        }

        /// Injects an error for the next `list_events` call.
        pub async fn inject_list_error(&self, error: impl Into<String>) {
            *self.list_error.write().await = Some(error.into());
        }

        /// Injects an error for the next outcome sink call.
        pub async fn inject_sink_error(&self, error: impl Into<String>) {
            *self.sink_error.write().await = Some(error.into());
        }

        /// Current state of an event.
        pub async fn event(&self, id: &EventId) -> Option<WebhookEvent> {
            self.events.read().await.iter().find(|e| &e.id == id).cloned()
        }

        /// Every status update written for an event, in order.
        pub async fn status_history(&self, id: &EventId) -> Vec<StatusUpdate> {
            self.history
                .read()
                .await
                .iter()
                .filter(|(event_id, _)| event_id == id)
                .map(|(_, update)| update.clone())
                .collect()
        }

        /// Every recorded attempt.
        pub async fn recorded_outcomes(&self) -> Vec<DeliveryRecord> {
            self.outcomes.read().await.clone()
        }

        /// Attempts recorded for one event and destination.
        pub async fn outcomes_for(&self, id: &EventId, destination: &str) -> Vec<DeliveryRecord> {
            self.outcomes
                .read()
                .await
                .iter()
                .filter(|r| &r.event_id == id && r.destination == destination)
                .cloned()
                .collect()
        }

        /// Number of `list_events` calls served.
        pub async fn list_calls(&self) -> usize {
            *self.list_calls.read().await
        }

        async fn apply(&self, id: &EventId, update: StatusUpdate) {
            if let Some(event) = self.events.write().await.iter_mut().find(|e| &e.id == id) {
                event.status = update.status;
                if let Some(retry_count) = update.retry_count {
                    event.retry_count = retry_count;
                }
                if update.failure_reason.is_some() {
                    event.failure_reason.clone_from(&update.failure_reason);
                }
            }
            self.history.write().await.push((id.clone(), update));
        }

        async fn take_sink_error(&self) -> Result<()> {
            match self.sink_error.write().await.take() {
                Some(error) => Err(DeliveryError::sink(error)),
                None => Ok(()),
            }
        }
    }

    impl EventSource for MockEventSource {
        fn list_events<'a>(&'a self, _scope: &'a str) -> BoxFuture<'a, Result<Vec<WebhookEvent>>> {
            Box::pin(async move {
                *self.list_calls.write().await += 1;
                if let Some(error) = self.list_error.write().await.take() {
                    return Err(DeliveryError::source(error, None));
                }
                Ok(self.events.read().await.clone())
            })
        }

        fn get_event_by_id<'a>(&'a self, id: &'a EventId) -> BoxFuture<'a, Result<WebhookEvent>> {
            Box::pin(async move {
                self.event(id).await.ok_or_else(|| DeliveryError::not_found(id.to_string()))
            })
        }

        fn update_event_status<'a>(
            &'a self,
            id: &'a EventId,
            update: StatusUpdate,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.apply(id, update).await;
                Ok(())
            })
        }
    }

    impl OutcomeSink for MockEventSource {
        fn record_delivery_outcome(&self, record: DeliveryRecord) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.take_sink_error().await?;
                self.outcomes.write().await.push(record);
                Ok(())
            })
        }

        fn mark_completed<'a>(
            &'a self,
            id: &'a EventId,
            retry_count: u32,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.take_sink_error().await?;
                self.apply(id, StatusUpdate::new(EventStatus::Completed, retry_count)).await;
                Ok(())
            })
        }

        fn mark_failed<'a>(
            &'a self,
            id: &'a EventId,
            retry_count: u32,
            failure_reason: &'a str,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.take_sink_error().await?;
                self.apply(id, StatusUpdate::failed(retry_count, failure_reason)).await;
                Ok(())
            })
        }
    }

}
