//! HTTP adapter for the remote event broker.
//!
//! Implements `EventSource` and `OutcomeSink` over the broker's JSON REST
//! API:
//!
//! | Operation | Request |
//! |---|---|
//! | list events | `GET {base}/webhooks/{scope}/events` |
//! | get event | `GET {base}/events/{id}` |
//! | update status | `PATCH {base}/events/{id}` |
//! | record attempt | `POST {base}/events/{id}/deliveries` |

use std::time::Duration;

use futures::future::BoxFuture;
use hookrelay_core::models::{DeliveryRecord, EventId, EventStatus, StatusUpdate, WebhookEvent};
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

use crate::{
    error::{DeliveryError, Result},
    source::{EventSource, OutcomeSink},
};

/// Connection settings for the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Absolute base URL of the broker API.
    pub base_url: String,
    /// Opaque bearer token, if the broker requires one.
    pub api_key: Option<String>,
    /// Timeout for each broker call.
    pub timeout: Duration,
}

impl BrokerConfig {
    /// Settings for an unauthenticated broker.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), api_key: None, timeout: Duration::from_secs(10) }
    }
}

/// Broker client backed by reqwest.
#[derive(Clone)]
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Creates a broker client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the base URL is not an
    /// absolute http(s) URL or the HTTP client cannot be built.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url).map_err(|e| {
            DeliveryError::configuration(format!("invalid broker url '{}': {e}", config.base_url))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(DeliveryError::configuration(format!(
                "broker url '{}' is not http(s)",
                config.base_url
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("hookrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build broker client: {e}"))
            })?;

        Ok(Self { client, base_url, api_key: config.api_key })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DeliveryError::configuration("broker url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| DeliveryError::source(format!("{what} failed: {e}"), None))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::source(
            format!("{what} returned HTTP {}: {}", status.as_u16(), body.trim()),
            Some(status.as_u16()),
        ))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.send(request, what)
            .await?
            .json::<T>()
            .await
            .map_err(|e| DeliveryError::source(format!("{what} returned invalid json: {e}"), None))
    }

    async fn patch_status(&self, id: &EventId, update: &StatusUpdate) -> Result<()> {
        let url = self.endpoint(&["events", id.as_str()])?;
        self.send(self.client.patch(url).json(update), "status update").await?;
        tracing::debug!(
            event_id = %id,
            status = %update.status,
            retry_count = ?update.retry_count,
            "status written"
        );
        Ok(())
    }

    fn sink_error(error: DeliveryError) -> DeliveryError {
        match error {
            DeliveryError::SourceError { message, .. } => DeliveryError::sink(message),
            other => other,
        }
    }
}

impl EventSource for BrokerClient {
    fn list_events<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Result<Vec<WebhookEvent>>> {
        Box::pin(async move {
            let url = self.endpoint(&["webhooks", scope, "events"])?;
            self.json(self.client.get(url), "list events").await
        })
    }

    fn get_event_by_id<'a>(&'a self, id: &'a EventId) -> BoxFuture<'a, Result<WebhookEvent>> {
        Box::pin(async move {
            let url = self.endpoint(&["events", id.as_str()])?;
            match self.json(self.client.get(url), "get event").await {
                Err(DeliveryError::SourceError { status: Some(status), .. })
                    if status == StatusCode::NOT_FOUND.as_u16() =>
                {
                    Err(DeliveryError::not_found(id.as_str()))
                },
                other => other,
            }
        })
    }

    fn update_event_status<'a>(
        &'a self,
        id: &'a EventId,
        update: StatusUpdate,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.patch_status(id, &update).await })
    }
}

impl OutcomeSink for BrokerClient {
    fn record_delivery_outcome(&self, record: DeliveryRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = self.endpoint(&["events", record.event_id.as_str(), "deliveries"])?;
            self.send(self.client.post(url).json(&record), "record delivery")
                .await
                .map(|_| ())
                .map_err(Self::sink_error)
        })
    }

    fn mark_completed<'a>(
        &'a self,
        id: &'a EventId,
        retry_count: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.patch_status(id, &StatusUpdate::new(EventStatus::Completed, retry_count))
                .await
                .map_err(Self::sink_error)
        })
    }

    fn mark_failed<'a>(
        &'a self,
        id: &'a EventId,
        retry_count: u32,
        failure_reason: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.patch_status(id, &StatusUpdate::failed(retry_count, failure_reason))
                .await
                .map_err(Self::sink_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hookrelay_core::models::{DeliveryOutcome, OriginRequest};
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer, api_key: Option<&str>) -> BrokerClient {
        let mut config = BrokerConfig::new(format!("{}/api", server.uri()));
        config.api_key = api_key.map(str::to_string);
        BrokerClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn lists_scope_events_with_bearer_token() {
        let server = MockServer::start().await;
        let event = WebhookEvent::new("evt_1", "stripe", OriginRequest::post("{}", Utc::now()));

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/webhooks/my-hook/events"))
            .and(matchers::header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![event.clone()]))
            .expect(1)
            .mount(&server)
            .await;

        let events = client(&server, Some("secret")).list_events("my-hook").await.unwrap();
        assert_eq!(events, vec![event]);
    }

    #[tokio::test]
    async fn missing_event_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/api/events/evt_404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err =
            client(&server, None).get_event_by_id(&EventId::new("evt_404")).await.unwrap_err();
        assert_eq!(err, DeliveryError::not_found("evt_404"));
    }

    #[tokio::test]
    async fn status_updates_are_patched() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PATCH"))
            .and(matchers::path("/api/events/evt_1"))
            .and(matchers::body_json(json!({"status": "pending", "retry_count": 1})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, None)
            .update_event_status(&EventId::new("evt_1"), StatusUpdate::new(EventStatus::Pending, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outcomes_are_posted_and_errors_mapped_to_sink() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/events/evt_1/deliveries"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let record = DeliveryRecord {
            event_id: EventId::new("evt_1"),
            lineage_id: EventId::new("evt_1"),
            destination: "web".into(),
            attempt_number: 1,
            outcome: DeliveryOutcome::failure("connection refused", Duration::ZERO),
            attempted_at: Utc::now(),
        };

        let err = client(&server, None).record_delivery_outcome(record).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SinkError { ref message } if message.contains("503")));
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(BrokerClient::new(BrokerConfig::new("ftp://broker")).is_err());
        assert!(BrokerClient::new(BrokerConfig::new("not a url")).is_err());
    }
}
