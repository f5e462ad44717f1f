//! Test data builders for broker events and routing configuration.
//!
//! Builders start from sensible defaults so tests only spell out what they
//! assert on.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hookrelay_core::models::{
    BodyEncoding, DeliveryRule, Destination, EventId, EventStatus, HealthProbe, OriginRequest,
    RoutingConfig, WebhookEvent, DEFAULT_MAX_RETRIES,
};
use serde_json::Value;
use uuid::Uuid;

/// Builder for captured webhook events as the broker returns them.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: Option<String>,
    source: String,
    method: String,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    body_encoding: BodyEncoding,
    status: EventStatus,
    retry_count: u32,
    max_retries: u32,
    received_at: Option<DateTime<Utc>>,
}

impl EventBuilder {
    /// Creates a builder for a pending JSON `POST` from `stripe`.
    pub fn new() -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());

        Self {
            id: None,
            source: "stripe".to_string(),
            method: "POST".to_string(),
            headers,
            body: Some(Bytes::from_static(br#"{"event":"test.webhook"}"#)),
            body_encoding: BodyEncoding::Plain,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            received_at: None,
        }
    }

    /// Sets the event identifier.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the originating provider.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the HTTP method of the captured request.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Adds a captured request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets a text body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self.body_encoding = BodyEncoding::Plain;
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn json_body(self, value: &Value) -> Self {
        self.body(Bytes::from(value.to_string())).header("content-type", "application/json")
    }

    /// Sets a binary body, transported base64-encoded.
    #[must_use]
    pub fn binary_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self.body_encoding = BodyEncoding::Base64;
        self
    }

    /// Removes the body.
    #[must_use]
    pub fn without_body(mut self) -> Self {
        self.body = None;
        self
    }

    /// Sets the broker-side status.
    #[must_use]
    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the retries already spent.
    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the capture time.
    #[must_use]
    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    /// Builds the event.
    pub fn build(self) -> WebhookEvent {
        let size = self.body.as_ref().map_or(0, |b| b.len() as u64);
        let body = self.body.map(|bytes| match self.body_encoding {
            BodyEncoding::Plain => String::from_utf8_lossy(&bytes).into_owned(),
            BodyEncoding::Base64 => STANDARD.encode(&bytes),
        });

        let request = OriginRequest {
            method: self.method,
            headers: self.headers,
            body,
            body_encoding: self.body_encoding,
            size,
            client_ip: Some("203.0.113.7".to_string()),
            received_at: self.received_at.unwrap_or_else(Utc::now),
        };

        let id = self.id.unwrap_or_else(|| format!("evt_{}", Uuid::new_v4().simple()));
        let mut event = WebhookEvent::new(EventId::new(id), self.source, request);
        event.status = self.status;
        event.retry_count = self.retry_count;
        event.max_retries = self.max_retries;
        event
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination without a probe, so it is always deliverable.
pub fn destination(name: &str, url: impl Into<String>) -> Destination {
    Destination::new(name, url)
}

/// Destination probed over TCP at `target`.
pub fn probed_destination(
    name: &str,
    url: impl Into<String>,
    target: impl Into<String>,
) -> Destination {
    Destination::new(name, url).with_probe(HealthProbe::Tcp { target: target.into() })
}

/// Rule matching `source` exactly, or any source for `"*"`.
pub fn rule(source: &str, destination: &str) -> DeliveryRule {
    DeliveryRule::new(source, destination)
}

/// Routing config from destinations and `(source, destination)` pairs.
pub fn routing(destinations: Vec<Destination>, rules: &[(&str, &str)]) -> RoutingConfig {
    RoutingConfig::new(destinations, rules.iter().map(|(s, d)| rule(s, d)).collect())
}

/// Factory functions for common events.
pub mod scenarios {
    use serde_json::json;

    use super::{EventBuilder, WebhookEvent};

    /// Stripe-style payment event.
    pub fn stripe_event(id: &str) -> WebhookEvent {
        EventBuilder::new()
            .id(id)
            .source("stripe")
            .header(
                "stripe-signature",
                "t=1700000000,v1=5257a869e7ecebeda32affa62cdca3fa51cad7e77a0e56ff536d0ce8e108d8bd",
            )
            .json_body(&json!({
                "id": "evt_1234567890",
                "object": "event",
                "type": "payment_intent.succeeded",
                "data": {"object": {"id": "pi_1234567890", "amount": 2000, "currency": "usd"}}
            }))
            .build()
    }

    /// GitHub-style push event.
    pub fn github_event(id: &str) -> WebhookEvent {
        EventBuilder::new()
            .id(id)
            .source("github")
            .header("x-github-event", "push")
            .header("x-github-delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958")
            .json_body(&json!({
                "ref": "refs/heads/main",
                "repository": {"full_name": "octocat/hello-world"}
            }))
            .build()
    }

    /// Sequential events `evt_0..evt_{count}` from `source`.
    pub fn event_batch(source: &str, count: usize) -> Vec<WebhookEvent> {
        (0..count)
            .map(|i| EventBuilder::new().id(format!("evt_{i}")).source(source).build())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_pending_json_posts() {
        let event = EventBuilder::new().id("evt_1").build();

        assert_eq!(event.id.as_str(), "evt_1");
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.request.method, "POST");
        assert_eq!(event.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(event.request.size, 24);
    }

    #[test]
    fn binary_bodies_are_base64_encoded() {
        let event = EventBuilder::new().binary_body(vec![0xff, 0x00, 0x7f]).build();

        assert_eq!(event.request.body_encoding, BodyEncoding::Base64);
        assert_eq!(event.request.decoded_body().unwrap().as_ref(), &[0xff, 0x00, 0x7f]);
    }

    #[test]
    fn routing_helper_builds_rules_in_order() {
        let config = routing(
            vec![destination("a", "http://a.test"), destination("b", "http://b.test")],
            &[("stripe", "a"), ("*", "b")],
        );

        assert_eq!(config.rules.len(), 2);
        assert!(config.rules[1].source_match.matches("anything"));
    }
}
