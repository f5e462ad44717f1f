//! Broker wire-format tests for the domain models.

use hookrelay_core::models::{
    BodyEncoding, DeliveryOutcome, Destination, EventId, EventStatus, HealthProbe,
    RoutingConfig, StatusUpdate, WebhookEvent,
};
use serde_json::json;

#[test]
fn broker_event_payload_deserializes() {
    let payload = json!({
        "id": "evt_123",
        "source": "stripe",
        "request": {
            "method": "PUT",
            "headers": {"content-type": "application/json", "stripe-signature": "t=1,v1=abc"},
            "body": "eyJvayI6dHJ1ZX0=",
            "body_encoding": "base64",
            "size": 11,
            "client_ip": "203.0.113.9",
            "received_at": "2024-05-01T12:00:00Z"
        },
        "status": "processing",
        "retry_count": 1,
        "max_retries": 5
    });

    let event: WebhookEvent = serde_json::from_value(payload).unwrap();

    assert_eq!(event.id, EventId::new("evt_123"));
    assert_eq!(event.status, EventStatus::Processing);
    assert_eq!(event.max_retries, 5);
    assert_eq!(event.request.method, "PUT");
    assert_eq!(event.request.body_encoding, BodyEncoding::Base64);
    assert_eq!(&event.request.decoded_body().unwrap()[..], br#"{"ok":true}"#);
    assert!(event.replay_of.is_none());
}

#[test]
fn status_update_omits_absent_fields() {
    let update = StatusUpdate::new(EventStatus::Pending, 2);
    assert_eq!(
        serde_json::to_value(&update).unwrap(),
        json!({"status": "pending", "retry_count": 2})
    );

    let failed = StatusUpdate::failed(2, "request timed out");
    assert_eq!(
        serde_json::to_value(&failed).unwrap(),
        json!({"status": "failed", "retry_count": 2, "failure_reason": "request timed out"})
    );
}

#[test]
fn routing_config_parses_tagged_probes() {
    let config: RoutingConfig = serde_json::from_value(json!({
        "destinations": [
            {"name": "local", "url": "http://localhost:3000/hook",
             "health_probe": {"type": "tcp", "target": "localhost:3000"}},
            {"name": "remote", "url": "https://api.example.com/hook",
             "health_probe": {"type": "http", "url": "https://api.example.com/health"},
             "max_retries": 7}
        ],
        "rules": [
            {"source": "stripe", "destination": "local"},
            {"source": "*", "destination": "remote"}
        ]
    }))
    .unwrap();

    assert_eq!(
        config.destination("local").and_then(|d| d.health_probe.clone()),
        Some(HealthProbe::Tcp { target: "localhost:3000".into() })
    );
    assert_eq!(config.destination("remote").and_then(|d| d.max_retries), Some(7));
    assert!(config.destination("missing").is_none());
    assert_eq!(config.rules.len(), 2);
}

#[test]
fn failure_outcome_has_no_response() {
    let outcome = DeliveryOutcome::failure("connection refused", std::time::Duration::ZERO);
    let value = serde_json::to_value(&outcome).unwrap();

    assert_eq!(value["status"], "failure");
    assert!(value["http_status"].is_null());
    assert!(value["response_body"].is_null());
}

#[test]
fn destination_builders_set_optional_fields() {
    let destination = Destination::new("web", "http://localhost:8080/")
        .with_max_retries(1)
        .with_probe(HealthProbe::Tcp { target: "localhost:8080".into() });

    assert_eq!(destination.max_retries, Some(1));
    assert!(destination.health_probe.is_some());
}
