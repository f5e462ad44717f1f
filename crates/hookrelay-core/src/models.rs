//! Core domain models and strongly-typed identifiers.
//!
//! Defines brokered webhook events, forwarding destinations, routing rules,
//! the ephemeral delivery task and its outcome, and the health records fed
//! by destination probes.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Retry budget applied to events that arrive without one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Wildcard accepted by [`SourceMatch`] to match every source label.
pub const WILDCARD_SOURCE: &str = "*";

/// Strongly-typed event identifier.
///
/// Identifiers are assigned by the remote broker and are opaque to the agent.
/// Replay lineages derive their identifier from the original event.
///
/// # Example
///
/// ```
/// use hookrelay_core::models::EventId;
/// let event_id = EventId::new("evt_1");
/// assert_eq!(event_id.to_string(), "evt_1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Wraps a broker-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Event lifecycle status.
///
/// ```text
/// Pending -> Processing -> Completed
///    ^            |
///    └────────────┴-> Failed (after max retries)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for its first attempt, or for a scheduled retry.
    Pending,

    /// First delivery attempt in flight.
    Processing,

    /// Delivered. Terminal.
    Completed,

    /// Retries exhausted or a non-retryable failure. Terminal.
    Failed,
}

impl EventStatus {
    /// Whether no further automatic delivery happens from this status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Transport encoding the broker applied to a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// Body is carried verbatim as UTF-8 text.
    #[default]
    Plain,
    /// Body is carried as standard base64.
    Base64,
}

impl BodyEncoding {
    /// Decodes a transported body back into raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPayload` if a base64 body is malformed.
    pub fn decode(self, body: &str) -> Result<Bytes> {
        match self {
            Self::Plain => Ok(Bytes::copy_from_slice(body.as_bytes())),
            Self::Base64 => STANDARD
                .decode(body)
                .map(Bytes::from)
                .map_err(|e| CoreError::InvalidPayload(format!("invalid base64 body: {e}"))),
        }
    }

    /// Encodes raw bytes the same way for storage.
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Plain => String::from_utf8_lossy(bytes).into_owned(),
            Self::Base64 => STANDARD.encode(bytes),
        }
    }
}

/// The HTTP request that originally delivered the webhook to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRequest {
    /// HTTP method, forwarded verbatim.
    pub method: String,

    /// Original request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Body as transported by the broker, see `body_encoding`.
    #[serde(default)]
    pub body: Option<String>,

    /// How `body` was encoded for transport.
    #[serde(default)]
    pub body_encoding: BodyEncoding,

    /// Size of the original body in bytes.
    #[serde(default)]
    pub size: u64,

    /// Address of the client that called the broker.
    #[serde(default)]
    pub client_ip: Option<String>,

    /// When the broker received the request.
    pub received_at: DateTime<Utc>,
}

impl OriginRequest {
    /// Creates a POST request with a plain-text body.
    pub fn post(body: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        let body = body.into();
        Self {
            method: "POST".to_string(),
            headers: HashMap::new(),
            size: body.len() as u64,
            body: Some(body),
            body_encoding: BodyEncoding::Plain,
            client_ip: None,
            received_at,
        }
    }

    /// Body decoded from its transport encoding. Empty when absent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPayload` if the body cannot be decoded.
    pub fn decoded_body(&self) -> Result<Bytes> {
        match &self.body {
            Some(body) => self.body_encoding.decode(body),
            None => Ok(Bytes::new()),
        }
    }
}

/// Inbound webhook occurrence queued by the remote broker.
///
/// The agent never deletes events. Status and retry bookkeeping are written
/// back through the event source and outcome sink collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Broker-assigned identifier.
    pub id: EventId,

    /// Origin system label, e.g. `stripe`.
    pub source: String,

    /// The request as received by the broker.
    pub request: OriginRequest,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Retries already consumed.
    #[serde(default)]
    pub retry_count: u32,

    /// Retry budget after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Most recent delivery error once failed.
    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Original event when this is a manual replay lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<EventId>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl WebhookEvent {
    /// Creates a pending event with the default retry budget.
    pub fn new(id: impl Into<EventId>, source: impl Into<String>, request: OriginRequest) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            request,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            failure_reason: None,
            replay_of: None,
        }
    }

    /// Whether the event reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Identifier outcomes are recorded under.
    ///
    /// Replays record against the original event so history stays in one
    /// place.
    pub fn trace_id(&self) -> &EventId {
        self.replay_of.as_ref().unwrap_or(&self.id)
    }
}

/// Source label matcher of a delivery rule.
///
/// Serialized as a plain string where `*` means any source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceMatch {
    /// Matches every source label.
    Any,
    /// Matches one source label exactly.
    Exact(String),
}

impl SourceMatch {
    /// Whether this matcher accepts the given source label.
    pub fn matches(&self, source: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == source,
        }
    }
}

impl From<String> for SourceMatch {
    fn from(value: String) -> Self {
        if value == WILDCARD_SOURCE {
            Self::Any
        } else {
            Self::Exact(value)
        }
    }
}

impl From<&str> for SourceMatch {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<SourceMatch> for String {
    fn from(value: SourceMatch) -> Self {
        match value {
            SourceMatch::Any => WILDCARD_SOURCE.to_string(),
            SourceMatch::Exact(source) => source,
        }
    }
}

impl fmt::Display for SourceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(WILDCARD_SOURCE),
            Self::Exact(source) => f.write_str(source),
        }
    }
}

/// Declarative `source -> destination` routing entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryRule {
    /// Which source labels this rule applies to.
    #[serde(rename = "source")]
    pub source_match: SourceMatch,

    /// Name of the destination receiving matching events.
    pub destination: String,
}

impl DeliveryRule {
    /// Creates a rule; `"*"` matches every source.
    pub fn new(source_match: impl Into<SourceMatch>, destination: impl Into<String>) -> Self {
        Self { source_match: source_match.into(), destination: destination.into() }
    }
}

/// Liveness probe for a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthProbe {
    /// TCP connect against a local `host:port`.
    Tcp {
        /// `host:port` to connect to.
        target: String,
    },
    /// HEAD request against a remote URL.
    Http {
        /// Absolute http(s) URL.
        url: String,
    },
}

impl HealthProbe {
    /// Derives the natural probe for a destination URL.
    ///
    /// Loopback hosts get a TCP port check, anything else a HEAD request.
    /// Returns `None` when the URL has no host.
    pub fn derive(destination_url: &str) -> Option<Self> {
        let url = url::Url::parse(destination_url).ok()?;
        let host = url.host_str()?;
        let is_loopback = host == "localhost"
            || host.parse::<std::net::IpAddr>().is_ok_and(|ip| ip.is_loopback())
            || host.trim_matches(|c| c == '[' || c == ']') == "::1";

        if is_loopback {
            let port = url.port_or_known_default()?;
            Some(Self::Tcp { target: format!("{host}:{port}") })
        } else {
            Some(Self::Http { url: destination_url.to_string() })
        }
    }

    /// Checks that the probe target can be probed at all.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a TCP target without a valid
    /// port or an HTTP target that is not an absolute http(s) URL.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Tcp { target } => {
                let (host, port) = target.rsplit_once(':').ok_or_else(|| {
                    CoreError::InvalidInput(format!("probe target '{target}' has no port"))
                })?;
                if host.is_empty() {
                    return Err(CoreError::InvalidInput(format!(
                        "probe target '{target}' has no host"
                    )));
                }
                port.parse::<u16>().map_err(|_| {
                    CoreError::InvalidInput(format!("probe target '{target}' has an invalid port"))
                })?;
                Ok(())
            },
            Self::Http { url } => {
                let parsed = url::Url::parse(url).map_err(|e| {
                    CoreError::InvalidInput(format!("probe url '{url}' is invalid: {e}"))
                })?;
                if matches!(parsed.scheme(), "http" | "https") {
                    Ok(())
                } else {
                    Err(CoreError::InvalidInput(format!("probe url '{url}' is not http(s)")))
                }
            },
        }
    }
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { target } => write!(f, "tcp://{target}"),
            Self::Http { url } => write!(f, "head {url}"),
        }
    }
}

/// Named forwarding target.
///
/// URLs are normalized to a single absolute string when configuration is
/// loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Unique name referenced by delivery rules.
    pub name: String,

    /// Absolute URL events are forwarded to.
    pub url: String,

    /// Optional liveness probe.
    #[serde(default)]
    pub health_probe: Option<HealthProbe>,

    /// Overrides the event's retry budget for this destination.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Destination {
    /// Creates a destination without a probe.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into(), health_probe: None, max_retries: None }
    }

    /// Attaches a liveness probe.
    #[must_use]
    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.health_probe = Some(probe);
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Snapshot of the destination set and routing rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Known destinations.
    #[serde(default)]
    pub destinations: Vec<Destination>,

    /// Rules in declaration order.
    #[serde(default)]
    pub rules: Vec<DeliveryRule>,
}

impl RoutingConfig {
    /// Creates a routing snapshot.
    pub fn new(destinations: Vec<Destination>, rules: Vec<DeliveryRule>) -> Self {
        Self { destinations, rules }
    }

    /// Looks up a destination by name.
    pub fn destination(&self, name: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.name == name)
    }
}

/// Identity of one (event, destination) delivery lineage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineageKey {
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination receiving it.
    pub destination: String,
}

impl LineageKey {
    /// Creates a lineage key.
    pub fn new(event_id: EventId, destination: impl Into<String>) -> Self {
        Self { event_id, destination: destination.into() }
    }
}

impl fmt::Display for LineageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.event_id, self.destination)
    }
}

/// One forwarding attempt for a specific (event, destination) pair.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    /// Event being forwarded.
    pub event: Arc<WebhookEvent>,
    /// Where it is forwarded to.
    pub destination: Destination,
    /// 1-based attempt number within the lineage.
    pub attempt_number: u32,
}

impl DeliveryTask {
    /// Lineage this task belongs to.
    pub fn key(&self) -> LineageKey {
        LineageKey::new(self.event.id.clone(), self.destination.name.clone())
    }
}

/// Whether an attempt reached the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Destination returned an HTTP response, whatever its status code.
    Success,
    /// Transport failed before a response was read.
    Failure,
}

/// Result of executing one delivery task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Transport-level result.
    pub status: OutcomeStatus,

    /// HTTP status returned by the destination.
    pub http_status: Option<u16>,

    /// Response headers returned by the destination.
    #[serde(default)]
    pub response_headers: HashMap<String, String>,

    /// Response body, encoded like the request body was.
    pub response_body: Option<String>,

    /// Encoding applied to `response_body`.
    #[serde(default)]
    pub response_encoding: BodyEncoding,

    /// Wall-clock latency of the attempt in milliseconds.
    pub latency_ms: u64,

    /// Human-readable transport error.
    pub error: Option<String>,
}

impl DeliveryOutcome {
    /// Outcome for an attempt that received an HTTP response.
    pub fn success(
        http_status: u16,
        response_headers: HashMap<String, String>,
        response_body: String,
        response_encoding: BodyEncoding,
        latency: Duration,
    ) -> Self {
        Self {
            status: OutcomeStatus::Success,
            http_status: Some(http_status),
            response_headers,
            response_body: Some(response_body),
            response_encoding,
            latency_ms: duration_millis(latency),
            error: None,
        }
    }

    /// Outcome for an attempt whose transport failed.
    pub fn failure(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            http_status: None,
            response_headers: HashMap::new(),
            response_body: None,
            response_encoding: BodyEncoding::Plain,
            latency_ms: duration_millis(latency),
            error: Some(error.into()),
        }
    }

    /// Whether the destination answered.
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Attempt history entry handed to the outcome sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Event the history belongs to (the original for replays).
    pub event_id: EventId,

    /// Lineage that produced the attempt; differs from `event_id` for
    /// replays.
    pub lineage_id: EventId,

    /// Destination name.
    pub destination: String,

    /// 1-based attempt number within the lineage.
    pub attempt_number: u32,

    /// Attempt result.
    pub outcome: DeliveryOutcome,

    /// When the attempt finished.
    pub attempted_at: DateTime<Utc>,
}

/// Status write-back for the remote event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// New status.
    pub status: EventStatus,

    /// Retries consumed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Final error for failed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl StatusUpdate {
    /// Creates a status update carrying the retry count.
    pub fn new(status: EventStatus, retry_count: u32) -> Self {
        Self { status, retry_count: Some(retry_count), failure_reason: None }
    }

    /// Terminal failure carrying the last error.
    pub fn failed(retry_count: u32, failure_reason: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Failed,
            retry_count: Some(retry_count),
            failure_reason: Some(failure_reason.into()),
        }
    }
}

/// Latest liveness assessment of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Result of the most recent probe.
    pub is_healthy: bool,

    /// When the most recent probe completed.
    pub last_checked_at: Option<DateTime<Utc>>,

    /// Listening process, for probes able to identify it.
    pub process_id: Option<u32>,
}

impl HealthRecord {
    /// Record for a probe that succeeded at `checked_at`.
    pub fn healthy(checked_at: DateTime<Utc>) -> Self {
        Self { is_healthy: true, last_checked_at: Some(checked_at), process_id: None }
    }

    /// Record for a probe that failed at `checked_at`.
    pub fn unhealthy(checked_at: DateTime<Utc>) -> Self {
        Self { is_healthy: false, last_checked_at: Some(checked_at), process_id: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rule_matches_any_source() {
        let rule = DeliveryRule::new("*", "web");
        assert_eq!(rule.source_match, SourceMatch::Any);
        assert!(rule.source_match.matches("stripe"));
        assert!(rule.source_match.matches("github"));
    }

    #[test]
    fn exact_rule_matches_only_its_source() {
        let rule = DeliveryRule::new("stripe", "web");
        assert!(rule.source_match.matches("stripe"));
        assert!(!rule.source_match.matches("Stripe"));
        assert!(!rule.source_match.matches("github"));
    }

    #[test]
    fn source_match_serializes_as_plain_string() {
        let rule: DeliveryRule =
            serde_json::from_str(r#"{"source":"*","destination":"web"}"#).unwrap();
        assert_eq!(rule.source_match, SourceMatch::Any);

        let json = serde_json::to_string(&DeliveryRule::new("stripe", "api")).unwrap();
        assert_eq!(json, r#"{"source":"stripe","destination":"api"}"#);
    }

    #[test]
    fn base64_body_decodes_and_reencodes() {
        let encoded = BodyEncoding::Base64.encode(b"{\"ok\":true}");
        let decoded = BodyEncoding::Base64.decode(&encoded).unwrap();
        assert_eq!(&decoded[..], b"{\"ok\":true}");
    }

    #[test]
    fn malformed_base64_body_is_rejected() {
        let err = BodyEncoding::Base64.decode("not base64!!").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload(_)));
    }

    #[test]
    fn missing_body_decodes_to_empty() {
        let mut request = OriginRequest::post("", Utc::now());
        request.body = None;
        assert!(request.decoded_body().unwrap().is_empty());
    }

    #[test]
    fn terminal_statuses_identified() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
    }

    #[test]
    fn event_defaults_max_retries_when_absent() {
        let json = r#"{
            "id": "evt_1",
            "source": "stripe",
            "request": {"method": "POST", "received_at": "2024-01-01T00:00:00Z"},
            "status": "pending"
        }"#;
        let event: WebhookEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.trace_id(), &EventId::new("evt_1"));
    }

    #[test]
    fn replay_traces_to_original() {
        let mut event =
            WebhookEvent::new("evt_1:replay:1", "stripe", OriginRequest::post("", Utc::now()));
        event.replay_of = Some(EventId::new("evt_1"));
        assert_eq!(event.trace_id().as_str(), "evt_1");
    }

    #[test]
    fn loopback_urls_derive_tcp_probe() {
        assert_eq!(
            HealthProbe::derive("http://localhost:3000/webhooks"),
            Some(HealthProbe::Tcp { target: "localhost:3000".to_string() })
        );
        assert_eq!(
            HealthProbe::derive("http://127.0.0.1/hook"),
            Some(HealthProbe::Tcp { target: "127.0.0.1:80".to_string() })
        );
        assert_eq!(
            HealthProbe::derive("https://api.example.com/hook"),
            Some(HealthProbe::Http { url: "https://api.example.com/hook".to_string() })
        );
        assert_eq!(HealthProbe::derive("not a url"), None);
    }

    #[test]
    fn probe_validation_rejects_unparseable_targets() {
        assert!(HealthProbe::Tcp { target: "localhost:3000".into() }.validate().is_ok());
        assert!(HealthProbe::Tcp { target: "localhost".into() }.validate().is_err());
        assert!(HealthProbe::Tcp { target: "localhost:99999".into() }.validate().is_err());
        assert!(HealthProbe::Tcp { target: ":3000".into() }.validate().is_err());
        assert!(HealthProbe::Http { url: "https://example.com".into() }.validate().is_ok());
        assert!(HealthProbe::Http { url: "ftp://example.com".into() }.validate().is_err());
        assert!(HealthProbe::Http { url: "::nope".into() }.validate().is_err());
    }

    #[test]
    fn outcome_constructors_set_status() {
        let ok = DeliveryOutcome::success(
            503,
            HashMap::new(),
            "busy".to_string(),
            BodyEncoding::Plain,
            Duration::from_millis(12),
        );
        assert!(ok.is_success());
        assert_eq!(ok.http_status, Some(503));
        assert_eq!(ok.latency_ms, 12);

        let failed = DeliveryOutcome::failure("connection refused", Duration::from_millis(3));
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("connection refused"));
    }
}
