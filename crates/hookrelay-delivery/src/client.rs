//! HTTP client forwarding one event to one destination.
//!
//! Replays the origin request verbatim apart from the `host` header and
//! hop-by-hop headers, decodes transport-encoded bodies before sending and
//! captures the response for the outcome sink. Any HTTP response counts as a
//! successful delivery; only transport failures are failures.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use hookrelay_core::models::{DeliveryOutcome, DeliveryTask};
use reqwest::{header::HeaderMap, Method, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Response bodies above this size are truncated before storage.
pub const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout covering send and full response read.
    pub timeout: Duration,
    /// User agent used when the origin request carried none.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Response bytes kept for the outcome.
    pub max_response_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("hookrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            max_response_body_bytes: MAX_RESPONSE_BODY_BYTES,
        }
    }
}

/// HTTP client used for every forwarding attempt.
///
/// Shares one connection pool across destinations.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// Response captured from a destination.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, at most `max_response_body_bytes`.
    pub body: Bytes,
    /// Whether the body was cut at the size limit.
    pub truncated: bool,
    /// Time from just before send until the body was fully read.
    pub duration: Duration,
}

/// Result of one forwarding attempt.
///
/// `outcome` is what gets recorded. `error` keeps the typed failure so the
/// retry coordinator can tell transient from permanent failures.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Outcome handed to the sink.
    pub outcome: DeliveryOutcome,
    /// Typed failure, `None` when the destination answered.
    pub error: Option<DeliveryError>,
}

impl Attempt {
    /// Attempt that never reached the network.
    pub fn rejected(error: DeliveryError) -> Self {
        Self {
            outcome: DeliveryOutcome::failure(error.to_string(), Duration::ZERO),
            error: Some(error),
        }
    }

    /// Whether a failed attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(DeliveryError::is_retryable)
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs one attempt and converts it into a recordable outcome.
    ///
    /// Never fails: transport and configuration errors become failure
    /// outcomes. The response body is re-encoded like the request body.
    pub async fn execute(&self, task: &DeliveryTask) -> Attempt {
        match self.deliver(task).await {
            Ok(response) => {
                let encoding = task.event.request.body_encoding;
                Attempt {
                    outcome: DeliveryOutcome::success(
                        response.status_code,
                        response.headers,
                        encoding.encode(&response.body),
                        encoding,
                        response.duration,
                    ),
                    error: None,
                }
            },
            Err(error) => Attempt::rejected(error),
        }
    }

    /// Forwards the task's event to its destination.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` for a relative destination URL or invalid method
    /// - `InvalidPayload` if the body cannot be decoded
    /// - `Timeout`, `DnsError`, `TlsError` or `NetworkError` for transport
    ///   failures
    pub async fn deliver(&self, task: &DeliveryTask) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            event_id = %task.event.id,
            destination = %task.destination.name,
            url = %task.destination.url,
            attempt = task.attempt_number
        );

        async move {
            let url = url::Url::parse(&task.destination.url).map_err(|e| {
                DeliveryError::configuration(format!(
                    "destination url '{}' is not absolute: {e}",
                    task.destination.url
                ))
            })?;
            let request = &task.event.request;
            let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
                DeliveryError::configuration(format!("invalid http method '{}'", request.method))
            })?;
            let body = request.decoded_body()?;

            let mut http_request = self.client.request(method, url);
            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }
            if !body.is_empty() {
                http_request = http_request.body(body);
            }

            tracing::debug!("forwarding event");
            let start_time = Instant::now();

            let response = http_request.send().await.map_err(|e| {
                tracing::warn!(
                    duration_ms = start_time.elapsed().as_millis(),
                    "request failed: {}",
                    e
                );
                self.classify(&e)
            })?;

            let delivery_response = self.read_response(response, start_time).await?;

            match delivery_response.status_code {
                200..=299 => tracing::info!(
                    status = delivery_response.status_code,
                    latency_ms = delivery_response.duration.as_millis(),
                    "event delivered"
                ),
                status => tracing::warn!(
                    status,
                    latency_ms = delivery_response.duration.as_millis(),
                    "destination answered with non-2xx status"
                ),
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    /// Reads the full response, keeping at most the configured body size.
    async fn read_response(
        &self,
        mut response: Response,
        start_time: Instant,
    ) -> Result<DeliveryResponse> {
        let status_code = response.status().as_u16();
        let headers = extract_headers(response.headers());
        let limit = self.config.max_response_body_bytes;

        let mut body = BytesMut::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(&e))? {
            let room = limit.saturating_sub(body.len());
            if chunk.len() > room {
                truncated = true;
            }
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }

        if truncated {
            tracing::debug!(limit, "response body truncated");
        }

        Ok(DeliveryResponse {
            status_code,
            headers,
            body: body.freeze(),
            truncated,
            duration: start_time.elapsed(),
        })
    }

    /// Maps a reqwest failure onto the transport error taxonomy.
    fn classify(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
            return DeliveryError::timeout(timeout_ms);
        }

        let message = error_chain(error);
        let lowercase = message.to_lowercase();
        if lowercase.contains("dns error") || lowercase.contains("failed to lookup address") {
            DeliveryError::dns(message)
        } else if lowercase.contains("certificate")
            || lowercase.contains("tls")
            || lowercase.contains("handshake")
        {
            DeliveryError::tls(message)
        } else if error.is_connect() {
            DeliveryError::network(format!("connection failed: {message}"))
        } else {
            DeliveryError::network(message)
        }
    }
}

/// Joins an error and its sources into one readable message.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|value| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Headers owned by the connection to the destination rather than the
/// origin request.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
