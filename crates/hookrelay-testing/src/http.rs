//! Mock webhook destinations backed by wiremock.
//!
//! A `MockDestination` is an HTTP server that receives forwarded events.
//! Failure modes are queued in front of a success response so retry
//! sequences can be scripted.

use std::{net::TcpListener, time::Duration};

use http::StatusCode;
use wiremock::{matchers::any, Mock, MockServer, Request, ResponseTemplate};

/// Ways a destination can misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Response arrives after `delay`, past any short client timeout.
    Timeout {
        /// How long the server stalls before answering.
        delay: Duration,
    },
    /// Server answers with the given status. Still counts as delivered.
    Status(StatusCode),
}

impl FailureKind {
    /// Stall long enough to trip a 100ms client timeout.
    pub const SLOW: Self = Self::Timeout { delay: Duration::from_millis(500) };

    fn response(self) -> ResponseTemplate {
        match self {
            Self::Timeout { delay } => ResponseTemplate::new(200).set_delay(delay),
            Self::Status(status) => ResponseTemplate::new(status.as_u16()),
        }
    }
}

/// HTTP server standing in for a local webhook consumer.
pub struct MockDestination {
    server: MockServer,
}

impl MockDestination {
    /// Starts a destination that accepts nothing until mocks are mounted.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Starts a destination answering `200 OK` to every request.
    pub async fn healthy() -> Self {
        let destination = Self::start().await;
        destination.respond_with_status(StatusCode::OK).await;
        destination
    }

    /// Base URL of the destination.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Full URL for `path`.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.server.uri(), path.trim_start_matches('/'))
    }

    /// `host:port` for TCP health probes.
    pub fn address(&self) -> String {
        self.server.address().to_string()
    }

    /// Answers every request with `status`.
    pub async fn respond_with_status(&self, status: StatusCode) {
        Mock::given(any())
            .respond_with(ResponseTemplate::new(status.as_u16()))
            .mount(&self.server)
            .await;
    }

    /// Answers every request with `status` and a body.
    pub async fn respond_with_body(&self, status: StatusCode, body: impl Into<Vec<u8>>) {
        Mock::given(any())
            .respond_with(ResponseTemplate::new(status.as_u16()).set_body_bytes(body.into()))
            .mount(&self.server)
            .await;
    }

    /// Answers every request with `200 OK` after `delay`.
    pub async fn respond_after(&self, delay: Duration) {
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    /// Fails the first `times` forwarded requests, then answers `200 OK`.
    ///
    /// Health probe `HEAD` requests are not counted.
    pub async fn fail_then_succeed(&self, failure: FailureKind, times: u64) {
        if times > 0 {
            Mock::given(NotHead)
                .respond_with(failure.response())
                .up_to_n_times(times)
                .with_priority(1)
                .mount(&self.server)
                .await;
        }
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .with_priority(5)
            .mount(&self.server)
            .await;
    }

    /// Fails every request.
    pub async fn always_fail(&self, failure: FailureKind) {
        Mock::given(any()).respond_with(failure.response()).mount(&self.server).await;
    }

    /// Every request received so far, including probes.
    pub async fn received_requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    /// Requests other than health probes.
    pub async fn forwarded_requests(&self) -> Vec<Request> {
        self.received_requests()
            .await
            .into_iter()
            .filter(|request| request.method.as_str() != "HEAD")
            .collect()
    }

    /// Number of forwarded requests.
    pub async fn forwarded_count(&self) -> usize {
        self.forwarded_requests().await.len()
    }

    /// Removes all mocks and recorded requests.
    pub async fn reset(&self) {
        self.server.reset().await;
    }
}

impl std::fmt::Debug for MockDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDestination").field("url", &self.server.uri()).finish()
    }
}

/// Matches everything except health probe `HEAD` requests.
struct NotHead;

impl wiremock::Match for NotHead {
    fn matches(&self, request: &Request) -> bool {
        request.method.as_str() != "HEAD"
    }
}

/// `host:port` on loopback with nothing listening.
pub fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let address = listener.local_addr().expect("local address");
    drop(listener);
    address.to_string()
}

/// URL of a destination that refuses connections.
pub fn refused_url() -> String {
    format!("http://{}/hook", closed_address())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_precede_success() {
        let destination = MockDestination::start().await;
        destination.fail_then_succeed(FailureKind::Status(StatusCode::BAD_GATEWAY), 2).await;
        let client = reqwest::Client::new();
        let url = destination.url_for("/hook");

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(client.post(&url).send().await.unwrap().status().as_u16());
        }

        assert_eq!(statuses, vec![502, 502, 200]);
        assert_eq!(destination.forwarded_count().await, 3);
    }

    #[tokio::test]
    async fn probes_are_not_counted_as_forwarded() {
        let destination = MockDestination::start().await;
        destination
            .fail_then_succeed(FailureKind::Status(StatusCode::SERVICE_UNAVAILABLE), 1)
            .await;
        let client = reqwest::Client::new();

        client.head(destination.url()).send().await.unwrap();
        let status = client.post(destination.url_for("hook")).send().await.unwrap().status();

        assert_eq!(status.as_u16(), 503);
        assert_eq!(destination.forwarded_count().await, 1);
        assert_eq!(destination.received_requests().await.len(), 2);
    }

    #[test]
    fn refused_url_points_at_loopback() {
        assert!(refused_url().starts_with("http://127.0.0.1:"));
    }
}
