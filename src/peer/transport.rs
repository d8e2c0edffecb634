//! HTTP transport used by the peer pollers.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Per-request bound for peer HTTP calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection, DNS, TLS or I/O failure
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Status and body of a completed request, whatever the status code.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        HttpResponse {
            status: 200,
            body: body.into(),
        }
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Minimal HTTP surface needed for peer sync.
///
/// Non-2xx answers are responses, not errors; only transport failures are `Err`.
pub trait PeerTransport: Send + Sync {
    fn get(&self, url: String) -> TransportFuture<'_>;

    fn post_json(&self, url: String, body: String) -> TransportFuture<'_>;
}

/// Blocking `ureq` agent driven from tokio's blocking pool.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(&format!("sitewatch/{}", env!("CARGO_PKG_VERSION")))
            .build();
        UreqTransport { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(HTTP_TIMEOUT)
    }
}

impl PeerTransport for UreqTransport {
    fn get(&self, url: String) -> TransportFuture<'_> {
        let agent = self.agent.clone();
        Box::pin(run_blocking(move || into_response(agent.get(&url).call())))
    }

    fn post_json(&self, url: String, body: String) -> TransportFuture<'_> {
        let agent = self.agent.clone();
        Box::pin(run_blocking(move || {
            into_response(
                agent
                    .post(&url)
                    .set("Content-Type", "application/json")
                    .send_string(&body),
            )
        }))
    }
}

async fn run_blocking<F>(call: F) -> Result<HttpResponse, TransportError>
where
    F: FnOnce() -> Result<HttpResponse, TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| TransportError::Request(format!("HTTP worker failed: {}", e)))?
}

fn into_response(
    result: Result<ureq::Response, ureq::Error>,
) -> Result<HttpResponse, TransportError> {
    match result {
        Ok(response) | Err(ureq::Error::Status(_, response)) => {
            let status = response.status();
            let body = response
                .into_string()
                .map_err(|e| TransportError::Request(e.to_string()))?;
            Ok(HttpResponse { status, body })
        }
        Err(ureq::Error::Transport(e)) => Err(TransportError::Request(e.to_string())),
    }
}
