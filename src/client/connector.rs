//! Retrying HTTP connector
//!
//! Used both for health probing a freshly exposed service and for
//! best-effort delivery of state to the Hub. Probes are bounded; deliveries
//! retry transient failures until they succeed or the session is cancelled.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default number of health probe attempts
pub const DEFAULT_RETRIES: u32 = 3;

/// Default per-attempt request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between two attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A single failed request, classified for the retry policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, timeout, non-success status: worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed address or unresolvable host: retrying cannot help
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Couldn't reach the URL: {url} after {retries} retries")]
    Unreachable { url: String, retries: u32 },

    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),
}

/// How a reliable delivery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Given up after a permanent error (or an unserializable payload)
    Abandoned(String),
    /// The shared cancellation signal fired first
    Cancelled,
}

/// Immutable connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub url: String,
    pub retries: u32,
    pub timeout: Duration,
}

impl ConnectionTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<(), TransportError>;

    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<(), TransportError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::ClientBuild(e.to_string()))?;
        Ok(Self { client })
    }

    async fn check(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<(), TransportError> {
        let response = response.map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Transient(format!("HTTP {}", status.as_u16())))
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<(), TransportError> {
        Self::check(self.client.get(url).send().await).await
    }

    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        Self::check(response).await
    }
}

/// Map a reqwest failure onto the retry policy.
pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_builder() || is_dns_failure(err) {
        TransportError::Permanent(err.to_string())
    } else {
        TransportError::Transient(err.to_string())
    }
}

fn is_dns_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(current) = source {
        if current.to_string().contains("dns error") {
            return true;
        }
        source = current.source();
    }
    false
}

// ============================================================================
// Connector
// ============================================================================

pub struct Connector<T: HttpTransport = ReqwestTransport> {
    target: ConnectionTarget,
    transport: T,
    retry_delay: Duration,
}

impl Connector<ReqwestTransport> {
    /// Connector backed by a real HTTP client honoring the target's timeout
    pub fn http(target: ConnectionTarget) -> Result<Self, ConnectorError> {
        let transport = ReqwestTransport::new(target.timeout)?;
        Ok(Self::with_transport(target, transport))
    }
}

impl<T: HttpTransport> Connector<T> {
    pub fn with_transport(target: ConnectionTarget, transport: T) -> Self {
        Self {
            target,
            transport,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.target.url
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Health-check `path`, retrying up to the target's retry budget.
    ///
    /// Any failure counts as "not ready yet"; only exhausting the budget is
    /// reported.
    pub async fn probe(&self, path: &str) -> Result<(), ConnectorError> {
        let url = format!("{}{}", self.target.url, path);

        for attempt in 1..=self.target.retries {
            match self.transport.get(&url).await {
                Ok(()) => {
                    debug!(url = %url, attempt, "Connection test passed successfully");
                    return Ok(());
                }
                Err(e) => {
                    debug!(url = %url, attempt, error = %e, "Not ready yet");
                }
            }

            if attempt < self.target.retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(ConnectorError::Unreachable {
            url: self.target.url.clone(),
            retries: self.target.retries,
        })
    }

    /// Deliver `payload` as JSON to `endpoint`, retrying transient failures
    /// until success, a permanent failure, or cancellation.
    pub async fn deliver_reliably<P: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        payload: &P,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to marshal the payload");
                return DeliveryOutcome::Abandoned(e.to_string());
            }
        };

        let url = format!("{}{}", self.target.url, endpoint);

        loop {
            if cancel.is_cancelled() {
                return DeliveryOutcome::Cancelled;
            }

            match self.transport.post_json(&url, body.clone()).await {
                Ok(()) => return DeliveryOutcome::Delivered,
                Err(TransportError::Permanent(reason)) => {
                    debug!(url = %url, reason = %reason, "Abandoning delivery");
                    return DeliveryOutcome::Abandoned(reason);
                }
                Err(TransportError::Transient(reason)) => {
                    debug!(url = %url, reason = %reason, "Failed sending to Hub, retrying");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return DeliveryOutcome::Cancelled,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
