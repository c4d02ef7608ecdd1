//! Rate-limited, retrying HTTP client shared by the embedding client and the
//! REST-backed source adapters (§4.3).
//!
//! Builds on the same request/response handling as `qdrant::client::QdrantService`
//! (`ensure_success`, status-based error classification), generalized with a
//! per-host token bucket (`governor`) and exponential backoff with full
//! jitter for the many untrusted remote hosts source adapters and embedding
//! providers call.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{Quota, RateLimiter as GovernorLimiter};
use rand::Rng;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;

use crate::error::ErrorKind;

type HostLimiter = GovernorLimiter<String, governor::state::keyed::DefaultKeyedStateStore<String>, governor::clock::DefaultClock>;

/// Errors raised while issuing a rate-limited HTTP call.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request could not be constructed.
    #[error("request build error: {0}")]
    Build(String),
    /// The upstream rejected credentials (401/403); never retried.
    #[error("authentication failed: {status} {body}")]
    Auth { status: StatusCode, body: String },
    /// A retryable status (429/5xx) persisted past `max_retries`.
    #[error("transient failure after {attempts} attempts: {status} {body}")]
    Transient {
        /// The last response status seen.
        status: StatusCode,
        /// The last response body seen.
        body: String,
        /// Total attempts made, including the first.
        attempts: u32,
    },
    /// A non-retryable 4xx status.
    #[error("invalid request: {status} {body}")]
    InvalidRequest {
        /// The response status.
        status: StatusCode,
        /// The response body.
        body: String,
    },
    /// A transport-level error persisted past `max_retries`.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The caller's cancellation token fired mid-request.
    #[error("cancelled")]
    Cancelled,
}

impl From<HttpClientError> for ErrorKind {
    fn from(e: HttpClientError) -> Self {
        match e {
            HttpClientError::Auth { .. } => ErrorKind::Auth(e.to_string()),
            HttpClientError::InvalidRequest { .. } | HttpClientError::Build(_) => {
                ErrorKind::InvalidRequest(e.to_string())
            }
            HttpClientError::Cancelled => ErrorKind::Cancelled,
            HttpClientError::Transient { .. } | HttpClientError::Network(_) => {
                ErrorKind::Transient(e.to_string())
            }
        }
    }
}

/// Retry/backoff/rate-limit policy for one logical upstream (§4.3).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first, for both transient statuses and network errors.
    pub max_retries: u32,
    /// Lower bound of the backoff range.
    pub backoff_min: Duration,
    /// Upper bound of the backoff range.
    pub backoff_max: Duration,
    /// Per-host token bucket rate, refilled continuously.
    pub requests_per_minute: u32,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(20),
            requests_per_minute: 600,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A `reqwest::Client` wrapped with a per-host token bucket and retry logic.
///
/// Safe for concurrent use: the limiter keys on the request's host, and
/// `reqwest::Client` is itself `Clone + Send + Sync` (§5).
pub struct RateLimitedHttpClient {
    client: Client,
    limiter: HostLimiter,
    policy: RetryPolicy,
}

impl RateLimitedHttpClient {
    /// Build a client from a retry/backoff/rate-limit policy.
    pub fn new(policy: RetryPolicy) -> Result<Self, HttpClientError> {
        let client = Client::builder()
            .user_agent("qdrant-loader/0.1")
            .timeout(policy.timeout)
            .build()
            .map_err(HttpClientError::Network)?;
        let rpm = NonZeroU32::new(policy.requests_per_minute.max(1)).expect("checked non-zero");
        let limiter = GovernorLimiter::keyed(Quota::per_minute(rpm));
        Ok(Self {
            client,
            limiter,
            policy,
        })
    }

    /// Issue `method path` against `base_url`, retrying transient failures
    /// with exponential backoff and full jitter, honoring `Retry-After`.
    ///
    /// `build` customizes the request (headers, json body) before it is
    /// rate-limited and sent; it may be called more than once across retries.
    pub async fn request_with_retry<F>(
        &self,
        method: Method,
        url: &str,
        cancel: &tokio_util::sync::CancellationToken,
        build: F,
    ) -> Result<Response, HttpClientError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(HttpClientError::Cancelled);
            }

            tokio::select! {
                _ = self.limiter.until_key_ready(&host) => {}
                _ = cancel.cancelled() => return Err(HttpClientError::Cancelled),
            }

            let request = build(self.client.request(method.clone(), url));
            let outcome = tokio::select! {
                result = request.send() => result,
                _ = cancel.cancelled() => return Err(HttpClientError::Cancelled),
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        let body = response.text().await.unwrap_or_default();
                        return Err(HttpClientError::Auth { status, body });
                    }
                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(HttpClientError::InvalidRequest { status, body });
                    }

                    // 429 and 5xx are transient; retry up to max_retries.
                    let retry_after = parse_retry_after(&response);
                    if attempt >= self.policy.max_retries {
                        let body = response.text().await.unwrap_or_default();
                        return Err(HttpClientError::Transient {
                            status,
                            body,
                            attempts: attempt + 1,
                        });
                    }
                    attempt += 1;
                    let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
                    tracing::warn!(url, %status, attempt, delay_ms = delay.as_millis() as u64, "retrying transient HTTP failure");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(HttpClientError::Cancelled),
                    }
                }
                Err(network_err) => {
                    if attempt >= self.policy.max_retries {
                        return Err(HttpClientError::Network(network_err));
                    }
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(url, error = %network_err, attempt, delay_ms = delay.as_millis() as u64, "retrying after network error");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(HttpClientError::Cancelled),
                    }
                }
            }
        }
    }

    /// Exponential backoff with full jitter: `uniform(0, min(max, base * 2^attempt))`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        full_jitter_backoff(attempt, self.policy.backoff_min, self.policy.backoff_max)
    }
}

/// Exponential backoff with full jitter: `uniform(0, min(cap, base * 2^(attempt-1)))`.
///
/// Shared by [`RateLimitedHttpClient`] and the orchestrator's Qdrant
/// batch-upsert retry (§4.8), so both callers compute delays the same way.
pub fn full_jitter_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base = base.as_secs_f64();
    let cap = cap.as_secs_f64();
    let exp = base * 2f64.powi(attempt as i32 - 1);
    let bounded = exp.min(cap);
    let jittered = rand::thread_rng().gen_range(0.0..=bounded.max(base));
    Duration::from_secs_f64(jittered)
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    let header = response.headers().get(reqwest::header::RETRY_AFTER)?;
    let value = header.to_str().ok()?;
    value.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/flaky");
                then.status(503);
            })
            .await;

        let client = RateLimitedHttpClient::new(RetryPolicy {
            max_retries: 2,
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            requests_per_minute: 6000,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();

        let url = format!("{}/flaky", server.base_url());
        let result = client
            .request_with_retry(Method::GET, &url, &cancel, |b| b)
            .await;

        // Every attempt hits the same 503 mock; after exhausting retries this is Transient.
        first.assert_hits_async(3).await;
        assert!(matches!(result, Err(HttpClientError::Transient { .. })));
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/secure");
                then.status(401);
            })
            .await;

        let client = RateLimitedHttpClient::new(RetryPolicy {
            requests_per_minute: 6000,
            ..Default::default()
        })
        .unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let url = format!("{}/secure", server.base_url());
        let result = client
            .request_with_retry(Method::GET, &url, &cancel, |b| b)
            .await;

        mock.assert_hits_async(1).await;
        assert!(matches!(result, Err(HttpClientError::Auth { .. })));
    }
}
