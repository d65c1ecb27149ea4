//! HTTP transport for the survey provider and HR platform APIs.
//!
//! Reads are retried with capped exponential backoff; writes are sent once.
//! Every request passes through a global and a per-remote concurrency limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub use reqwest::multipart;
pub use reqwest::Url;

pub const CRATE_NAME: &str = "cisync-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_remote_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_remote_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Sustained request rate with a burst allowance, shared by every request of a fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub per_second: u32,
    pub burst: u32,
}

impl RateLimit {
    pub fn per_second(per_second: u32) -> Self {
        Self {
            per_second,
            burst: per_second,
        }
    }
}

/// Reservation-style limiter: each caller takes a slot immediately and sleeps until the
/// slot comes due, so waiters are served in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug)]
struct RateLimiterState {
    available: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let burst = f64::from(limit.burst.max(1));
        Self {
            per_second: f64::from(limit.per_second.max(1)),
            burst,
            state: Mutex::new(RateLimiterState {
                available: burst,
                updated: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let refill = now.duration_since(state.updated).as_secs_f64() * self.per_second;
            state.available = (state.available + refill).min(self.burst);
            state.updated = now;
            state.available -= 1.0;
            if state.available >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-state.available / self.per_second)
        };
        debug!(wait_ms = wait.as_millis() as u64, "rate limited");
        tokio::time::sleep(wait).await;
    }
}

/// How a request authenticates against a remote.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Header { name: String, value: String },
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// API-key-as-username basic auth; the password is ignored by the remote.
    pub fn api_key_basic(key: impl Into<String>) -> Self {
        Self::Basic {
            username: key.into(),
            password: "x".to_string(),
        }
    }

    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::None => builder,
            Credentials::Header { name, value } => builder.header(name.as_str(), value.as_str()),
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Header { name, .. } => f
                .debug_struct("Header")
                .field("name", name)
                .field("value", &"<redacted>")
                .finish(),
            Credentials::Basic { .. } => f.write_str("Basic(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_remote_limit: usize,
    per_remote: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

struct Permits {
    _global: OwnedSemaphorePermit,
    _remote: OwnedSemaphorePermit,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_remote_limit: config.per_remote_concurrency.max(1),
            per_remote: Mutex::new(HashMap::new()),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    async fn per_remote_semaphore(&self, remote: &str) -> Arc<Semaphore> {
        let mut map = self.per_remote.lock().await;
        map.entry(remote.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_remote_limit)))
            .clone()
    }

    async fn acquire(&self, remote: &str) -> Result<Permits, FetchError> {
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let remote = self
            .per_remote_semaphore(remote)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        Ok(Permits {
            _global: global,
            _remote: remote,
        })
    }

    /// GET with retries on 5xx/429 and transient connection failures.
    pub async fn get_bytes(
        &self,
        remote: &str,
        url: &str,
        credentials: &Credentials,
    ) -> Result<FetchedResponse, FetchError> {
        let _permits = self.acquire(remote).await?;
        let span = info_span!("http_fetch", remote, method = "GET", url);
        self.get_with_retries(url, credentials).instrument(span).await
    }

    /// GET a JSON document and decode it.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        remote: &str,
        url: &str,
        credentials: &Credentials,
    ) -> Result<T, FetchError> {
        let resp = self.get_bytes(remote, url, credentials).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    async fn get_with_retries(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let request = credentials.apply(
                self.client
                    .get(url)
                    .header(ACCEPT, "application/json, application/pdf, */*"),
            );

            let err = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "retrying GET");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// POST a JSON body. Sent once: a retried write could duplicate its effect.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        remote: &str,
        url: &str,
        credentials: &Credentials,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let _permits = self.acquire(remote).await?;
        let span = info_span!("http_fetch", remote, method = "POST", url);
        let request = credentials.apply(
            self.client
                .post(url)
                .header(ACCEPT, "application/json")
                .json(body),
        );
        send_once(request).instrument(span).await
    }

    /// POST a multipart form as one request; either the whole form lands or nothing does.
    pub async fn post_multipart(
        &self,
        remote: &str,
        url: &str,
        credentials: &Credentials,
        form: multipart::Form,
    ) -> Result<FetchedResponse, FetchError> {
        let _permits = self.acquire(remote).await?;
        let span = info_span!("http_fetch", remote, method = "POST", url);
        let request = credentials.apply(
            self.client
                .post(url)
                .header(ACCEPT, "application/json")
                .multipart(form),
        );
        send_once(request).instrument(span).await
    }
}

async fn send_once(request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn credentials_never_print_secrets() {
        let header = Credentials::header("subscriptionkey", "s3cret");
        let basic = Credentials::api_key_basic("also-s3cret");
        let rendered = format!("{header:?} {basic:?}");
        assert!(rendered.contains("subscriptionkey"));
        assert!(!rendered.contains("s3cret"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spends_burst_then_spaces_requests() {
        let limiter = RateLimiter::new(RateLimit {
            per_second: 2,
            burst: 2,
        });
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(499));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_refills_up_to_the_burst_only() {
        let limiter = RateLimiter::new(RateLimit::per_second(1));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let resumed = Instant::now();
        limiter.acquire().await;
        assert_eq!(resumed.elapsed(), Duration::ZERO);
        limiter.acquire().await;
        assert!(resumed.elapsed() >= Duration::from_millis(999));
    }

    #[test]
    fn fetcher_builds_with_defaults() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("cisync-test".into()),
            rate_limit: Some(RateLimit::per_second(5)),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
