//! Talking to upstream providers over HTTP.
//!
//! The [`WireClient`] performs JSON requests, classifies their outcome into [`FetchError`]s and
//! retries transient failures according to a [`RetryPolicy`]. The [`RequestDeduplicator`] collapses
//! identical concurrent requests into a single network call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::WireConfig;
use crate::error::{FetchError, FetchResult};
use crate::utils::http::{WireTimeouts, create_client};

mod dedup;

pub use dedup::RequestDeduplicator;

/// Semantic checks of a deserialized payload.
///
/// A payload failing validation is treated like a payload failing deserialization.
pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> Result<(), String> {
        self.iter().try_for_each(Validate::validate)
    }
}

impl Validate for serde_json::Value {}

/// A single request to an upstream provider.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// Name of the provider, used for attribution in logs and metrics.
    pub provider: String,
}

impl WireRequest {
    pub fn get(provider: impl Into<String>, url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: BTreeMap::new(),
            body: None,
            provider: provider.into(),
        }
    }

    pub fn post(provider: impl Into<String>, url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: BTreeMap::new(),
            body: Some(body),
            provider: provider.into(),
        }
    }

    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// The key under which identical concurrent requests are deduplicated.
    ///
    /// The body and headers are not part of the key: concurrent requests with the same method
    /// and URL share one result even if their bodies differ.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.method, self.url)
    }
}

/// Scales a backoff delay.
pub type Jitter = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Decides which failures are retried, and how long to wait in between.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound of every single delay.
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

/// Randomizes a delay to between half and the full delay.
fn equal_jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::random_range(0.5..=1.0))
}

impl RetryPolicy {
    pub fn from_config(config: &WireConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: Arc::new(equal_jitter),
        }
    }

    /// Uses the exact exponential delays, without randomization.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Arc::new(|delay| delay);
        self
    }

    pub fn is_retryable(&self, error: &FetchError) -> bool {
        error.is_retryable()
    }

    /// The delay before the retry following the `attempt`th failed attempt (starting at 1).
    pub fn delay(&self, attempt: u32, error: &FetchError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let mut delay = (self.jitter)(backoff);

        if let FetchError::RateLimited {
            retry_after: Some(retry_after),
        } = error.root()
        {
            delay = delay.max(*retry_after);
        }

        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WireConfig::default())
    }
}

/// A JSON HTTP client with retries.
#[derive(Debug, Clone)]
pub struct WireClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl WireClient {
    pub fn new(config: &WireConfig) -> FetchResult<Self> {
        let timeouts = WireTimeouts::from_config(config);
        let client = create_client(&timeouts, &config.user_agent)?;
        Ok(Self {
            client,
            policy: RetryPolicy::from_config(config),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Performs `request` and deserializes the response into `T`.
    ///
    /// Transient failures are retried with exponential backoff. Once attempts are exhausted, the
    /// last error is returned.
    pub async fn request<T>(&self, request: WireRequest) -> FetchResult<T>
    where
        T: DeserializeOwned + Validate,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.attempt(&request, attempt).await;

            match result {
                Err(err) if attempt < self.policy.max_attempts && self.policy.is_retryable(&err) => {
                    let delay = self.policy.delay(attempt, &err);
                    tracing::debug!(
                        provider = %request.provider,
                        attempt,
                        ?delay,
                        error = %err,
                        "Retrying request"
                    );
                    metric!(counter("wire.retry") += 1, "provider" => &request.provider);
                    tokio::time::sleep(delay).await;
                }
                result => break result,
            }
        }
    }

    async fn attempt<T>(&self, request: &WireRequest, attempt: u32) -> FetchResult<T>
    where
        T: DeserializeOwned + Validate,
    {
        let start = Instant::now();
        let result = self.send(request).await;

        let status = match &result {
            Ok((status, _)) => status.as_str().to_owned(),
            Err(err) => err.metrics_tag().to_owned(),
        };
        tracing::debug!(
            provider = %request.provider,
            host = request.url.host_str().unwrap_or_default(),
            path = request.url.path(),
            attempt,
            duration = ?start.elapsed(),
            status = %status,
            "Upstream request"
        );
        metric!(
            counter("wire.request") += 1,
            "provider" => &request.provider,
            "status" => &status,
        );
        metric!(
            timer("wire.request.duration") = start.elapsed(),
            "provider" => &request.provider,
        );

        let (_, body) = result?;
        let payload: T = serde_json::from_slice(&body)?;
        payload.validate().map_err(FetchError::Parse)?;
        Ok(payload)
    }

    /// Sends the request and reads the body of successful responses.
    async fn send(&self, request: &WireRequest) -> FetchResult<(StatusCode, Vec<u8>)> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_owned(),
            });
        }

        let body = response.bytes().await.map_err(network_error)?;
        Ok((status, body.to_vec()))
    }
}

fn network_error(err: reqwest::Error) -> FetchError {
    FetchError::Network(err.to_string())
}

/// Reads a `Retry-After` header given in seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}
