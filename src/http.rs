//! Retrying HTTP fetch pipeline.
//!
//! One [`Fetcher`] is shared by the API client and the token manager. Every
//! attempt waits on the global rate bucket first, builds a fresh request,
//! and classifies the response through the error taxonomy. Retryable
//! classifications spend the remaining attempt budget with jittered
//! exponential backoff; a 401 additionally invalidates the cached token so
//! the next attempt carries a fresh one.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::{classify_response, CrawlError};
use crate::ratelimit::RateBucket;
use crate::shutdown::{self, Signal};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Declarative request description; the fetcher rebuilds the actual
/// `reqwest::Request` from it on every attempt.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
    pub basic_auth: Option<(String, String)>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            form: None,
            basic_auth: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            form: None,
            basic_auth: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.form = Some(pairs);
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), pass.into()));
        self
    }
}

/// Shared HTTP execution layer: rate-bucket pacing, retry with
/// classification, per-attempt timeouts.
#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    bucket: Arc<RateBucket>,
    max_attempts: u32,
}

impl Fetcher {
    pub fn new(cfg: &Config, bucket: Arc<RateBucket>) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.http_timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            bucket,
            max_attempts: cfg.http_max_attempts.max(1),
        })
    }

    /// Execute a request with retries. When `tokens` is provided, each
    /// attempt carries a bearer token from it (refreshed transparently
    /// after a 401); the token endpoint itself passes `None`.
    pub async fn send_with_retry(
        &self,
        signal: &Signal,
        spec: &RequestSpec,
        tokens: Option<&TokenManager>,
    ) -> Result<reqwest::Response, CrawlError> {
        let mut last_err = CrawlError::Network("no attempt made".to_string());

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, url = %spec.url, "retrying");
                if !shutdown::sleep(signal, delay).await {
                    return Err(CrawlError::Cancelled);
                }
            }

            // Every attempt, retries included, draws from the same bucket.
            self.bucket.wait(signal).await?;

            let mut builder = self.client.request(spec.method.clone(), &spec.url);
            if !spec.query.is_empty() {
                builder = builder.query(&spec.query);
            }
            if let Some(form) = &spec.form {
                builder = builder.form(form);
            }
            if let Some((user, pass)) = &spec.basic_auth {
                builder = builder.basic_auth(user, Some(pass));
            }
            if let Some(manager) = tokens {
                builder = builder.bearer_auth(manager.bearer(signal).await?);
            }

            let outcome = tokio::select! {
                result = builder.send() => result,
                _ = shutdown::triggered(signal) => return Err(CrawlError::Cancelled),
            };

            let err = match outcome {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let err = classify_response(status, &body);
                    if matches!(err, CrawlError::Unauthorized { .. }) {
                        if let Some(manager) = tokens {
                            manager.invalidate();
                        }
                    }
                    err
                }
                Err(e) => CrawlError::from(e),
            };

            if !err.retryable() {
                return Err(err);
            }
            warn!(attempt, kind = err.kind(), url = %spec.url, "retryable upstream error");
            last_err = err;
        }

        Err(last_err)
    }

    /// `send_with_retry` followed by a JSON decode of the body.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        signal: &Signal,
        spec: &RequestSpec,
        tokens: Option<&TokenManager>,
    ) -> Result<T, CrawlError> {
        let response = Box::pin(self.send_with_retry(signal, spec, tokens)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CrawlError::Decode(e.to_string()))
    }
}

/// Backoff for the n-th failed attempt: `base × 2^n` capped, plus up to
/// 20% jitter on top of the capped delay.
fn retry_delay(failed_attempt: u32) -> Duration {
    let exp = failed_attempt.min(16);
    let delay = BASE_RETRY_DELAY
        .saturating_mul(1u32 << exp)
        .min(MAX_RETRY_DELAY);
    let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.2));
    delay + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        for _ in 0..200 {
            let first = retry_delay(0);
            assert!(first >= BASE_RETRY_DELAY);
            assert!(first < BASE_RETRY_DELAY.mul_f64(1.2) + Duration::from_millis(1));

            let deep = retry_delay(30);
            assert!(deep >= MAX_RETRY_DELAY);
            assert!(deep <= MAX_RETRY_DELAY.mul_f64(1.2));
        }
    }

    #[test]
    fn spec_builder_accumulates() {
        let spec = RequestSpec::get("http://example.test/r/rust/top")
            .query("limit", "100")
            .query("t", "all");
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.query.len(), 2);
        assert!(spec.form.is_none());
    }
}
