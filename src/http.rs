//! Outbound HTTP with bounded retries and exponential backoff.

use std::time::Duration;

use log::{debug, warn};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use crate::config::HttpConfig;
use crate::error::{RelayError, Result};

/// Header carrying the 1-based attempt number of each request.
pub const ATTEMPT_HEADER: &str = "x-relay-attempt";

/// Longest `Retry-After` the client will honour before retrying.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10);

/// Statuses that indicate a transient upstream condition.
pub fn should_retry_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Delay before the attempt following `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(6);
    base.saturating_mul(1_u32 << shift)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER))
}

/// Final response of a (possibly retried) call, body already read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| RelayError::ResponseShape(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: Client,
    policy: HttpConfig,
}

impl RetryingClient {
    pub fn new(policy: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(policy.connect_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, policy })
    }

    /// POST a JSON body, retrying transient failures.
    ///
    /// Connection failures and 429/5xx gateway statuses are retried up to the
    /// configured attempt limit. When retries run out on a status, the last
    /// response is returned so the caller can report it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Network`] when every attempt failed to connect and
    /// [`RelayError::Timeout`] when a response did not arrive within the read
    /// timeout. Read timeouts are never retried.
    pub async fn post<B>(&self, url: &str, headers: HeaderMap, body: &B) -> Result<HttpResponse>
    where
        B: Serialize + ?Sized,
    {
        self.post_json(url, headers, body, self.policy.max_attempts).await
    }

    /// POST a JSON body exactly once.
    ///
    /// For calls that must not be repeated, such as pushing a message to a
    /// user: a gateway error may arrive after the upstream already acted.
    pub async fn post_once<B>(&self, url: &str, headers: HeaderMap, body: &B) -> Result<HttpResponse>
    where
        B: Serialize + ?Sized,
    {
        self.post_json(url, headers, body, 1).await
    }

    /// GET exactly once; failures surface to the caller immediately.
    pub async fn get_once(&self, url: &str) -> Result<HttpResponse> {
        debug!("GET {}", redact_query(url));
        self.send_with_retry(url, 1, || self.client.get(url)).await
    }

    async fn post_json<B>(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &B,
        max_attempts: u32,
    ) -> Result<HttpResponse>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|e| RelayError::Config(format!("failed to encode request body: {e}")))?;
        debug!("POST {} ({} byte body)", redact_query(url), payload.len());

        self.send_with_retry(url, max_attempts, || {
            self.client
                .post(url)
                .headers(headers.clone())
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(payload.clone())
        })
        .await
    }

    async fn send_with_retry<F>(&self, url: &str, max_attempts: u32, build: F) -> Result<HttpResponse>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_attempts = max_attempts.max(1);
        let target = redact_query(url);

        for attempt in 1..=max_attempts {
            let response = build()
                .header(ATTEMPT_HEADER, attempt.to_string())
                .timeout(self.policy.read_timeout)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    let retry_after = parse_retry_after(response.headers());
                    let body = response
                        .text()
                        .await
                        .map_err(|e| RelayError::from_transport(&e))?;

                    if attempt < max_attempts && should_retry_status(status) {
                        let delay = backoff_delay(self.policy.backoff_base, attempt)
                            .max(retry_after.unwrap_or_default());
                        warn!(
                            "{target} returned {status} on attempt {attempt}/{max_attempts}, retrying in {delay:?}"
                        );
                        sleep(delay).await;
                        continue;
                    }

                    return Ok(HttpResponse { status, body });
                }
                Err(error) if error.is_connect() => {
                    if attempt < max_attempts {
                        let delay = backoff_delay(self.policy.backoff_base, attempt);
                        warn!(
                            "Connection to {target} failed on attempt {attempt}/{max_attempts}, retrying in {delay:?}: {error}"
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Err(RelayError::Network(format!(
                        "{target} unreachable after {max_attempts} attempts: {error}"
                    )));
                }
                Err(error) => return Err(RelayError::from_transport(&error)),
            }
        }

        Err(RelayError::Network(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }
}

/// Strip the query string so credentials never reach the logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
