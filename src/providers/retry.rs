//! Shared retry discipline for provider calls.
//!
//! Network errors and 5xx responses are retried with exponential backoff;
//! 4xx responses surface immediately as caller errors. A success response
//! that is not a JSON object is a protocol error and is not retried.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::SystemConfig;

/// Longest response excerpt embedded in a provider error.
pub const MAX_SNIPPET_LEN: usize = 500;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_backoff_ms,
            max_delay_ms: config.max_backoff_ms,
            backoff_multiplier: 2.0,
            call_timeout: Duration::from_secs(config.provider_timeout_seconds),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay_ms as f64 * multiplier) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// An HTTP client carrying the per-call timeout.
    pub fn build_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(self.call_timeout)
            .build()
            .unwrap_or_default()
    }
}

/// Truncate a response body for embedding in errors without leaking
/// unbounded payloads.
pub fn snippet(body: &str) -> String {
    if body.len() <= MAX_SNIPPET_LEN {
        return body.to_string();
    }
    let mut end = MAX_SNIPPET_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &body[..end])
}

/// Issue a request with the retry contract and parse the success body as a
/// JSON object. `build` is called once per attempt.
pub async fn send_with_retry<F>(
    provider: &str,
    retry: &RetryConfig,
    build: F,
) -> Result<Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err: Option<Error> = None;

    for attempt in 1..=retry.max_attempts {
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(e) => {
                            last_err = Some(Error::Provider {
                                provider: provider.to_string(),
                                status: None,
                                message: format!("failed to read response body: {e}"),
                            });
                            debug!(provider, attempt, "response body read failed, retrying");
                            maybe_backoff(retry, attempt).await;
                            continue;
                        }
                    };
                    return match serde_json::from_str::<Value>(&body) {
                        Ok(value) if value.is_object() => Ok(value),
                        _ => Err(Error::Protocol(format!(
                            "{provider} returned a non-JSON-object response: {}",
                            snippet(&body)
                        ))),
                    };
                }

                let code = status.as_u16();
                let body = response.text().await.unwrap_or_default();
                let err = Error::Provider {
                    provider: provider.to_string(),
                    status: Some(code),
                    message: format!("HTTP {code}: {}", snippet(&body)),
                };
                if status.is_client_error() {
                    // Caller error; retrying cannot help.
                    return Err(err);
                }
                debug!(provider, attempt, code, "provider returned server error");
                last_err = Some(err);
            }
            Err(e) => {
                debug!(provider, attempt, error = %e, "provider call failed");
                last_err = Some(Error::Provider {
                    provider: provider.to_string(),
                    status: None,
                    message: format!("network error: {e}"),
                });
            }
        }

        maybe_backoff(retry, attempt).await;
    }

    Err(last_err.unwrap_or_else(|| Error::Provider {
        provider: provider.to_string(),
        status: None,
        message: "retry budget exhausted".to_string(),
    }))
}

async fn maybe_backoff(retry: &RetryConfig, attempt: u32) {
    if attempt < retry.max_attempts {
        tokio::time::sleep(retry.delay_for(attempt)).await;
    }
}
