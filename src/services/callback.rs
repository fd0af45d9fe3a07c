//! Best-effort webhook delivery of terminal task results.
//!
//! Delivery failures are recorded, never propagated: the task's own outcome
//! is already decided by the time a callback fires.

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{CallbackDelivery, CallbackStatus};
use crate::providers::retry::{self, RetryConfig};

pub struct CallbackDispatcher {
    client: reqwest::Client,
    retry: RetryConfig,
    attempts: u32,
}

impl CallbackDispatcher {
    pub fn new(retry: RetryConfig, attempts: u32) -> Self {
        Self {
            client: retry.build_client(),
            retry,
            attempts: attempts.max(1),
        }
    }

    pub async fn deliver(
        &self,
        url: &str,
        headers: Option<&Value>,
        payload: &Value,
    ) -> CallbackDelivery {
        let started_at = chrono::Utc::now().timestamp_millis();
        let mut http_status = None;
        let mut response_body = None;
        let mut error = None;

        let mut delivered = false;
        for attempt in 1..=self.attempts {
            let mut request = self.client.post(url).json(payload);
            if let Some(map) = headers.and_then(Value::as_object) {
                for (name, value) in map {
                    if let Some(value) = value.as_str() {
                        request = request.header(name, value);
                    }
                }
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    http_status = Some(status.as_u16());
                    let body = response.text().await.unwrap_or_default();
                    response_body = Some(retry::snippet(&body));
                    if status.is_success() {
                        delivered = true;
                        error = None;
                        break;
                    }
                    error = Some(format!("callback endpoint returned HTTP {}", status.as_u16()));
                    // Client errors will not improve on retry.
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => {
                    error = Some(format!("callback delivery failed: {e}"));
                }
            }

            debug!(url, attempt, "callback attempt failed");
            if attempt < self.attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        if let Some(reason) = &error {
            warn!(url, reason, "callback not delivered");
        }

        CallbackDelivery {
            status: if delivered {
                CallbackStatus::Delivered
            } else {
                CallbackStatus::Failed
            },
            http_status,
            payload: payload.clone(),
            response: response_body,
            error,
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
