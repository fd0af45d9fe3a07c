//! Adapter for low-code workflow engines.
//!
//! Posts `{workflow_id, parameters, ext}` where extension fields are
//! string-coerced (non-string values stringified losslessly) and tags the
//! request with an idempotency id so the engine can deduplicate retries.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::Result;
use crate::providers::retry::{self, RetryConfig};
use crate::providers::{InvokeContext, ProviderAdapter, ResultEnvelope};

pub const PROVIDER: &str = "flowengine";

const REQUEST_ID_HEADER: &str = "X-Request-Id";

pub struct WorkflowEngineAdapter {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl WorkflowEngineAdapter {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            client: retry.build_client(),
            retry,
        }
    }

    /// Ext values must cross the wire as strings; JSON-encode anything that
    /// is not one so no information is lost.
    fn coerce_ext(ext: Option<&Value>) -> Map<String, Value> {
        let mut coerced = Map::new();
        let Some(obj) = ext.and_then(Value::as_object) else {
            return coerced;
        };
        for (key, value) in obj {
            let string = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            coerced.insert(key.clone(), Value::String(string));
        }
        coerced
    }
}

#[async_trait]
impl ProviderAdapter for WorkflowEngineAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn requires_credential(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<ResultEnvelope> {
        // Ability defaults provide base ext fields; the payload may add more.
        let mut ext = Self::coerce_ext(ctx.ability.default_params.get("ext"));
        ext.extend(Self::coerce_ext(ctx.payload.get("ext")));

        let parameters = match ctx.payload.get("parameters") {
            Some(p) => p.clone(),
            None => ctx.payload.clone(),
        };

        let body = json!({
            "workflow_id": ctx.ability.capability_key,
            "parameters": parameters,
            "ext": Value::Object(ext),
        });

        let bearer = ctx.credential.map(|c| c.key.clone()).unwrap_or_default();
        let url = ctx.executor.address.clone();
        let task_id = ctx.task_id.to_string();

        let raw = retry::send_with_retry(PROVIDER, &self.retry, || {
            self.client
                .post(&url)
                .header(REQUEST_ID_HEADER, &task_id)
                .bearer_auth(&bearer)
                .json(&body)
        })
        .await?;

        Ok(ResultEnvelope::from_raw(raw))
    }
}
