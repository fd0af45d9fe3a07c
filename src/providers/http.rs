//! Generic adapter for third-party HTTP AI APIs ("kie" family).
//!
//! Builds an authenticated JSON request from the ability's defaults merged
//! with the caller payload, classifies the response, and persists any
//! result URLs the provider reports.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::external::{ObjectStore, StoredAsset};
use crate::models::Billing;
use crate::providers::retry::{self, RetryConfig};
use crate::providers::{InvokeContext, ProviderAdapter, ResultEnvelope};

pub const PROVIDER: &str = "kie";

pub struct GenericHttpAdapter {
    client: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
}

impl GenericHttpAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        Self {
            client: retry.build_client(),
            store,
            retry,
        }
    }

    fn endpoint(&self, ctx: &InvokeContext<'_>) -> String {
        // A capability key may be a full URL or a path under the executor.
        if ctx.ability.capability_key.starts_with("http") {
            ctx.ability.capability_key.clone()
        } else {
            format!(
                "{}/{}",
                ctx.executor.address.trim_end_matches('/'),
                ctx.ability.capability_key.trim_start_matches('/')
            )
        }
    }

    /// Defaults first, caller payload wins on conflicts.
    fn merged_body(&self, ctx: &InvokeContext<'_>) -> Value {
        let mut body = ctx
            .ability
            .default_params
            .as_object()
            .cloned()
            .unwrap_or_else(Map::new);
        if let Some(payload) = ctx.payload.as_object() {
            for (key, value) in payload {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }

    async fn persist_result_urls(&self, raw: &Value) -> Result<Vec<StoredAsset>> {
        let Some(urls) = raw.pointer("/data/resultUrls").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        let mut assets = Vec::new();
        for url in urls.iter().filter_map(Value::as_str) {
            let asset = super::persist_remote_asset(&self.client, &self.store, url).await?;
            assets.push(asset);
        }
        Ok(assets)
    }
}

#[async_trait]
impl ProviderAdapter for GenericHttpAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn requires_credential(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<ResultEnvelope> {
        let url = self.endpoint(&ctx);
        let body = self.merged_body(&ctx);
        let bearer = ctx.credential.map(|c| c.key.clone()).unwrap_or_default();

        let raw = retry::send_with_retry(PROVIDER, &self.retry, || {
            self.client.post(&url).bearer_auth(&bearer).json(&body)
        })
        .await?;

        let assets = self.persist_result_urls(&raw).await?;
        let cost = raw
            .get("cost")
            .and_then(|c| serde_json::from_value::<Billing>(c.clone()).ok());

        Ok(ResultEnvelope {
            remote_job: None,
            assets,
            raw,
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryObjectStore;
    use crate::models::{Ability, Executor};
    use serde_json::json;

    fn adapter() -> GenericHttpAdapter {
        GenericHttpAdapter::new(Arc::new(InMemoryObjectStore::new()), RetryConfig::default())
    }

    #[test]
    fn test_payload_overrides_defaults() {
        let adapter = adapter();
        let mut ability = Ability::new("upscale", PROVIDER, "image", "v1/upscale", 5);
        ability.default_params = json!({"scale": 2, "format": "png"});
        let executor = Executor::new("kie-1", PROVIDER, "https://api.kie.example");
        let payload = json!({"scale": 4, "image": "http://x/in.png"});

        let ctx = InvokeContext {
            ability: &ability,
            task_id: "t1",
            payload: &payload,
            executor: &executor,
            credential: None,
            checkpoint: None,
        };

        let body = adapter.merged_body(&ctx);
        assert_eq!(body["scale"], 4);
        assert_eq!(body["format"], "png");
        assert_eq!(body["image"], "http://x/in.png");

        assert_eq!(
            adapter.endpoint(&ctx),
            "https://api.kie.example/v1/upscale"
        );
    }

    #[test]
    fn test_full_url_capability_key_used_verbatim() {
        let adapter = adapter();
        let ability = Ability::new(
            "gen",
            PROVIDER,
            "image",
            "https://other.example/generate",
            5,
        );
        let executor = Executor::new("kie-1", PROVIDER, "https://api.kie.example");
        let payload = json!({});
        let ctx = InvokeContext {
            ability: &ability,
            task_id: "t1",
            payload: &payload,
            executor: &executor,
            credential: None,
            checkpoint: None,
        };
        assert_eq!(adapter.endpoint(&ctx), "https://other.example/generate");
    }

    #[test]
    fn test_no_submitted_job_for_this_provider() {
        // The generic adapter never reports a resumable remote job, even when
        // the stored metadata looks like one.
        let adapter = adapter();
        let result = json!({"metadata": {"promptId": "x", "baseUrl": "http://h"}});
        assert!(adapter.submitted_job(&result).is_none());
    }
}
