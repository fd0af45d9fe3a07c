//! Graph-executor adapter (ComfyUI wire format).
//!
//! Submits a normalized execution graph, records the remote prompt id as a
//! resumable checkpoint, then watches the history endpoint until the prompt
//! resolves. Output images are fetched and persisted through the object
//! store so callers get stable URLs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::external::{ObjectStore, StoredAsset};
use crate::graph::normalize;
use crate::providers::retry::{self, RetryConfig};
use crate::providers::{InvokeContext, ProviderAdapter, RemoteJob, ResultEnvelope};

pub const PROVIDER: &str = "comfyui";

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ComfyAdapter {
    client: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
}

impl ComfyAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        Self {
            client: retry.build_client(),
            store,
            retry,
        }
    }

    fn resolve_graph(&self, ctx: &InvokeContext<'_>) -> Result<Value> {
        let definition = ctx
            .payload
            .get("graph")
            .or_else(|| ctx.ability.default_params.get("graph"))
            .ok_or_else(|| {
                Error::Protocol("neither the payload nor the ability carries a graph".to_string())
            })?;

        let graph = normalize(definition);
        match graph.as_object() {
            Some(map) if !map.is_empty() => Ok(graph),
            _ => Err(Error::Protocol(
                "graph normalization produced an empty graph".to_string(),
            )),
        }
    }

    /// Watch `/history/{prompt_id}` until the prompt resolves, then persist
    /// its output images.
    async fn await_completion(&self, job: &RemoteJob) -> Result<ResultEnvelope> {
        let url = format!("{}/history/{}", job.base_url.trim_end_matches('/'), job.id);
        let deadline = Instant::now() + self.retry.call_timeout;

        loop {
            let history = retry::send_with_retry(PROVIDER, &self.retry, || {
                self.client.get(&url)
            })
            .await?;

            if let Some(entry) = history.get(&job.id) {
                if let Some(status) = entry.pointer("/status/status_str").and_then(Value::as_str)
                    && status == "error"
                {
                    return Err(Error::Provider {
                        provider: PROVIDER.to_string(),
                        status: None,
                        message: format!(
                            "prompt {} failed: {}",
                            job.id,
                            retry::snippet(&entry.to_string())
                        ),
                    });
                }

                if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
                    let assets = self.collect_assets(job, outputs.values()).await?;
                    return Ok(ResultEnvelope {
                        remote_job: Some(job.clone()),
                        assets,
                        raw: entry.clone(),
                        cost: None,
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::Provider {
                    provider: PROVIDER.to_string(),
                    status: None,
                    message: format!("timed out waiting for prompt {}", job.id),
                });
            }
            debug!(prompt_id = %job.id, "prompt still pending");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn collect_assets<'a>(
        &self,
        job: &RemoteJob,
        outputs: impl Iterator<Item = &'a Value>,
    ) -> Result<Vec<StoredAsset>> {
        let mut assets = Vec::new();
        for node_output in outputs {
            let Some(images) = node_output.get("images").and_then(Value::as_array) else {
                continue;
            };
            for image in images {
                let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                let subfolder = image.get("subfolder").and_then(Value::as_str).unwrap_or("");
                let kind = image.get("type").and_then(Value::as_str).unwrap_or("output");
                let view_url = format!(
                    "{}/view?filename={}&subfolder={}&type={}",
                    job.base_url.trim_end_matches('/'),
                    filename,
                    subfolder,
                    kind
                );
                let asset =
                    super::persist_remote_asset(&self.client, &self.store, &view_url).await?;
                assets.push(asset);
            }
        }
        Ok(assets)
    }
}

#[async_trait]
impl ProviderAdapter for ComfyAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<ResultEnvelope> {
        let graph = self.resolve_graph(&ctx)?;
        let submit_url = format!("{}/prompt", ctx.executor.address.trim_end_matches('/'));
        let body = json!({
            "prompt": graph,
            "client_id": ctx.task_id,
        });

        let response = retry::send_with_retry(PROVIDER, &self.retry, || {
            self.client.post(&submit_url).json(&body)
        })
        .await?;

        let prompt_id = response
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "submit response carries no prompt_id: {}",
                    retry::snippet(&response.to_string())
                ))
            })?;

        let job = RemoteJob {
            id: prompt_id.to_string(),
            base_url: ctx.executor.address.clone(),
        };

        // Persist the submission before waiting, so a crash between here and
        // completion leaves a resumable task instead of an orphaned prompt.
        if let Some(checkpoint) = ctx.checkpoint {
            checkpoint.record(self.job_metadata(&job))?;
        }

        self.await_completion(&job).await
    }

    fn submitted_job(&self, result: &Value) -> Option<RemoteJob> {
        let metadata = result.get("metadata")?;
        let id = metadata.get("promptId").and_then(Value::as_str)?;
        let base_url = metadata.get("baseUrl").and_then(Value::as_str)?;
        Some(RemoteJob {
            id: id.to_string(),
            base_url: base_url.to_string(),
        })
    }

    async fn poll(&self, job: &RemoteJob) -> Result<ResultEnvelope> {
        self.await_completion(job).await
    }

    fn job_metadata(&self, job: &RemoteJob) -> Value {
        json!({
            "promptId": job.id,
            "baseUrl": job.base_url,
        })
    }
}
