pub mod comfy;
pub mod flow;
pub mod http;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::external::{ObjectStore, StoredAsset};
use crate::models::{Ability, ApiKey, Billing, Executor};

pub use comfy::ComfyAdapter;
pub use flow::WorkflowEngineAdapter;
pub use http::GenericHttpAdapter;
pub use retry::{RetryConfig, send_with_retry};

/// A remote job created on a provider backend whose completion is observed
/// separately from submission.
#[derive(Debug, Clone)]
pub struct RemoteJob {
    pub id: String,
    pub base_url: String,
}

/// The normalized result shape every adapter returns regardless of wire
/// format.
#[derive(Debug, Clone)]
pub struct ResultEnvelope {
    pub remote_job: Option<RemoteJob>,
    pub assets: Vec<StoredAsset>,
    pub raw: Value,
    pub cost: Option<Billing>,
}

impl ResultEnvelope {
    pub fn from_raw(raw: Value) -> Self {
        Self {
            remote_job: None,
            assets: Vec::new(),
            raw,
            cost: None,
        }
    }
}

/// Persists evidence of a remote submission onto the in-flight task, so a
/// restarted process can resume polling instead of re-submitting.
pub trait SubmissionCheckpoint: Send + Sync {
    fn record(&self, metadata: Value) -> Result<()>;
}

/// Everything an adapter needs for one invocation.
pub struct InvokeContext<'a> {
    pub ability: &'a Ability,
    pub task_id: &'a str,
    pub payload: &'a Value,
    pub executor: &'a Executor,
    pub credential: Option<&'a ApiKey>,
    pub checkpoint: Option<&'a dyn SubmissionCheckpoint>,
}

/// One invocation contract over heterogeneous provider wire formats.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> &str;

    fn requires_credential(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<ResultEnvelope>;

    /// Inspect a persisted result payload for evidence of a submitted remote
    /// job. Only polling-capable adapters return Some.
    fn submitted_job(&self, result: &Value) -> Option<RemoteJob> {
        let _ = result;
        None
    }

    /// Reconcile a previously submitted remote job to completion.
    async fn poll(&self, job: &RemoteJob) -> Result<ResultEnvelope> {
        let _ = job;
        Err(Error::Protocol(format!(
            "provider {} does not support status polling",
            self.provider()
        )))
    }

    /// Metadata persisted onto the task once a remote job exists.
    fn job_metadata(&self, job: &RemoteJob) -> Value {
        serde_json::json!({
            "remoteJobId": job.id,
            "baseUrl": job.base_url,
        })
    }
}

/// Provider-keyed adapter registry.
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// All built-in adapters, sharing one object store.
    pub fn with_defaults(store: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ComfyAdapter::new(store.clone(), retry.clone())));
        registry.register(Arc::new(GenericHttpAdapter::new(store, retry.clone())));
        registry.register(Arc::new(WorkflowEngineAdapter::new(retry)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider().to_string(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Download a provider-hosted asset and persist it as a stable URL.
pub(crate) async fn persist_remote_asset(
    client: &reqwest::Client,
    store: &Arc<dyn ObjectStore>,
    url: &str,
) -> Result<StoredAsset> {
    let response = client.get(url).send().await?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = response.bytes().await?;
    store.upload(bytes.to_vec(), &content_type).await
}
