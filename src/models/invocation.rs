use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvocationStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvocationSource {
    UserRequest,
    InternalTest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallbackStatus {
    Delivered,
    Failed,
}

/// Outcome of one outbound webhook delivery, attached to the invocation
/// entry after the task reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackDelivery {
    pub status: CallbackStatus,
    pub http_status: Option<u16>,
    pub payload: Value,
    pub response: Option<String>,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

/// Billing metadata reported by a provider for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Billing {
    pub unit: String,
    pub price: f64,
    pub currency: String,
    pub cost: f64,
}

/// Append-only record of one provider call attempt. Never mutated after
/// reaching terminal status, except to attach the callback delivery outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationLogEntry {
    pub id: String,
    pub task_id: String,
    pub ability_id: String,
    pub provider: String,
    pub capability_key: String,
    pub executor_id: Option<String>,
    pub source: InvocationSource,
    pub status: InvocationStatus,
    pub duration_ms: i64,
    pub result_url: Option<String>,
    pub request_snapshot: Value,
    pub response_snapshot: Value,
    pub error: Option<String>,
    pub billing: Option<Billing>,
    pub callback: Option<CallbackDelivery>,
    pub created_at: i64,
}

impl InvocationLogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: impl Into<String>,
        ability_id: impl Into<String>,
        provider: impl Into<String>,
        capability_key: impl Into<String>,
        executor_id: Option<String>,
        source: InvocationSource,
        status: InvocationStatus,
        duration_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            ability_id: ability_id.into(),
            provider: provider.into(),
            capability_key: capability_key.into(),
            executor_id,
            source,
            status,
            duration_ms,
            result_url: None,
            request_snapshot: Value::Null,
            response_snapshot: Value::Null,
            error: None,
            billing: None,
            callback: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
