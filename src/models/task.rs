use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::Ability;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// One invocation unit submitted by a user.
///
/// `finished_at` is set iff the status is terminal. A non-terminal task whose
/// `result["metadata"]` already names a remote job is submitted-only: a prior
/// process died after submission but before completion was observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityTask {
    pub id: String,
    pub ability_id: String,
    pub provider: String,
    pub capability_key: String,
    pub user_id: String,
    pub status: TaskStatus,
    pub callback_url: Option<String>,
    pub callback_headers: Option<Value>,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl AbilityTask {
    pub fn new(ability: &Ability, user_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ability_id: ability.id.clone(),
            provider: ability.provider.clone(),
            capability_key: ability.capability_key.clone(),
            user_id: user_id.into(),
            status: TaskStatus::Queued,
            callback_url: None,
            callback_headers: None,
            payload,
            result: None,
            error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Succeeded;
        self.result = Some(result);
        self.finished_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Attach remote-submission metadata without touching the lifecycle state.
    pub fn record_submission(&mut self, metadata: Value) {
        let result = self
            .result
            .get_or_insert_with(|| Value::Object(Default::default()));
        if let Some(obj) = result.as_object_mut() {
            obj.insert("metadata".to_string(), metadata);
        }
    }

    pub fn submission_metadata(&self) -> Option<&Value> {
        self.result.as_ref().and_then(|r| r.get("metadata"))
    }
}
