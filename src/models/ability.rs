use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AbilityStatus {
    Active,
    Inactive,
}

/// A named capability bound to a provider. Identity is `(provider, capability_key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ability {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub category: String,
    pub capability_key: String,
    pub default_params: Value,
    pub input_schema: Value,
    /// Optional pinned executor; when absent the registry picks one by load.
    pub executor_id: Option<String>,
    /// Points frozen on the caller's wallet per invocation.
    pub cost_points: i64,
    pub status: AbilityStatus,
    pub created_at: i64,
}

impl Ability {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        category: impl Into<String>,
        capability_key: impl Into<String>,
        cost_points: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            provider: provider.into(),
            category: category.into(),
            capability_key: capability_key.into(),
            default_params: Value::Null,
            input_schema: Value::Null,
            executor_id: None,
            cost_points,
            status: AbilityStatus::Active,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AbilityStatus::Active
    }
}
