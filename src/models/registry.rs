use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A provider backend instance capable of running work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub address: String,
    /// Maximum concurrent invocations this backend accepts.
    pub capacity: u32,
    /// Relative share for load balancing; load is compared as load/weight.
    pub weight: u32,
    pub healthy: bool,
    pub last_heartbeat: Option<i64>,
    pub current_load: u32,
    pub created_at: i64,
}

impl Executor {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            provider: provider.into(),
            address: address.into(),
            capacity: 4,
            weight: 1,
            healthy: true,
            last_heartbeat: None,
            current_load: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiKeyStatus {
    Active,
    Exhausted,
    Disabled,
}

/// A rotation credential for a provider.
///
/// `usage_count` only moves forward except on a daily reset; crossing
/// `daily_quota` flips Active to Exhausted atomically with the increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub provider: String,
    pub key: String,
    pub status: ApiKeyStatus,
    pub usage_count: u64,
    /// Zero means unmetered.
    pub daily_quota: u64,
    pub last_used_at: Option<i64>,
    pub metadata: Value,
    pub created_at: i64,
}

impl ApiKey {
    pub fn new(provider: impl Into<String>, key: impl Into<String>, daily_quota: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.into(),
            key: key.into(),
            status: ApiKeyStatus::Active,
            usage_count: 0,
            daily_quota,
            last_used_at: None,
            metadata: Value::Null,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
