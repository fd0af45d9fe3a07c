use serde::{Deserialize, Serialize};

/// A provisional wallet debit, alive only between freeze and confirm/release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletHold {
    pub id: String,
    pub user_id: String,
    pub points: i64,
    pub created_at: i64,
}

impl WalletHold {
    /// Hold ids are derived, not random, so a restarted process can find the
    /// hold belonging to a task it is reconciling.
    pub fn derive_id(task_id: &str, user_id: &str) -> String {
        format!("{task_id}:{user_id}")
    }
}
