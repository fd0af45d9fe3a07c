use anyhow::Result;
use redb::{Database, ReadableDatabase, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CONFIG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("system_config");

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_PROVIDER_TIMEOUT_SECONDS: u64 = 120;
// Conservative retry defaults; deployments override via the config table.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_CALLBACK_ATTEMPTS: u32 = 3;
const DEFAULT_WALLET_GRANT: i64 = 1_000;
const DEFAULT_EVENT_REPLAY_CAPACITY: usize = 256;
const MIN_WORKER_COUNT: usize = 1;
const MIN_TIMEOUT_SECONDS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub worker_count: usize,
    pub provider_timeout_seconds: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub callback_attempts: u32,
    /// Points granted to a wallet the first time it is seen.
    pub default_wallet_grant: i64,
    pub event_replay_capacity: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            provider_timeout_seconds: DEFAULT_PROVIDER_TIMEOUT_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            callback_attempts: DEFAULT_CALLBACK_ATTEMPTS,
            default_wallet_grant: DEFAULT_WALLET_GRANT,
            event_replay_capacity: DEFAULT_EVENT_REPLAY_CAPACITY,
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count < MIN_WORKER_COUNT {
            return Err(anyhow::anyhow!(
                "Worker count must be at least {}",
                MIN_WORKER_COUNT
            ));
        }

        if self.provider_timeout_seconds < MIN_TIMEOUT_SECONDS {
            return Err(anyhow::anyhow!(
                "Provider timeout must be at least {} seconds",
                MIN_TIMEOUT_SECONDS
            ));
        }

        if self.max_attempts == 0 || self.callback_attempts == 0 {
            return Err(anyhow::anyhow!("Attempt budgets must be at least 1"));
        }

        if self.default_wallet_grant < 0 {
            return Err(anyhow::anyhow!("Default wallet grant cannot be negative"));
        }

        Ok(())
    }
}

pub struct ConfigStorage {
    db: Arc<Database>,
}

impl ConfigStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(CONFIG_TABLE)?;
        write_txn.commit()?;

        let storage = Self { db };

        if storage.get_config()?.is_none() {
            storage.update_config(SystemConfig::default())?;
        }

        Ok(storage)
    }

    pub fn get_config(&self) -> Result<Option<SystemConfig>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIG_TABLE)?;

        if let Some(data) = table.get("system")? {
            let config: SystemConfig = serde_json::from_slice(data.value())?;
            Ok(Some(config))
        } else {
            Ok(None)
        }
    }

    pub fn update_config(&self, config: SystemConfig) -> Result<()> {
        config.validate()?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG_TABLE)?;
            let serialized = serde_json::to_vec(&config)?;
            table.insert("system", serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SystemConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = SystemConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
