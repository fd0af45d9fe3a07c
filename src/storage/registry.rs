use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{Error, Result};
use crate::models::{ApiKey, ApiKeyStatus, Executor};

const EXECUTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("executors");
const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");

/// Configured executor backends per provider.
///
/// Mutation happens inside single write transactions (redb write transactions
/// are exclusive), so concurrent acquires never double-assign capacity.
#[derive(Clone)]
pub struct ExecutorRegistry {
    db: Arc<Database>,
}

impl ExecutorRegistry {
    pub fn new(db: Arc<Database>) -> anyhow::Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(EXECUTORS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn put(&self, executor: &Executor) -> anyhow::Result<()> {
        let write_txn = self.db.begin_write().context("begin executor write")?;
        {
            let mut table = write_txn.open_table(EXECUTORS)?;
            let serialized = serde_json::to_vec(executor)?;
            table.insert(executor.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit().context("commit executor")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<Executor>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EXECUTORS)?;
        match table.get(id)? {
            Some(data) => Ok(Some(serde_json::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, provider: Option<&str>) -> anyhow::Result<Vec<Executor>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EXECUTORS)?;
        let mut executors = Vec::new();
        for entry in table.iter()? {
            let (_, data) = entry?;
            let executor: Executor = serde_json::from_slice(data.value())?;
            if provider.map_or(true, |p| executor.provider == p) {
                executors.push(executor);
            }
        }
        Ok(executors)
    }

    /// Pick the active, healthy executor with the lowest weighted load,
    /// breaking ties by creation order, and reserve one slot on it.
    pub fn acquire(&self, provider: &str) -> Result<Executor> {
        let write_txn = self.db.begin_write().context("begin executor write")?;
        let picked = {
            let mut table = write_txn.open_table(EXECUTORS).context("open executors")?;

            let mut candidates: Vec<Executor> = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                let executor: Executor = serde_json::from_slice(data.value())?;
                if executor.provider == provider
                    && executor.healthy
                    && executor.current_load < executor.capacity
                {
                    candidates.push(executor);
                }
            }

            // load/weight compared cross-multiplied to stay in integers
            candidates.sort_by(|a, b| {
                let left = a.current_load as u64 * b.weight.max(1) as u64;
                let right = b.current_load as u64 * a.weight.max(1) as u64;
                left.cmp(&right)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });

            match candidates.into_iter().next() {
                Some(mut executor) => {
                    executor.current_load += 1;
                    let serialized = serde_json::to_vec(&executor)?;
                    table.insert(executor.id.as_str(), serialized.as_slice())?;
                    executor
                }
                None => return Err(Error::NoExecutor(provider.to_string())),
            }
        };
        write_txn.commit().context("commit executor acquire")?;
        Ok(picked)
    }

    /// Give back a slot reserved by [`acquire`](Self::acquire).
    pub fn release(&self, id: &str) -> anyhow::Result<()> {
        let write_txn = self.db.begin_write().context("begin executor write")?;
        {
            let mut table = write_txn.open_table(EXECUTORS)?;
            let existing = match table.get(id)? {
                Some(data) => Some(serde_json::from_slice::<Executor>(data.value())?),
                None => None,
            };
            if let Some(mut executor) = existing {
                executor.current_load = executor.current_load.saturating_sub(1);
                let serialized = serde_json::to_vec(&executor)?;
                table.insert(id, serialized.as_slice())?;
            }
        }
        write_txn.commit().context("commit executor release")?;
        Ok(())
    }

    /// Zero every executor's load counter. Slots reserved by a process that
    /// died never saw `release`; at startup nothing is running, so any
    /// recorded load is stale.
    pub fn reset_loads(&self) -> anyhow::Result<u32> {
        let write_txn = self.db.begin_write().context("begin executor write")?;
        let mut reset = 0;
        {
            let mut table = write_txn.open_table(EXECUTORS)?;
            let executors: Vec<Executor> = table
                .iter()?
                .map(|e| {
                    e.map_err(anyhow::Error::from)
                        .and_then(|(_, v)| Ok(serde_json::from_slice(v.value())?))
                })
                .collect::<anyhow::Result<_>>()?;
            for mut executor in executors {
                if executor.current_load == 0 {
                    continue;
                }
                executor.current_load = 0;
                let serialized = serde_json::to_vec(&executor)?;
                table.insert(executor.id.as_str(), serialized.as_slice())?;
                reset += 1;
            }
        }
        write_txn.commit().context("commit executor load reset")?;
        Ok(reset)
    }

    pub fn heartbeat(&self, id: &str, healthy: bool) -> anyhow::Result<()> {
        let write_txn = self.db.begin_write().context("begin executor write")?;
        {
            let mut table = write_txn.open_table(EXECUTORS)?;
            let existing = match table.get(id)? {
                Some(data) => Some(serde_json::from_slice::<Executor>(data.value())?),
                None => None,
            };
            if let Some(mut executor) = existing {
                executor.healthy = healthy;
                executor.last_heartbeat = Some(chrono::Utc::now().timestamp_millis());
                let serialized = serde_json::to_vec(&executor)?;
                table.insert(id, serialized.as_slice())?;
            }
        }
        write_txn.commit().context("commit executor heartbeat")?;
        Ok(())
    }
}

/// Rotating credential pool per provider.
///
/// Selection is least-recently-used among active keys, with an in-process
/// lease set providing skip-locked semantics: a key leased to an in-flight
/// call is invisible to concurrent acquirers, so quota is never
/// double-counted for the same moment.
#[derive(Clone)]
pub struct CredentialBroker {
    db: Arc<Database>,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl CredentialBroker {
    pub fn new(db: Arc<Database>) -> anyhow::Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(API_KEYS)?;
        write_txn.commit()?;
        Ok(Self {
            db,
            leases: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn put(&self, key: &ApiKey) -> anyhow::Result<()> {
        let write_txn = self.db.begin_write().context("begin api key write")?;
        {
            let mut table = write_txn.open_table(API_KEYS)?;
            let serialized = serde_json::to_vec(key)?;
            table.insert(key.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit().context("commit api key")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<ApiKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(API_KEYS)?;
        match table.get(id)? {
            Some(data) => Ok(Some(serde_json::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, provider: Option<&str>) -> anyhow::Result<Vec<ApiKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(API_KEYS)?;
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (_, data) = entry?;
            let key: ApiKey = serde_json::from_slice(data.value())?;
            if provider.map_or(true, |p| key.provider == p) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Lease the least-recently-used active credential for a provider.
    /// The lease lasts until [`report_usage`](Self::report_usage).
    pub fn acquire(&self, provider: &str) -> Result<ApiKey> {
        let mut leases = self.leases.lock();

        let write_txn = self.db.begin_write().context("begin api key write")?;
        let picked = {
            let mut table = write_txn.open_table(API_KEYS).context("open api keys")?;

            let mut candidates: Vec<ApiKey> = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                let key: ApiKey = serde_json::from_slice(data.value())?;
                if key.provider == provider
                    && key.status == ApiKeyStatus::Active
                    && !leases.contains(&key.id)
                {
                    candidates.push(key);
                }
            }

            candidates.sort_by(|a, b| {
                a.last_used_at
                    .cmp(&b.last_used_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });

            match candidates.into_iter().next() {
                Some(mut key) => {
                    key.last_used_at = Some(chrono::Utc::now().timestamp_millis());
                    let serialized = serde_json::to_vec(&key)?;
                    table.insert(key.id.as_str(), serialized.as_slice())?;
                    key
                }
                None => return Err(Error::NoCredential(provider.to_string())),
            }
        };
        write_txn.commit().context("commit api key acquire")?;

        leases.insert(picked.id.clone());
        Ok(picked)
    }

    /// Record usage for a leased key and drop the lease. Crossing the daily
    /// quota flips the key to Exhausted in the same transaction as the
    /// increment that crossed it.
    pub fn report_usage(&self, key_id: &str, calls: u64) -> anyhow::Result<()> {
        let write_txn = self.db.begin_write().context("begin api key write")?;
        {
            let mut table = write_txn.open_table(API_KEYS)?;
            let existing = match table.get(key_id)? {
                Some(data) => Some(serde_json::from_slice::<ApiKey>(data.value())?),
                None => None,
            };
            if let Some(mut key) = existing {
                key.usage_count += calls;
                if key.daily_quota > 0
                    && key.usage_count >= key.daily_quota
                    && key.status == ApiKeyStatus::Active
                {
                    key.status = ApiKeyStatus::Exhausted;
                }
                let serialized = serde_json::to_vec(&key)?;
                table.insert(key_id, serialized.as_slice())?;
            }
        }
        write_txn.commit().context("commit api key usage")?;

        self.leases.lock().remove(key_id);
        Ok(())
    }

    /// External daily reset: zero usage and restore exhausted keys.
    pub fn reset_daily_usage(&self, provider: &str) -> anyhow::Result<u32> {
        let write_txn = self.db.begin_write().context("begin api key write")?;
        let mut reset = 0;
        {
            let mut table = write_txn.open_table(API_KEYS)?;
            let keys: Vec<ApiKey> = table
                .iter()?
                .map(|e| {
                    e.map_err(anyhow::Error::from)
                        .and_then(|(_, v)| Ok(serde_json::from_slice(v.value())?))
                })
                .collect::<anyhow::Result<_>>()?;
            for mut key in keys {
                if key.provider != provider {
                    continue;
                }
                key.usage_count = 0;
                if key.status == ApiKeyStatus::Exhausted {
                    key.status = ApiKeyStatus::Active;
                }
                let serialized = serde_json::to_vec(&key)?;
                table.insert(key.id.as_str(), serialized.as_slice())?;
                reset += 1;
            }
        }
        write_txn.commit().context("commit api key reset")?;
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Arc<Database> {
        Arc::new(
            Database::builder()
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .unwrap(),
        )
    }

    #[test]
    fn test_executor_lowest_load_wins() {
        let registry = ExecutorRegistry::new(db()).unwrap();
        let mut busy = Executor::new("busy", "comfyui", "http://a");
        busy.current_load = 3;
        busy.created_at = 1;
        let mut idle = Executor::new("idle", "comfyui", "http://b");
        idle.created_at = 2;
        registry.put(&busy).unwrap();
        registry.put(&idle).unwrap();

        let picked = registry.acquire("comfyui").unwrap();
        assert_eq!(picked.name, "idle");
        assert_eq!(picked.current_load, 1);
    }

    #[test]
    fn test_executor_tie_break_is_creation_order() {
        let registry = ExecutorRegistry::new(db()).unwrap();
        let mut second = Executor::new("second", "comfyui", "http://b");
        second.created_at = 20;
        let mut first = Executor::new("first", "comfyui", "http://a");
        first.created_at = 10;
        registry.put(&second).unwrap();
        registry.put(&first).unwrap();

        assert_eq!(registry.acquire("comfyui").unwrap().name, "first");
    }

    #[test]
    fn test_executor_capacity_and_health_respected() {
        let registry = ExecutorRegistry::new(db()).unwrap();
        let mut full = Executor::new("full", "comfyui", "http://a");
        full.capacity = 1;
        full.current_load = 1;
        let mut sick = Executor::new("sick", "comfyui", "http://b");
        sick.healthy = false;
        registry.put(&full).unwrap();
        registry.put(&sick).unwrap();

        assert!(matches!(
            registry.acquire("comfyui").unwrap_err(),
            Error::NoExecutor(_)
        ));

        registry.release(&full.id).unwrap();
        assert_eq!(registry.acquire("comfyui").unwrap().name, "full");
    }

    #[test]
    fn test_reset_loads_clears_leaked_slots() {
        let registry = ExecutorRegistry::new(db()).unwrap();
        let mut only = Executor::new("only", "kie", "http://a");
        only.capacity = 1;
        registry.put(&only).unwrap();

        // A slot acquired but never released, as after a crash.
        registry.acquire("kie").unwrap();
        assert!(matches!(
            registry.acquire("kie").unwrap_err(),
            Error::NoExecutor(_)
        ));

        assert_eq!(registry.reset_loads().unwrap(), 1);
        let picked = registry.acquire("kie").unwrap();
        assert_eq!(picked.name, "only");
        assert_eq!(picked.current_load, 1);

        // Nothing left to clear after a release.
        registry.release(&picked.id).unwrap();
        assert_eq!(registry.reset_loads().unwrap(), 0);
    }

    #[test]
    fn test_credential_lru_rotation() {
        let broker = CredentialBroker::new(db()).unwrap();
        let mut old = ApiKey::new("kie", "k-old", 0);
        old.last_used_at = Some(100);
        old.created_at = 1;
        let mut fresh = ApiKey::new("kie", "k-fresh", 0);
        fresh.last_used_at = Some(200);
        fresh.created_at = 2;
        broker.put(&old).unwrap();
        broker.put(&fresh).unwrap();

        let picked = broker.acquire("kie").unwrap();
        assert_eq!(picked.key, "k-old");
        broker.report_usage(&picked.id, 1).unwrap();

        // Now the other key is least recently used.
        let picked = broker.acquire("kie").unwrap();
        assert_eq!(picked.key, "k-fresh");
    }

    #[test]
    fn test_leased_keys_are_skipped() {
        let broker = CredentialBroker::new(db()).unwrap();
        broker.put(&ApiKey::new("kie", "k1", 0)).unwrap();
        broker.put(&ApiKey::new("kie", "k2", 0)).unwrap();

        let a = broker.acquire("kie").unwrap();
        let b = broker.acquire("kie").unwrap();
        assert_ne!(a.id, b.id);

        // All keys leased: concurrent acquirers find none.
        assert!(matches!(
            broker.acquire("kie").unwrap_err(),
            Error::NoCredential(_)
        ));

        broker.report_usage(&a.id, 1).unwrap();
        assert_eq!(broker.acquire("kie").unwrap().id, a.id);
    }

    #[test]
    fn test_quota_crossing_flips_to_exhausted() {
        let broker = CredentialBroker::new(db()).unwrap();
        let key = ApiKey::new("kie", "k1", 2);
        broker.put(&key).unwrap();

        let k = broker.acquire("kie").unwrap();
        broker.report_usage(&k.id, 1).unwrap();
        assert_eq!(broker.get(&k.id).unwrap().unwrap().status, ApiKeyStatus::Active);

        let k = broker.acquire("kie").unwrap();
        broker.report_usage(&k.id, 1).unwrap();
        assert_eq!(
            broker.get(&k.id).unwrap().unwrap().status,
            ApiKeyStatus::Exhausted
        );
        assert!(broker.acquire("kie").is_err());

        assert_eq!(broker.reset_daily_usage("kie").unwrap(), 1);
        let restored = broker.get(&k.id).unwrap().unwrap();
        assert_eq!(restored.status, ApiKeyStatus::Active);
        assert_eq!(restored.usage_count, 0);
    }
}
