pub mod abilities;
pub mod config;
pub mod invocations;
pub mod registry;
pub mod tasks;
pub mod wallet;

use anyhow::Result;
use redb::Database;
use std::sync::Arc;

pub use abilities::AbilityStore;
pub use config::{ConfigStorage, SystemConfig};
pub use invocations::InvocationLog;
pub use registry::{CredentialBroker, ExecutorRegistry};
pub use tasks::TaskStore;
pub use wallet::WalletLedger;

pub struct Storage {
    pub abilities: AbilityStore,
    pub tasks: TaskStore,
    pub invocations: InvocationLog,
    pub wallet: WalletLedger,
    pub executors: ExecutorRegistry,
    pub credentials: CredentialBroker,
    pub config: ConfigStorage,
}

impl Storage {
    pub fn new(path: &str) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);
        Self::with_database(db)
    }

    /// In-memory storage for tests.
    pub fn in_memory() -> Result<Self> {
        let db = Arc::new(
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?,
        );
        Self::with_database(db)
    }

    fn with_database(db: Arc<Database>) -> Result<Self> {
        let abilities = AbilityStore::new(db.clone())?;
        let tasks = TaskStore::new(db.clone())?;
        let invocations = InvocationLog::new(db.clone())?;
        let wallet = WalletLedger::new(db.clone())?;
        let executors = ExecutorRegistry::new(db.clone())?;
        let credentials = CredentialBroker::new(db.clone())?;
        let config = ConfigStorage::new(db)?;

        Ok(Self {
            abilities,
            tasks,
            invocations,
            wallet,
            executors,
            credentials,
            config,
        })
    }
}
