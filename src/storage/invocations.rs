use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::models::{CallbackDelivery, InvocationLogEntry};

// Keyed task_id:entry_id so one task's entries are adjacent.
const INVOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("invocation_log");

/// Append-only audit log of provider call attempts.
#[derive(Clone)]
pub struct InvocationLog {
    db: Arc<Database>,
}

impl InvocationLog {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(INVOCATIONS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn append(&self, entry: &InvocationLogEntry) -> Result<()> {
        let write_txn = self.db.begin_write().context("begin invocation write")?;
        {
            let mut table = write_txn.open_table(INVOCATIONS)?;
            let key = format!("{}:{}", entry.task_id, entry.id);
            let serialized = serde_json::to_vec(entry)?;
            table.insert(key.as_str(), serialized.as_slice())?;
        }
        write_txn.commit().context("commit invocation entry")?;
        Ok(())
    }

    /// The one post-terminal mutation an entry permits: attaching the
    /// callback delivery outcome.
    pub fn attach_callback(
        &self,
        task_id: &str,
        entry_id: &str,
        delivery: CallbackDelivery,
    ) -> Result<()> {
        let key = format!("{task_id}:{entry_id}");
        let write_txn = self.db.begin_write().context("begin invocation write")?;
        {
            let mut table = write_txn.open_table(INVOCATIONS)?;
            let mut entry: InvocationLogEntry = match table.get(key.as_str())? {
                Some(data) => serde_json::from_slice(data.value())?,
                None => anyhow::bail!("invocation entry not found: {key}"),
            };
            entry.callback = Some(delivery);
            let serialized = serde_json::to_vec(&entry)?;
            table.insert(key.as_str(), serialized.as_slice())?;
        }
        write_txn.commit().context("commit callback outcome")?;
        Ok(())
    }

    pub fn list_for_task(&self, task_id: &str) -> Result<Vec<InvocationLogEntry>> {
        let read_txn = self.db.begin_read().context("begin invocation read")?;
        let table = read_txn.open_table(INVOCATIONS)?;

        let mut entries = Vec::new();
        let prefix = format!("{task_id}:");
        for entry in table.iter()? {
            let (key, data) = entry?;
            if key.value().starts_with(&prefix) {
                entries.push(serde_json::from_slice(data.value())?);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CallbackStatus, InvocationSource, InvocationStatus};
    use serde_json::json;

    fn setup() -> InvocationLog {
        let db = Arc::new(
            Database::builder()
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .unwrap(),
        );
        InvocationLog::new(db).unwrap()
    }

    fn make_entry(task_id: &str) -> InvocationLogEntry {
        InvocationLogEntry::new(
            task_id,
            "ability-1",
            "kie",
            "upscale",
            Some("exec-1".to_string()),
            InvocationSource::UserRequest,
            InvocationStatus::Succeeded,
            125,
        )
    }

    #[test]
    fn test_append_and_list_by_task() {
        let log = setup();
        log.append(&make_entry("t1")).unwrap();
        log.append(&make_entry("t1")).unwrap();
        log.append(&make_entry("t2")).unwrap();

        assert_eq!(log.list_for_task("t1").unwrap().len(), 2);
        assert_eq!(log.list_for_task("t2").unwrap().len(), 1);
        assert!(log.list_for_task("t3").unwrap().is_empty());
    }

    #[test]
    fn test_attach_callback_outcome() {
        let log = setup();
        let entry = make_entry("t1");
        log.append(&entry).unwrap();

        let delivery = CallbackDelivery {
            status: CallbackStatus::Delivered,
            http_status: Some(200),
            payload: json!({"taskId": "t1"}),
            response: Some("ok".to_string()),
            error: None,
            started_at: 1,
            finished_at: 2,
        };
        log.attach_callback("t1", &entry.id, delivery).unwrap();

        let entries = log.list_for_task("t1").unwrap();
        let callback = entries[0].callback.as_ref().unwrap();
        assert_eq!(callback.status, CallbackStatus::Delivered);
        assert_eq!(callback.http_status, Some(200));
    }
}
