use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::models::AbilityTask;

// Three-table design: admission order lives in the queued table's u64 key,
// so popping the next task is a first() instead of a scan.
const QUEUED: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks_queued");
const PROCESSING: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks_processing");
const DONE: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks_done");
const META: TableDefinition<&str, u64> = TableDefinition::new("tasks_meta");

const SEQ_KEY: &str = "admission_seq";

/// Persistent task store backing the worker pool.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Database>,
    notify: Arc<Notify>,
}

impl TaskStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(QUEUED)?;
        write_txn.open_table(PROCESSING)?;
        write_txn.open_table(DONE)?;
        write_txn.open_table(META)?;
        write_txn.commit()?;

        Ok(Self {
            db,
            notify: Arc::new(Notify::new()),
        })
    }

    /// Admit a task at the tail of the queue and wake one worker.
    pub fn enqueue(&self, task: &AbilityTask) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let seq = {
                let mut meta = write_txn.open_table(META)?;
                let next = meta.get(SEQ_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
                meta.insert(SEQ_KEY, next)?;
                next
            };
            let mut queued = write_txn.open_table(QUEUED)?;
            let serialized = serde_json::to_vec(task)?;
            queued.insert(seq, serialized.as_slice())?;
        }
        write_txn.commit()?;
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the oldest queued task, marking it running. Blocks until one is
    /// available.
    pub async fn pop_next(&self) -> Result<AbilityTask> {
        loop {
            match self.try_pop()? {
                Some(task) => return Ok(task),
                None => self.notify.notified().await,
            }
        }
    }

    fn try_pop(&self) -> Result<Option<AbilityTask>> {
        let write_txn = self.db.begin_write()?;
        let popped = {
            let mut queued = write_txn.open_table(QUEUED)?;
            let first = queued.first()?.map(|(k, v)| (k.value(), v.value().to_vec()));
            match first {
                Some((seq, data)) => {
                    queued.remove(&seq)?;
                    Some(data)
                }
                None => None,
            }
        };

        let task = match popped {
            Some(data) => {
                let mut task: AbilityTask = serde_json::from_slice(&data)?;
                task.start();
                let serialized = serde_json::to_vec(&task)?;
                {
                    let mut processing = write_txn.open_table(PROCESSING)?;
                    processing.insert(task.id.as_str(), serialized.as_slice())?;
                }
                Some(task)
            }
            None => None,
        };

        write_txn.commit()?;
        Ok(task)
    }

    /// Persist an in-flight task's current state (e.g. submission metadata).
    pub fn update_processing(&self, task: &AbilityTask) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut processing = write_txn.open_table(PROCESSING)?;
            let serialized = serde_json::to_vec(task)?;
            processing.insert(task.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Move a task into the terminal table.
    pub fn finish(&self, task: &AbilityTask) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut processing = write_txn.open_table(PROCESSING)?;
            processing.remove(task.id.as_str())?;
        }
        {
            let mut done = write_txn.open_table(DONE)?;
            let serialized = serde_json::to_vec(task)?;
            done.insert(task.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<AbilityTask>> {
        let read_txn = self.db.begin_read()?;

        let processing = read_txn.open_table(PROCESSING)?;
        if let Some(data) = processing.get(task_id)? {
            return Ok(Some(serde_json::from_slice(data.value())?));
        }

        let done = read_txn.open_table(DONE)?;
        if let Some(data) = done.get(task_id)? {
            return Ok(Some(serde_json::from_slice(data.value())?));
        }

        let queued = read_txn.open_table(QUEUED)?;
        for entry in queued.iter()? {
            let (_, data) = entry?;
            let task: AbilityTask = serde_json::from_slice(data.value())?;
            if task.id == task_id {
                return Ok(Some(task));
            }
        }

        Ok(None)
    }

    /// Remove and return every non-terminal task (queued and in-flight).
    /// Used once at startup to reconcile work orphaned by a previous process.
    pub fn drain_unfinished(&self) -> Result<Vec<AbilityTask>> {
        let write_txn = self.db.begin_write()?;
        let mut tasks = Vec::new();

        {
            let mut queued = write_txn.open_table(QUEUED)?;
            let entries: Vec<(u64, Vec<u8>)> = queued
                .iter()?
                .map(|e| e.map(|(k, v)| (k.value(), v.value().to_vec())))
                .collect::<std::result::Result<_, _>>()?;
            for (seq, data) in entries {
                queued.remove(&seq)?;
                tasks.push(serde_json::from_slice(&data)?);
            }
        }

        {
            let mut processing = write_txn.open_table(PROCESSING)?;
            let entries: Vec<(String, Vec<u8>)> = processing
                .iter()?
                .map(|e| e.map(|(k, v)| (k.value().to_string(), v.value().to_vec())))
                .collect::<std::result::Result<_, _>>()?;
            for (id, data) in entries {
                processing.remove(id.as_str())?;
                tasks.push(serde_json::from_slice(&data)?);
            }
        }

        write_txn.commit()?;
        Ok(tasks)
    }

    /// Query across all three tables with a filter.
    pub fn query_all<F>(&self, filter: F) -> Result<Vec<AbilityTask>>
    where
        F: Fn(&AbilityTask) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let mut tasks = Vec::new();

        let queued = read_txn.open_table(QUEUED)?;
        for entry in queued.iter()? {
            let (_, data) = entry?;
            let task: AbilityTask = serde_json::from_slice(data.value())?;
            if filter(&task) {
                tasks.push(task);
            }
        }

        let processing = read_txn.open_table(PROCESSING)?;
        for entry in processing.iter()? {
            let (_, data) = entry?;
            let task: AbilityTask = serde_json::from_slice(data.value())?;
            if filter(&task) {
                tasks.push(task);
            }
        }

        let done = read_txn.open_table(DONE)?;
        for entry in done.iter()? {
            let (_, data) = entry?;
            let task: AbilityTask = serde_json::from_slice(data.value())?;
            if filter(&task) {
                tasks.push(task);
            }
        }

        Ok(tasks)
    }

    /// Tasks owned by a user, newest first.
    pub fn list_for_user(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<AbilityTask>> {
        let mut tasks = self.query_all(|t| user_id.map_or(true, |u| t.user_id == u))?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }
}
