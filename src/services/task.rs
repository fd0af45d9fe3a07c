//! Task lifecycle state machine: enqueue, worker-pool execution, resumption
//! after restart, and queries.
//!
//! This service is the single place where a provider outcome becomes a
//! terminal task state, so the wallet saga always sees exactly one of
//! confirm/release per freeze.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::external::{Identity, Role};
use crate::models::{
    AbilityTask, InvocationLogEntry, InvocationSource, InvocationStatus, TaskStatus, WalletHold,
};
use crate::notify::{NotificationHub, TaskEvent};
use crate::providers::{
    InvokeContext, ProviderRegistry, ResultEnvelope, RetryConfig, SubmissionCheckpoint,
};
use crate::services::callback::CallbackDispatcher;
use crate::storage::{Storage, SystemConfig, TaskStore};
use crate::taskid;

const QUEUE_RETRY_DELAY_MS: u64 = 500;
const MAX_ERROR_LEN: usize = 2_000;

/// Persists submission metadata onto the in-flight task row.
struct TaskCheckpoint {
    tasks: TaskStore,
    task: AbilityTask,
}

impl SubmissionCheckpoint for TaskCheckpoint {
    fn record(&self, metadata: Value) -> Result<()> {
        let mut task = self.task.clone();
        task.record_submission(metadata);
        self.tasks.update_processing(&task)?;
        Ok(())
    }
}

pub struct AbilityTaskService {
    pub storage: Arc<Storage>,
    providers: Arc<ProviderRegistry>,
    pub hub: Arc<NotificationHub>,
    callbacks: CallbackDispatcher,
    config: SystemConfig,
    running: Arc<Mutex<bool>>,
}

impl AbilityTaskService {
    pub fn new(
        storage: Arc<Storage>,
        providers: Arc<ProviderRegistry>,
        hub: Arc<NotificationHub>,
        config: SystemConfig,
    ) -> Self {
        let retry = RetryConfig::from_system(&config);
        let callbacks = CallbackDispatcher::new(retry, config.callback_attempts);
        Self {
            storage,
            providers,
            hub,
            callbacks,
            config,
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Validate, freeze the point cost, create the task and admit it to the
    /// queue. Fails before any task row exists on unknown/inactive abilities
    /// or insufficient balance.
    pub fn enqueue(
        &self,
        ability_id: &str,
        payload: Value,
        user: &Identity,
        callback_url: Option<String>,
        callback_headers: Option<Value>,
    ) -> Result<AbilityTask> {
        if !user.active {
            return Err(Error::Unauthorized);
        }

        let ability = self
            .storage
            .abilities
            .get(ability_id)?
            .filter(|a| a.is_active())
            .ok_or_else(|| Error::AbilityNotFound(ability_id.to_string()))?;

        let mut task = AbilityTask::new(&ability, &user.user_id, payload);
        task.callback_url = callback_url;
        task.callback_headers = callback_headers;

        // First-seen users start with the configured grant.
        if self
            .storage
            .wallet
            .ensure_seeded(&user.user_id, self.config.default_wallet_grant)?
        {
            info!(user_id = %user.user_id, points = self.config.default_wallet_grant, "seeded wallet");
        }

        let (hold_id, remaining) =
            self.storage
                .wallet
                .freeze(&user.user_id, &task.id, ability.cost_points)?;

        if let Err(e) = self.storage.tasks.enqueue(&task) {
            // Compensate the freeze; the caller never saw a task.
            if let Err(release_err) = self.storage.wallet.release_if_held(&hold_id) {
                error!(task_id = %task.id, error = %release_err, "failed to release hold after enqueue failure");
            }
            return Err(e.into());
        }

        info!(
            task_id = %task.id,
            ability = %ability.name,
            provider = %ability.provider,
            points = ability.cost_points,
            remaining,
            "task enqueued"
        );
        self.hub.broadcast(TaskEvent::Queued {
            task_id: task.id.clone(),
            user_id: task.user_id.clone(),
        });

        Ok(task)
    }

    /// Start the bounded worker pool. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.lock().await;
            if *running {
                return;
            }
            *running = true;
        }

        info!(worker_count = self.config.worker_count, "starting workers");
        for worker_id in 0..self.config.worker_count {
            let service = self.clone();
            tokio::spawn(async move {
                service.worker_loop(worker_id).await;
            });
        }
    }

    pub async fn stop(&self) {
        *self.running.lock().await = false;
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        info!(worker_id, "worker started");
        while *self.running.lock().await {
            let task = match self.storage.tasks.pop_next().await {
                Ok(task) => task,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to pop task");
                    tokio::time::sleep(std::time::Duration::from_millis(QUEUE_RETRY_DELAY_MS))
                        .await;
                    continue;
                }
            };
            debug!(worker_id, task_id = %task.id, "processing task");
            self.execute(task).await;
        }
        info!(worker_id, "worker stopped");
    }

    /// Worker body: one provider call, then the single completion path.
    async fn execute(&self, task: AbilityTask) {
        self.hub.broadcast(TaskEvent::Started {
            task_id: task.id.clone(),
        });

        let started = Instant::now();
        let (outcome, executor_id) = self.run_provider_call(&task, true).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        self.finalize(
            task,
            outcome,
            executor_id,
            duration_ms,
            InvocationSource::UserRequest,
        )
        .await;
    }

    /// Admin dry-run of an ability: the provider call happens for real, but
    /// no task is queued, no points move, and no event is broadcast. The
    /// attempt is still audited, tagged as an internal test.
    pub async fn test_invoke(
        &self,
        ability_id: &str,
        payload: Value,
        user: &Identity,
    ) -> Result<Value> {
        if !user.active || user.role == Role::User {
            return Err(Error::Unauthorized);
        }
        let ability = self
            .storage
            .abilities
            .get(ability_id)?
            .filter(|a| a.is_active())
            .ok_or_else(|| Error::AbilityNotFound(ability_id.to_string()))?;

        let task = AbilityTask::new(&ability, &user.user_id, payload);
        let started = Instant::now();
        let (outcome, executor_id) = self.run_provider_call(&task, false).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let mut entry = InvocationLogEntry::new(
            &task.id,
            &task.ability_id,
            &task.provider,
            &task.capability_key,
            executor_id,
            InvocationSource::InternalTest,
            InvocationStatus::Succeeded,
            duration_ms,
        );
        entry.request_snapshot = task.payload.clone();

        match outcome {
            Ok(envelope) => {
                entry.response_snapshot = envelope.raw.clone();
                entry.result_url = envelope.assets.first().map(|a| a.url.clone());
                entry.billing = envelope.cost;
                self.storage.invocations.append(&entry)?;
                Ok(envelope.raw)
            }
            Err(e) => {
                entry.status = InvocationStatus::Failed;
                entry.error = Some(truncate_error(&e.to_string()));
                self.storage.invocations.append(&entry)?;
                Err(e)
            }
        }
    }

    async fn run_provider_call(
        &self,
        task: &AbilityTask,
        resumable: bool,
    ) -> (Result<ResultEnvelope>, Option<String>) {
        let Some(adapter) = self.providers.get(&task.provider) else {
            return (
                Err(Error::Protocol(format!(
                    "no adapter registered for provider {}",
                    task.provider
                ))),
                None,
            );
        };

        let ability = match self.storage.abilities.get(&task.ability_id) {
            Ok(Some(ability)) => ability,
            Ok(None) => return (Err(Error::AbilityNotFound(task.ability_id.clone())), None),
            Err(e) => return (Err(e.into()), None),
        };

        // A pinned executor is used as-is; otherwise the registry reserves a
        // slot on the least loaded one.
        let (executor, reserved) = match &ability.executor_id {
            Some(id) => match self.storage.executors.get(id) {
                Ok(Some(executor)) => (executor, false),
                Ok(None) => return (Err(Error::NoExecutor(task.provider.clone())), None),
                Err(e) => return (Err(e.into()), None),
            },
            None => match self.storage.executors.acquire(&task.provider) {
                Ok(executor) => (executor, true),
                Err(e) => return (Err(e), None),
            },
        };

        let credential = if adapter.requires_credential() {
            match self.storage.credentials.acquire(&task.provider) {
                Ok(key) => Some(key),
                Err(e) => {
                    self.release_executor(&executor.id, reserved);
                    return (Err(e), Some(executor.id.clone()));
                }
            }
        } else {
            None
        };

        // Dry-run calls are never resumed, so they leave no checkpoint.
        let checkpoint = resumable.then(|| TaskCheckpoint {
            tasks: self.storage.tasks.clone(),
            task: task.clone(),
        });
        let ctx = InvokeContext {
            ability: &ability,
            task_id: &task.id,
            payload: &task.payload,
            executor: &executor,
            credential: credential.as_ref(),
            checkpoint: checkpoint
                .as_ref()
                .map(|c| c as &dyn SubmissionCheckpoint),
        };

        let outcome = adapter.invoke(ctx).await;

        self.release_executor(&executor.id, reserved);
        if let Some(key) = credential {
            // The call was attempted either way; quota reflects that.
            if let Err(e) = self.storage.credentials.report_usage(&key.id, 1) {
                warn!(key_id = %key.id, error = %e, "failed to report credential usage");
            }
        }

        (outcome, Some(executor.id.clone()))
    }

    fn release_executor(&self, executor_id: &str, reserved: bool) {
        if !reserved {
            return;
        }
        if let Err(e) = self.storage.executors.release(executor_id) {
            warn!(executor_id, error = %e, "failed to release executor slot");
        }
    }

    /// The single completion path: advance the task to a terminal state,
    /// resolve the wallet hold, write the audit entry, notify subscribers,
    /// and fire the optional callback.
    async fn finalize(
        &self,
        mut task: AbilityTask,
        outcome: Result<ResultEnvelope>,
        executor_id: Option<String>,
        duration_ms: i64,
        source: InvocationSource,
    ) {
        let hold_id = WalletHold::derive_id(&task.id, &task.user_id);
        let adapter = self.providers.get(&task.provider);

        let mut entry = InvocationLogEntry::new(
            &task.id,
            &task.ability_id,
            &task.provider,
            &task.capability_key,
            executor_id,
            source,
            InvocationStatus::Succeeded,
            duration_ms,
        );
        entry.request_snapshot = task.payload.clone();

        match outcome {
            Ok(envelope) => {
                let mut result = json!({
                    "output": envelope.raw,
                    "assets": envelope.assets,
                });
                if let (Some(job), Some(adapter)) = (&envelope.remote_job, adapter.as_ref()) {
                    result["metadata"] = adapter.job_metadata(job);
                }
                task.complete(result);

                match self.storage.wallet.confirm_if_held(&hold_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = %task.id, "hold already resolved, skipping confirm")
                    }
                    Err(e) => error!(task_id = %task.id, error = %e, "wallet confirm failed"),
                }

                entry.response_snapshot = envelope.raw;
                entry.result_url = envelope.assets.first().map(|a| a.url.clone());
                entry.billing = envelope.cost;
                info!(task_id = %task.id, duration_ms, "task succeeded");
            }
            Err(e) => {
                let message = truncate_error(&e.to_string());
                task.fail(message.clone());

                match self.storage.wallet.release_if_held(&hold_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = %task.id, "hold already resolved, skipping release")
                    }
                    Err(e) => error!(task_id = %task.id, error = %e, "wallet release failed"),
                }

                entry.status = InvocationStatus::Failed;
                entry.error = Some(message);
                error!(task_id = %task.id, error = %e, "task failed");
            }
        }

        if let Err(e) = self.storage.tasks.finish(&task) {
            error!(task_id = %task.id, error = %e, "failed to persist terminal task state");
        }
        if let Err(e) = self.storage.invocations.append(&entry) {
            error!(task_id = %task.id, error = %e, "failed to append invocation entry");
        }

        self.hub.broadcast(TaskEvent::Finished {
            task_id: task.id.clone(),
            status: task.status,
            error: task.error.clone(),
        });

        if let Some(url) = task.callback_url.clone() {
            let payload = json!({
                "taskId": task.id,
                "status": task.status,
                "result": task.result,
                "error": task.error,
            });
            let delivery = self
                .callbacks
                .deliver(&url, task.callback_headers.as_ref(), &payload)
                .await;
            if let Err(e) = self
                .storage
                .invocations
                .attach_callback(&task.id, &entry.id, delivery)
            {
                warn!(task_id = %task.id, error = %e, "failed to record callback outcome");
            }
        }
    }

    /// Reconcile tasks orphaned by a previous process.
    ///
    /// Submitted-only tasks (a remote job id persisted, no terminal state)
    /// get a status poll re-attached instead of a duplicate submission.
    /// Anything else is abandoned and fails with the fixed INTERRUPTED
    /// error, releasing its wallet hold.
    pub async fn resume_unfinished_on_startup(self: &Arc<Self>) -> Result<usize> {
        // Slots reserved by the dead process were never released; nothing is
        // running yet, so every recorded executor load is stale.
        let stale_slots = self.storage.executors.reset_loads()?;
        if stale_slots > 0 {
            warn!(stale_slots, "cleared executor loads leaked by a previous run");
        }

        let orphans = self.storage.tasks.drain_unfinished()?;
        let total = orphans.len();
        if total > 0 {
            info!(count = total, "reconciling unfinished tasks");
        }

        for task in orphans {
            let adapter = self.providers.get(&task.provider);
            let job = adapter.as_ref().and_then(|a| {
                task.result.as_ref().and_then(|result| a.submitted_job(result))
            });

            match (adapter, job) {
                (Some(adapter), Some(job)) => {
                    info!(task_id = %task.id, remote_job = %job.id, "re-attaching status poll");
                    self.storage.tasks.update_processing(&task)?;
                    let service = self.clone();
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let outcome = adapter.poll(&job).await;
                        let duration_ms = started.elapsed().as_millis() as i64;
                        service
                            .finalize(
                                task,
                                outcome,
                                None,
                                duration_ms,
                                InvocationSource::UserRequest,
                            )
                            .await;
                    });
                }
                _ => {
                    warn!(task_id = %task.id, "task abandoned before submission, marking failed");
                    self.finalize(
                        task,
                        Err(Error::Interrupted),
                        None,
                        0,
                        InvocationSource::UserRequest,
                    )
                    .await;
                }
            }
        }

        Ok(total)
    }

    /// Task summaries for the caller, newest first. Admin and service
    /// identities see every user's tasks.
    pub fn list_tasks(&self, user: &Identity, limit: usize) -> Result<Vec<AbilityTask>> {
        if !user.active {
            return Err(Error::Unauthorized);
        }
        let owner = match user.role {
            Role::Admin | Role::Service => None,
            Role::User => Some(user.user_id.as_str()),
        };
        Ok(self.storage.tasks.list_for_user(owner, limit)?)
    }

    /// Fetch one task. Accepts internal ids and the structured external
    /// form. A task owned by someone else reads as absent.
    pub fn get_task(&self, external_id: &str, user: &Identity) -> Result<AbilityTask> {
        if !user.active {
            return Err(Error::Unauthorized);
        }
        let task_id = taskid::decode(external_id);
        let task = self
            .storage
            .tasks
            .get(&task_id)?
            .ok_or_else(|| Error::TaskNotFound(external_id.to_string()))?;
        if !user.can_view(&task.user_id) {
            return Err(Error::TaskNotFound(external_id.to_string()));
        }
        Ok(task)
    }

    /// Whether a task is submitted-only: a remote job was created but no
    /// terminal state observed. Generalized per provider via the adapter.
    pub fn is_submitted_only(&self, task: &AbilityTask) -> bool {
        if task.status.is_terminal() {
            return false;
        }
        self.providers
            .get(&task.provider)
            .and_then(|a| task.result.as_ref().and_then(|r| a.submitted_job(r)))
            .is_some()
    }
}

fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryObjectStore;
    use crate::models::Ability;

    fn service() -> Arc<AbilityTaskService> {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let store: Arc<dyn crate::external::ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let providers = Arc::new(ProviderRegistry::with_defaults(
            store,
            RetryConfig::default(),
        ));
        let hub = Arc::new(NotificationHub::new(16));
        Arc::new(AbilityTaskService::new(
            storage,
            providers,
            hub,
            SystemConfig::default(),
        ))
    }

    fn seed_ability(service: &AbilityTaskService, provider: &str, cost: i64) -> Ability {
        let ability = Ability::new("test-ability", provider, "image", "cap", cost);
        service.storage.abilities.put(&ability).unwrap();
        ability
    }

    #[tokio::test]
    async fn test_enqueue_insufficient_balance_creates_no_task() {
        let service = service();
        let ability = seed_ability(&service, "comfyui", 600);
        service.storage.wallet.grant("u1", 500).unwrap();

        let err = service
            .enqueue(&ability.id, json!({}), &Identity::user("u1"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::WalletInsufficient { .. }));

        assert!(service.storage.tasks.list_for_user(None, 10).unwrap().is_empty());
        assert_eq!(service.storage.wallet.balance("u1").unwrap(), 500);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_or_inactive_ability_rejected() {
        let service = service();
        service.storage.wallet.grant("u1", 100).unwrap();

        let err = service
            .enqueue("missing", json!({}), &Identity::user("u1"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::AbilityNotFound(_)));

        let mut ability = seed_ability(&service, "comfyui", 10);
        ability.status = crate::models::AbilityStatus::Inactive;
        service.storage.abilities.put(&ability).unwrap();
        let err = service
            .enqueue(&ability.id, json!({}), &Identity::user("u1"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::AbilityNotFound(_)));
    }

    #[tokio::test]
    async fn test_enqueue_freezes_cost() {
        let service = service();
        let ability = seed_ability(&service, "comfyui", 30);
        service.storage.wallet.grant("u1", 100).unwrap();

        let task = service
            .enqueue(&ability.id, json!({}), &Identity::user("u1"), None, None)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(service.storage.wallet.balance("u1").unwrap(), 70);
        assert_eq!(service.storage.wallet.held_points("u1").unwrap(), 30);
    }

    #[tokio::test]
    async fn test_get_task_scoped_to_owner() {
        let service = service();
        let ability = seed_ability(&service, "comfyui", 10);
        service.storage.wallet.grant("u1", 100).unwrap();
        let task = service
            .enqueue(&ability.id, json!({}), &Identity::user("u1"), None, None)
            .unwrap();

        assert!(service.get_task(&task.id, &Identity::user("u1")).is_ok());
        assert!(matches!(
            service.get_task(&task.id, &Identity::user("u2")).unwrap_err(),
            Error::TaskNotFound(_)
        ));
        // Service identities see everything.
        assert!(service.get_task(&task.id, &Identity::service()).is_ok());

        // The structured external form resolves to the same task.
        let external = taskid::encode(&task.id, &task.provider, "exec-1");
        assert!(service.get_task(&external, &Identity::user("u1")).is_ok());
    }

    #[tokio::test]
    async fn test_resume_marks_unsubmitted_tasks_interrupted() {
        let service = service();
        let ability = seed_ability(&service, "comfyui", 25);
        service.storage.wallet.grant("u1", 100).unwrap();
        let task = service
            .enqueue(&ability.id, json!({}), &Identity::user("u1"), None, None)
            .unwrap();
        assert_eq!(service.storage.wallet.balance("u1").unwrap(), 75);

        let resumed = service.resume_unfinished_on_startup().await.unwrap();
        assert_eq!(resumed, 1);

        let reconciled = service.get_task(&task.id, &Identity::user("u1")).unwrap();
        assert_eq!(reconciled.status, TaskStatus::Failed);
        assert_eq!(reconciled.error.as_deref(), Some("INTERRUPTED"));
        assert!(reconciled.finished_at.is_some());
        // The hold was released.
        assert_eq!(service.storage.wallet.balance("u1").unwrap(), 100);

        // The audit trail records the interruption.
        let entries = service.storage.invocations.list_for_task(&task.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, InvocationStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent_for_wallet() {
        let service = service();
        let ability = seed_ability(&service, "comfyui", 25);
        service.storage.wallet.grant("u1", 100).unwrap();
        service
            .enqueue(&ability.id, json!({}), &Identity::user("u1"), None, None)
            .unwrap();

        service.resume_unfinished_on_startup().await.unwrap();
        // A second resume finds nothing and must not credit again.
        let resumed = service.resume_unfinished_on_startup().await.unwrap();
        assert_eq!(resumed, 0);
        assert_eq!(service.storage.wallet.balance("u1").unwrap(), 100);
    }

    #[tokio::test]
    async fn test_submitted_only_classification() {
        let service = service();
        let comfy = seed_ability(&service, "comfyui", 10);
        service.storage.wallet.grant("u1", 100).unwrap();

        let mut task = AbilityTask::new(&comfy, "u1", json!({}));
        task.start();
        task.result = Some(json!({"metadata": {"promptId": "x", "baseUrl": "http://h"}}));
        assert!(service.is_submitted_only(&task));

        // Missing baseUrl: not resumable.
        task.result = Some(json!({"metadata": {"promptId": "x"}}));
        assert!(!service.is_submitted_only(&task));

        // Same metadata under a non-polling provider: not resumable.
        let mut kie_task = task.clone();
        kie_task.provider = "kie".to_string();
        kie_task.result = Some(json!({"metadata": {"promptId": "x", "baseUrl": "http://h"}}));
        assert!(!service.is_submitted_only(&kie_task));

        // Terminal tasks are never submitted-only.
        task.result = Some(json!({"metadata": {"promptId": "x", "baseUrl": "http://h"}}));
        task.complete(json!({"metadata": {"promptId": "x", "baseUrl": "http://h"}}));
        assert!(!service.is_submitted_only(&task));
    }

    #[tokio::test]
    async fn test_test_invoke_requires_elevated_role() {
        let service = service();
        let ability = seed_ability(&service, "comfyui", 10);

        let err = service
            .test_invoke(&ability.id, json!({}), &Identity::user("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        let admin = Identity {
            user_id: "a1".to_string(),
            role: crate::external::Role::Admin,
            active: true,
        };
        let err = service
            .test_invoke("missing", json!({}), &admin)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AbilityNotFound(_)));
    }

    #[test]
    fn test_truncate_error_bounds_length() {
        let long = "e".repeat(5_000);
        let cut = truncate_error(&long);
        assert!(cut.len() <= MAX_ERROR_LEN + 20);
        assert!(cut.ends_with("[truncated]"));
    }
}
