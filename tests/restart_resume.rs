//! Restart reconciliation against an on-disk database: a process that dies
//! with queued or in-flight work must converge on the next boot without
//! double-charging anyone.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use abilityflow::external::{Identity, InMemoryObjectStore, ObjectStore};
use abilityflow::models::{Ability, ApiKey, Executor, InvocationStatus, TaskStatus};
use abilityflow::notify::NotificationHub;
use abilityflow::providers::{ProviderRegistry, RetryConfig};
use abilityflow::services::AbilityTaskService;
use abilityflow::storage::{Storage, SystemConfig};

fn open_service(db_path: &str) -> Arc<AbilityTaskService> {
    let storage = Arc::new(Storage::new(db_path).unwrap());
    let config = SystemConfig::default();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let providers = Arc::new(ProviderRegistry::with_defaults(
        store,
        RetryConfig::from_system(&config),
    ));
    let hub = Arc::new(NotificationHub::new(config.event_replay_capacity));
    Arc::new(AbilityTaskService::new(storage, providers, hub, config))
}

#[tokio::test]
async fn test_unsubmitted_task_survives_restart_as_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.redb");
    let db_path = db_path.to_str().unwrap();

    let task_id = {
        // First process: admit a task, then die without running workers.
        let service = open_service(db_path);
        service.storage.abilities.put(&Ability::new(
            "txt2img", "comfyui", "image", "txt2img", 25,
        )).unwrap();
        service.storage.executors.put(&Executor::new(
            "comfy-1", "comfyui", "http://comfy:8188",
        )).unwrap();
        service.storage.credentials.put(&ApiKey::new("comfyui", "k", 0)).unwrap();
        service.storage.wallet.grant("alice", 100).unwrap();

        let ability = service.storage.abilities.list().unwrap().remove(0);
        let task = service
            .enqueue(
                &ability.id,
                json!({"prompt": "a cat"}),
                &Identity::user("alice"),
                None,
                None,
            )
            .unwrap();
        assert_eq!(service.storage.wallet.balance("alice").unwrap(), 75);
        task.id
    };

    // Second process over the same file.
    let service = open_service(db_path);
    let resumed = service.resume_unfinished_on_startup().await.unwrap();
    assert_eq!(resumed, 1);

    let task = service
        .get_task(&task_id, &Identity::user("alice"))
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("INTERRUPTED"));

    // The hold outlived the first process and was released by the second.
    assert_eq!(service.storage.wallet.balance("alice").unwrap(), 100);
    assert_eq!(service.storage.wallet.held_points("alice").unwrap(), 0);

    let entries = service.storage.invocations.list_for_task(&task_id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, InvocationStatus::Failed);

    // A third boot finds nothing left to reconcile.
    drop(service);
    let service = open_service(db_path);
    assert_eq!(service.resume_unfinished_on_startup().await.unwrap(), 0);
    assert_eq!(service.storage.wallet.balance("alice").unwrap(), 100);
}

#[tokio::test]
async fn test_submitted_task_is_polled_not_resubmitted_after_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/history/p-77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "p-77": {
                "status": {"status_str": "success"},
                "outputs": {
                    "9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}
                }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/view"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 16])
                .insert_header("content-type", "image/png"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.redb");
    let db_path = db_path.to_str().unwrap();

    let task_id = {
        // First process: the prompt was submitted and checkpointed, then the
        // process died before observing completion.
        let service = open_service(db_path);
        service
            .storage
            .abilities
            .put(&Ability::new("txt2img", "comfyui", "image", "txt2img", 25))
            .unwrap();
        service
            .storage
            .executors
            .put(&Executor::new("comfy-1", "comfyui", &server.uri()))
            .unwrap();
        service.storage.wallet.grant("alice", 100).unwrap();

        let ability = service.storage.abilities.list().unwrap().remove(0);
        let task = service
            .enqueue(
                &ability.id,
                json!({"prompt": "a cat"}),
                &Identity::user("alice"),
                None,
                None,
            )
            .unwrap();

        let mut running = service.storage.tasks.pop_next().await.unwrap();
        running.record_submission(json!({
            "promptId": "p-77",
            "baseUrl": server.uri(),
        }));
        service.storage.tasks.update_processing(&running).unwrap();
        task.id
    };

    let service = open_service(db_path);
    assert_eq!(service.resume_unfinished_on_startup().await.unwrap(), 1);

    let mut finished = None;
    for _ in 0..200 {
        let task = service
            .get_task(&task_id, &Identity::user("alice"))
            .unwrap();
        if task.status.is_terminal() {
            finished = Some(task);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let finished = finished.expect("resumed task never reached a terminal state");

    assert_eq!(finished.status, TaskStatus::Succeeded);
    let result = finished.result.expect("result present");
    assert_eq!(result["assets"].as_array().map(Vec::len), Some(1));
    assert_eq!(result["metadata"]["promptId"], "p-77");

    // The hold was confirmed: the debit stands, nothing is held.
    assert_eq!(service.storage.wallet.balance("alice").unwrap(), 75);
    assert_eq!(service.storage.wallet.held_points("alice").unwrap(), 0);

    // Completion was observed by polling; the prompt was never re-submitted.
    let requests = server.received_requests().await.unwrap();
    assert!(
        requests
            .iter()
            .all(|r| r.url.path() != "/prompt"),
        "resume must not submit a duplicate prompt"
    );
}

#[tokio::test]
async fn test_executor_load_leaked_by_crash_is_cleared_on_boot() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.redb");
    let db_path = db_path.to_str().unwrap();

    {
        // First process: reserve the only slot, then die without releasing.
        let service = open_service(db_path);
        let mut executor = Executor::new("kie-1", "kie", "http://kie");
        executor.capacity = 1;
        service.storage.executors.put(&executor).unwrap();
        service.storage.executors.acquire("kie").unwrap();
    }

    let service = open_service(db_path);
    let executors = service.storage.executors.list(Some("kie")).unwrap();
    assert_eq!(executors[0].current_load, 1);

    service.resume_unfinished_on_startup().await.unwrap();

    // The stale reservation is gone and the slot is usable again.
    let executors = service.storage.executors.list(Some("kie")).unwrap();
    assert_eq!(executors[0].current_load, 0);
    assert!(service.storage.executors.acquire("kie").is_ok());
}
