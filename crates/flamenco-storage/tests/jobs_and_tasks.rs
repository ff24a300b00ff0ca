use flamenco_core::{AuthoredDependency, AuthoredJob, Command, JobStatus, NewJob, NewTask};
use flamenco_storage::Store;
use uuid::Uuid;

fn sample_job() -> AuthoredJob {
    let command = Command {
        name: "render".to_string(),
        parameters: serde_json::json!({}),
        total_steps: 1,
    };

    AuthoredJob {
        job: NewJob {
            uuid: Uuid::new_v4(),
            name: "sample job".to_string(),
            job_type: "simple-render".to_string(),
            priority: 50,
            status: JobStatus::Queued,
            settings: serde_json::json!({}),
            metadata: serde_json::json!({}),
            worker_tag: None,
        },
        tasks: vec![
            NewTask {
                local_id: 0,
                uuid: Uuid::new_v4(),
                name: "t1".to_string(),
                task_type: "blender".to_string(),
                priority: 50,
                index: 1,
                commands: vec![command.clone()],
            },
            NewTask {
                local_id: 1,
                uuid: Uuid::new_v4(),
                name: "t2".to_string(),
                task_type: "ffmpeg".to_string(),
                priority: 50,
                index: 2,
                commands: vec![command],
            },
        ],
        dependencies: vec![AuthoredDependency { task: 1, dependency: 0 }],
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn store_authored_job_persists_tasks_and_dependencies(pool: sqlx::SqlitePool) {
    let store = Store::from_pool(pool);
    let authored = sample_job();

    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.steps_total, 2);

    let mut txn = store.begin_read().await.unwrap();
    let tasks = flamenco_storage::fetch_tasks_of_job(txn.conn(), job.id).await.unwrap();
    assert_eq!(tasks.len(), 2);

    let t2 = tasks.iter().find(|t| t.name == "t2").unwrap();
    let deps = flamenco_storage::fetch_task_dependency_ids(txn.conn(), t2.id).await.unwrap();
    assert_eq!(deps.len(), 1);

    let t1 = tasks.iter().find(|t| t.name == "t1").unwrap();
    assert_eq!(deps[0], t1.id);
}

#[sqlx::test(migrations = "./migrations")]
async fn store_authored_job_rejects_cyclic_dependencies(pool: sqlx::SqlitePool) {
    let store = Store::from_pool(pool);
    let mut authored = sample_job();
    authored.dependencies.push(AuthoredDependency { task: 0, dependency: 1 });

    let mut txn = store.begin_write().await.unwrap();
    let result = flamenco_storage::store_authored_job(txn.conn(), &authored).await;
    assert!(result.is_err());
}

#[sqlx::test(migrations = "./migrations")]
async fn delete_job_cascades_to_tasks(pool: sqlx::SqlitePool) {
    let store = Store::from_pool(pool);
    let authored = sample_job();
    let job_uuid = authored.job.uuid;

    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::delete_job(txn.conn(), job_uuid).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = store.begin_read().await.unwrap();
    let tasks = flamenco_storage::fetch_tasks_of_job(txn.conn(), job.id).await.unwrap();
    assert!(tasks.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn request_job_deletion_is_idempotent(pool: sqlx::SqlitePool) {
    let store = Store::from_pool(pool);
    let authored = sample_job();
    let job_uuid = authored.job.uuid;

    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::request_job_deletion(txn.conn(), job_uuid).await.unwrap();
    flamenco_storage::request_job_deletion(txn.conn(), job_uuid).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = store.begin_read().await.unwrap();
    let reloaded = flamenco_storage::fetch_job_by_id(txn.conn(), job.id).await.unwrap();
    assert!(reloaded.delete_requested_at.is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn failure_and_blocklist_inserts_are_idempotent(pool: sqlx::SqlitePool) {
    let store = Store::from_pool(pool);
    let authored = sample_job();

    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    let worker = flamenco_storage::create_worker(
        txn.conn(),
        Uuid::new_v4(),
        "secret",
        "worker-1",
        &["blender".to_string()],
    )
    .await
    .unwrap();
    txn.commit().await.unwrap();

    let task = {
        let mut txn = store.begin_read().await.unwrap();
        flamenco_storage::fetch_tasks_of_job(txn.conn(), job.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.name == "t1")
            .unwrap()
    };

    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::add_worker_to_task_failed_list(txn.conn(), task.id, worker.id).await.unwrap();
    flamenco_storage::add_worker_to_task_failed_list(txn.conn(), task.id, worker.id).await.unwrap();
    flamenco_storage::add_worker_to_job_blocklist(txn.conn(), job.id, worker.id, "blender")
        .await
        .unwrap();
    flamenco_storage::add_worker_to_job_blocklist(txn.conn(), job.id, worker.id, "blender")
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let mut txn = store.begin_read().await.unwrap();
    let failures = flamenco_storage::fetch_task_failure_list(txn.conn(), task.id).await.unwrap();
    assert_eq!(failures.len(), 1);

    let blocklist = flamenco_storage::fetch_job_blocklist(txn.conn(), job.id).await.unwrap();
    assert_eq!(blocklist.len(), 1);
}
