use flamenco_core::{
    AuthoredDependency, AuthoredJob, Command, JobStatus, NewJob, NewTask, TaskStatus, WorkerStatus,
};
use flamenco_manager::{Config, Engine};
use flamenco_storage::Store;
use std::sync::Arc;
use uuid::Uuid;

fn job_with_tasks(task_count: usize, task_type: &str) -> AuthoredJob {
    let tasks = (0..task_count)
        .map(|i| NewTask {
            local_id: i,
            uuid: Uuid::new_v4(),
            name: format!("render frame {}", i + 1),
            task_type: task_type.to_string(),
            priority: 50,
            index: (i + 1) as i32,
            commands: vec![Command {
                name: "render".to_string(),
                parameters: serde_json::json!({}),
                total_steps: 1,
            }],
        })
        .collect();

    AuthoredJob {
        job: NewJob {
            uuid: Uuid::new_v4(),
            name: "test job".to_string(),
            job_type: "simple-render".to_string(),
            priority: 50,
            status: JobStatus::Queued,
            settings: serde_json::json!({}),
            metadata: serde_json::json!({}),
            worker_tag: None,
        },
        tasks,
        dependencies: vec![],
    }
}

fn single_task_job(task_type: &str) -> AuthoredJob {
    job_with_tasks(1, task_type)
}

async fn make_worker(store: &Store, task_type: &str) -> flamenco_core::Worker {
    let mut txn = store.begin_write().await.unwrap();
    let worker = flamenco_storage::create_worker(
        txn.conn(),
        Uuid::new_v4(),
        "secret",
        "worker-1",
        &[task_type.to_string()],
    )
    .await
    .unwrap();
    txn.commit().await.unwrap();
    worker
}

fn two_task_job_with_dependency() -> AuthoredJob {
    let command = Command {
        name: "render".to_string(),
        parameters: serde_json::json!({}),
        total_steps: 1,
    };

    AuthoredJob {
        job: NewJob {
            uuid: Uuid::new_v4(),
            name: "test job".to_string(),
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
                name: "T1".to_string(),
                task_type: "blender".to_string(),
                priority: 50,
                index: 1,
                commands: vec![command.clone()],
            },
            NewTask {
                local_id: 1,
                uuid: Uuid::new_v4(),
                name: "T2".to_string(),
                task_type: "ffmpeg".to_string(),
                priority: 50,
                index: 2,
                commands: vec![command],
            },
        ],
        dependencies: vec![AuthoredDependency { task: 1, dependency: 0 }],
    }
}

// Seed scenario 1: T1 (blender) is handed to a worker supporting both
// types before T2 (ffmpeg, depends on T1) since T2's dependency isn't met
// yet; a second immediate request resumes the same task rather than
// double-assigning; once T1 completes, T2 becomes schedulable.
#[sqlx::test(migrations = "../flamenco-storage/migrations")]
async fn scheduler_basic(pool: sqlx::SqlitePool) {
    let store = Arc::new(Store::from_pool(pool));
    let engine = Engine::new(store.clone(), Config::default());

    let authored = two_task_job_with_dependency();
    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();
    let (t1, t2) = {
        let mut txn = store.begin_read().await.unwrap();
        let tasks = flamenco_storage::fetch_tasks_of_job(txn.conn(), job.id).await.unwrap();
        let t1 = tasks.iter().find(|t| t.name == "T1").unwrap().clone();
        let t2 = tasks.iter().find(|t| t.name == "T2").unwrap().clone();
        (t1, t2)
    };

    let mut txn = store.begin_write().await.unwrap();
    let worker = flamenco_storage::create_worker(
        txn.conn(),
        Uuid::new_v4(),
        "secret",
        "worker-1",
        &["blender".to_string(), "ffmpeg".to_string()],
    )
    .await
    .unwrap();
    txn.commit().await.unwrap();

    let first = engine.request_work(worker.id).await.unwrap().unwrap();
    assert_eq!(first.id, t1.id);
    assert_eq!(first.status, TaskStatus::Active);

    // Resume case: same worker asking again gets the same task back.
    let resumed = engine.request_work(worker.id).await.unwrap().unwrap();
    assert_eq!(resumed.id, t1.id);

    let mut txn = store.begin_read().await.unwrap();
    let reloaded_job = flamenco_storage::fetch_job_by_id(txn.conn(), job.id).await.unwrap();
    assert_eq!(reloaded_job.status, JobStatus::Active);
    drop(txn);

    engine.report_task_completed(t1.id).await.unwrap();

    let next = engine.request_work(worker.id).await.unwrap().unwrap();
    assert_eq!(next.id, t2.id);
    assert_eq!(next.status, TaskStatus::Active);
}

// Seed scenario 2: a worker that fails enough distinct blender tasks in the
// same job ends up on that job's blocklist, and the soft-failed tasks it
// left behind stop being offered to it (even though they are still
// individually retryable by other workers).
#[sqlx::test(migrations = "../flamenco-storage/migrations")]
async fn blocklist_formation(pool: sqlx::SqlitePool) {
    let store = Arc::new(Store::from_pool(pool));
    let config = Config { blocklist_threshold: 3, soft_fail_threshold: 100, ..Config::default() };
    let engine = Engine::new(store.clone(), config);

    let authored = job_with_tasks(3, "blender");
    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    let worker = make_worker(&store, "blender").await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let assigned = engine.request_work(worker.id).await.unwrap();
        let current = assigned.expect("one of the three tasks should still be schedulable");
        engine.report_task_failed(current.id, worker.id).await.unwrap();
        seen.push(current);
    }

    let mut txn = store.begin_read().await.unwrap();
    let blocklist = flamenco_storage::fetch_job_blocklist(txn.conn(), job.id).await.unwrap();
    assert_eq!(blocklist.len(), 1);
    assert_eq!(blocklist[0].worker_id, worker.id);
    assert_eq!(blocklist[0].task_type, "blender");

    // The first task failed is still soft-failed: only the third failure
    // crossed the blocklist threshold, and by then nobody was left to run
    // it, so only that third task hard-failed.
    let first = flamenco_storage::fetch_task(txn.conn(), seen[0].uuid).await.unwrap().0;
    assert_eq!(first.status, TaskStatus::SoftFailed);
    let third = flamenco_storage::fetch_task(txn.conn(), seen[2].uuid).await.unwrap().0;
    assert_eq!(third.status, TaskStatus::Failed);
    drop(txn);

    // Now blocklisted, the worker is offered nothing from this job even
    // though two of its tasks are still sitting in soft-failed.
    let nothing = engine.request_work(worker.id).await.unwrap();
    assert!(nothing.is_none());
}

// Seed scenario 3: once enough distinct workers have each failed the same
// task, it hard-fails regardless of the blocklist threshold, because the
// failure-list already rules every one of them out of retrying it.
#[sqlx::test(migrations = "../flamenco-storage/migrations")]
async fn hard_fail_by_exhaustion(pool: sqlx::SqlitePool) {
    let store = Arc::new(Store::from_pool(pool));
    let config = Config { blocklist_threshold: 100, soft_fail_threshold: 3, ..Config::default() };
    let engine = Engine::new(store.clone(), config);

    let authored = single_task_job("blender");
    let mut txn = store.begin_write().await.unwrap();
    let job = flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();
    let task = {
        let mut txn = store.begin_read().await.unwrap();
        flamenco_storage::fetch_tasks_of_job(txn.conn(), job.id).await.unwrap().remove(0)
    };

    for _ in 0..3 {
        let worker = make_worker(&store, "blender").await;
        let assigned = engine.request_work(worker.id).await.unwrap().unwrap();
        assert_eq!(assigned.id, task.id);
        engine.report_task_failed(task.id, worker.id).await.unwrap();
    }

    let mut txn = store.begin_read().await.unwrap();
    let reloaded = flamenco_storage::fetch_task(txn.conn(), task.uuid).await.unwrap().0;
    assert_eq!(reloaded.status, TaskStatus::Failed);
    let reloaded_job = flamenco_storage::fetch_job_by_id(txn.conn(), job.id).await.unwrap();
    assert_eq!(reloaded_job.status, JobStatus::Failed);
}

// Seed scenario 4: a task whose last_touched_at is beyond the configured
// timeout is failed by the timeout detector's pass.
#[sqlx::test(migrations = "../flamenco-storage/migrations")]
async fn task_timeout(pool: sqlx::SqlitePool) {
    let store = Arc::new(Store::from_pool(pool));
    let config = Config { task_timeout: std::time::Duration::from_secs(0), ..Config::default() };
    let engine = Engine::new(store.clone(), config.clone());

    let authored = single_task_job("blender");
    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    let worker = make_worker(&store, "blender").await;
    let task = engine.request_work(worker.id).await.unwrap().unwrap();

    // Let the zero-duration timeout window elapse.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    flamenco_manager::timeout::task_timeout_pass(&store, &engine.broker, &config)
        .await
        .unwrap();

    let mut txn = store.begin_read().await.unwrap();
    let reloaded = flamenco_storage::fetch_task(txn.conn(), task.uuid).await.unwrap().0;
    assert_eq!(reloaded.status, TaskStatus::Failed);
}

// Seed scenario 5: signing a worker off requeues every task it held active.
#[sqlx::test(migrations = "../flamenco-storage/migrations")]
async fn worker_sign_off_requeue(pool: sqlx::SqlitePool) {
    let store = Arc::new(Store::from_pool(pool));
    let engine = Engine::new(store.clone(), Config::default());

    let authored = single_task_job("blender");
    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    let worker = make_worker(&store, "blender").await;
    let task = engine.request_work(worker.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Active);

    engine
        .requeue_active_tasks_of_worker(worker.id, "worker signed off")
        .await
        .unwrap();

    let mut txn = store.begin_read().await.unwrap();
    let reloaded = flamenco_storage::fetch_task(txn.conn(), task.uuid).await.unwrap().0;
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert!(reloaded.worker_id.is_some(), "requeue clears status, not assignment history");
}

// Seed scenario 6: the farm status aggregator's pure resolution matches a
// live store snapshot end to end (awake worker + active job -> active).
#[sqlx::test(migrations = "../flamenco-storage/migrations")]
async fn farm_status_aggregation(pool: sqlx::SqlitePool) {
    let store = Arc::new(Store::from_pool(pool));
    let engine = Engine::new(store.clone(), Config::default());

    let status = flamenco_manager::farm_status::compute_status(&store).await.unwrap();
    assert_eq!(status, flamenco_core::FarmStatus::Inoperative);

    let authored = single_task_job("blender");
    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::store_authored_job(txn.conn(), &authored).await.unwrap();
    txn.commit().await.unwrap();

    let worker = make_worker(&store, "blender").await;
    engine.request_work(worker.id).await.unwrap();

    let status = flamenco_manager::farm_status::compute_status(&store).await.unwrap();
    assert_eq!(status, flamenco_core::FarmStatus::Active);

    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::save_worker_status(txn.conn(), worker.id, WorkerStatus::Offline).await.unwrap();
    txn.commit().await.unwrap();

    let status = flamenco_manager::farm_status::compute_status(&store).await.unwrap();
    assert_eq!(status, flamenco_core::FarmStatus::Inoperative);
}
