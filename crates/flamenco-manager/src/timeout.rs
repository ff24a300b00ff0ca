//! Timeout Detector (§4.5).
//!
//! Cooperative periodic loop: sleep `initial_sleep` to give workers a
//! chance to reconnect after a Manager restart, then run one pass every
//! `check_interval` until cancellation. Each pass handles at most one
//! task/worker step worth of committed state per transaction, so an abort
//! mid-pass never leaves partial state beyond that single step (§4.5
//! "Cancellation").

use std::sync::Arc;

use chrono::Utc;
use flamenco_core::{TaskStatus, WorkerStatus};
use flamenco_storage::Store;

use crate::blocklist;
use crate::config::Config;
use crate::event::Broker;
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::state_machine;

/// Run the timeout detector until `shutdown` is raised.
pub async fn run(store: Arc<Store>, broker: Arc<Broker>, config: Config, shutdown: ShutdownFlag) {
    let _guard = ShutdownGuard::new(&shutdown);
    let mut wait = std::pin::pin!(shutdown.wait());

    tokio::select! {
        biased;
        _ = wait.as_mut() => return,
        _ = tokio::time::sleep(config.initial_sleep) => (),
    }

    loop {
        if let Err(err) = run_pass(&store, &broker, &config).await {
            tracing::warn!("timeout detector pass failed: {err}");
        }

        tokio::select! {
            biased;
            _ = wait.as_mut() => return,
            _ = tokio::time::sleep(config.check_interval) => (),
        }
    }
}

async fn run_pass(store: &Store, broker: &Broker, config: &Config) -> flamenco_core::Result<()> {
    task_timeout_pass(store, broker, config).await?;
    worker_timeout_pass(store, broker, config).await?;
    Ok(())
}

/// §4.5 "Task timeout pass": fail every `active` task whose
/// `last_touched_at` is at or before `now - task_timeout`, one task (one
/// transaction) at a time.
pub async fn task_timeout_pass(store: &Store, broker: &Broker, config: &Config) -> flamenco_core::Result<()> {
    let deadline = Utc::now() - chrono::Duration::from_std(config.task_timeout).unwrap_or_default();

    let stale_task_ids = {
        let mut txn = store.begin_read().await?;
        flamenco_storage::fetch_stale_active_tasks(txn.conn(), deadline)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect::<Vec<_>>()
    };

    for task_id in stale_task_ids {
        let mut txn = store.begin_write().await?;
        let conn = txn.conn();

        let (task, _job_uuid, worker_uuid) = match flamenco_storage::fetch_task_by_id(conn, task_id).await
        {
            Ok(row) => row,
            Err(_) => continue,
        };
        if task.status != TaskStatus::Active {
            continue;
        }

        let worker_label = match worker_uuid {
            Some(uuid) => {
                let worker = flamenco_storage::fetch_worker(conn, uuid).await?;
                format!("{} ({uuid})", worker.name)
            }
            None => "-unassigned-".to_string(),
        };
        let activity = format!("Task timed out on worker {worker_label}");

        let events = state_machine::change_task_status(conn, task_id, TaskStatus::Failed, &activity).await?;
        txn.commit().await?;

        tracing::info!(task_id, deadline = %deadline, "{activity}");
        for event in events {
            broker.broadcast(event);
        }
    }

    Ok(())
}

/// §4.5 "Worker timeout pass": mark non-excluded workers silent since
/// `now - worker_timeout` as `error` and requeue their active tasks.
async fn worker_timeout_pass(store: &Store, broker: &Broker, config: &Config) -> flamenco_core::Result<()> {
    let deadline = Utc::now() - chrono::Duration::from_std(config.worker_timeout).unwrap_or_default();

    let stale_worker_ids = {
        let mut txn = store.begin_read().await?;
        flamenco_storage::fetch_stale_workers(txn.conn(), deadline)
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect::<Vec<_>>()
    };

    for worker_id in stale_worker_ids {
        let mut txn = store.begin_write().await?;
        let conn = txn.conn();

        let worker = match flamenco_storage::fetch_worker_by_id(conn, worker_id).await {
            Ok(worker) => worker,
            Err(_) => continue,
        };
        if matches!(worker.status, WorkerStatus::Offline | WorkerStatus::Error) {
            continue;
        }

        flamenco_storage::save_worker_status(conn, worker_id, WorkerStatus::Error).await?;
        let mut events = blocklist::requeue_active_tasks_of_worker(conn, worker_id, "worker timeout")
            .await?;
        events.push(crate::event::worker_update(
            worker.uuid,
            worker.name.clone(),
            WorkerStatus::Error,
        ));

        txn.commit().await?;

        tracing::info!(worker_id, deadline = %deadline, "worker {} timed out", worker.name);
        for event in events {
            broker.broadcast(event);
        }
    }

    Ok(())
}
