//! Failure & Blocklist Policy (§4.4).

use flamenco_core::{Id, TaskStatus};
use sqlx::SqliteConnection;

use crate::event::Event;
use crate::state_machine;

/// Record that `worker_id` failed `task_id`, update the blocklist if this
/// worker has now failed this (job, task-type) combination often enough,
/// and transition the task to `soft-failed` or `failed` depending on
/// whether any worker is still eligible to pick it up (§4.4 steps 1-3).
pub async fn report_task_failure(
    conn: &mut SqliteConnection,
    task_id: Id,
    worker_id: Id,
    blocklist_threshold: u64,
    soft_fail_threshold: u64,
) -> flamenco_core::Result<Vec<Event>> {
    let (task, _job_uuid, _worker_uuid) = flamenco_storage::fetch_task_by_id(conn, task_id).await?;
    let job = flamenco_storage::fetch_job_by_id(conn, task.job_id).await?;

    flamenco_storage::add_worker_to_task_failed_list(conn, task_id, worker_id).await?;

    let failures_on_job =
        flamenco_storage::count_task_failures_of_worker(conn, task.job_id, worker_id, &task.task_type)
            .await?;
    if failures_on_job >= blocklist_threshold {
        flamenco_storage::add_worker_to_job_blocklist(conn, task.job_id, worker_id, &task.task_type)
            .await?;
    }

    let distinct_failures = flamenco_storage::count_distinct_failed_workers(conn, task_id).await?;
    let workers_left =
        workers_left_to_run(conn, task.job_id, &task.task_type, job.worker_tag).await?;

    let (new_status, activity) = if distinct_failures >= soft_fail_threshold || workers_left.is_empty() {
        (TaskStatus::Failed, "Task failed: no workers left to retry it".to_string())
    } else {
        (
            TaskStatus::SoftFailed,
            format!("Task failed on one worker, {} worker(s) may still retry it", workers_left.len()),
        )
    };

    state_machine::change_task_status(conn, task_id, new_status, &activity).await
}

/// `WorkersLeftToRun(job, taskType)` (§4.4): workers that support
/// `taskType`, are not blocklisted for this `(job, task-type)`, and, if the
/// job has a tag, are members of it.
pub async fn workers_left_to_run(
    conn: &mut SqliteConnection,
    job_id: Id,
    task_type: &str,
    worker_tag: Option<Id>,
) -> flamenco_core::Result<Vec<uuid::Uuid>> {
    flamenco_storage::workers_left_to_run(conn, job_id, task_type, worker_tag).await
}

/// `RequeueActiveTasksOfWorker(worker, reason)` (§4.4): every task this
/// worker currently holds `active` is queued (or paused, if its job is
/// paused/pause-requested), with an activity string explaining why.
pub async fn requeue_active_tasks_of_worker(
    conn: &mut SqliteConnection,
    worker_id: Id,
    reason: &str,
) -> flamenco_core::Result<Vec<Event>> {
    let tasks = flamenco_storage::fetch_active_tasks_of_worker(conn, worker_id).await?;
    let mut events = Vec::new();

    for task in tasks {
        let job = flamenco_storage::fetch_job_by_id(conn, task.job_id).await?;
        let target_status = if matches!(
            job.status,
            flamenco_core::JobStatus::Paused | flamenco_core::JobStatus::PauseRequested
        ) {
            TaskStatus::Paused
        } else {
            TaskStatus::Queued
        };

        let verb = if target_status == TaskStatus::Paused { "paused" } else { "queued" };
        let activity = format!("Task was {verb} by Manager because {reason}");

        events.extend(state_machine::change_task_status(conn, task.id, target_status, &activity).await?);
    }

    Ok(events)
}
