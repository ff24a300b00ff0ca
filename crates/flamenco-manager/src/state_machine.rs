//! Task State Machine (§4.3).
//!
//! [`change_task_status`] is the only way a task's status should change: it
//! validates the transition, writes the new task row, and re-evaluates the
//! owning job. Every function here takes an already-open connection so the
//! caller controls the transaction boundary; events are returned rather
//! than broadcast directly, since a broker broadcast must only happen after
//! the transaction that produced it commits (§2, §9).

use flamenco_core::{Error, Id, JobStatus, StatusHistogram, TaskStatus};
use sqlx::SqliteConnection;

use crate::event::{self, Event};

fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    match (from, to) {
        (Queued, Active) => true,
        // §4.2's schedulable set is `{queued, soft-failed}`: a soft-failed
        // task is reassigned to a different worker the same way a queued
        // one is, without an intervening requeue.
        (SoftFailed, Active) => true,
        (Active, Completed) => true,
        (Active, Failed) => true,
        (Active, SoftFailed) => true,
        // Worker sign-off/timeout requeues an active task straight back to
        // queued, without passing through soft-failed (§4.4).
        (Active, Queued) => true,
        (SoftFailed, Queued) => true,
        (_, Canceled) => true,
        (from, Paused) => from.is_runnable_for_pause(),
        (Paused, Queued) => true,
        _ => false,
    }
}

/// Transition `task_id` to `new_status`, writing `activity`, then
/// re-evaluate its owning job. Returns the events that the caller should
/// broadcast once the enclosing transaction commits.
pub async fn change_task_status(
    conn: &mut SqliteConnection,
    task_id: Id,
    new_status: TaskStatus,
    activity: &str,
) -> flamenco_core::Result<Vec<Event>> {
    let (task, job_uuid, _worker_uuid) = flamenco_storage::fetch_task_by_id(conn, task_id).await?;

    if !is_transition_allowed(task.status, new_status) {
        return Err(Error::validation(format!(
            "cannot transition task from {} to {new_status}",
            task.status
        )));
    }

    flamenco_storage::update_task_status(conn, task_id, new_status, activity).await?;

    let mut events = vec![event::task_update(
        task.uuid,
        job_uuid,
        new_status,
        activity.to_string(),
    )];
    events.extend(reevaluate_job(conn, task.job_id).await?);

    Ok(events)
}

/// Update a task's `steps_completed`, recompute the job's totals, and
/// report a task-update event for the new progress.
pub async fn update_task_progress(
    conn: &mut SqliteConnection,
    task_id: Id,
    steps_completed: i64,
) -> flamenco_core::Result<Vec<Event>> {
    let (task, job_uuid, _worker_uuid) = flamenco_storage::fetch_task_by_id(conn, task_id).await?;
    flamenco_storage::update_task_steps_completed(conn, task_id, steps_completed).await?;

    Ok(vec![event::task_update(
        task.uuid,
        job_uuid,
        task.status,
        task.activity,
    )])
}

/// Recompute `job_id`'s status from its current task-status histogram
/// (§4.3 "job re-evaluation") and persist it if anything changed.
pub async fn reevaluate_job(
    conn: &mut SqliteConnection,
    job_id: Id,
) -> flamenco_core::Result<Vec<Event>> {
    let job = flamenco_storage::fetch_job_by_id(conn, job_id).await?;
    let histogram = flamenco_storage::summarize_task_statuses(conn, job_id).await?;

    let new_status = resolve_job_status(&histogram, job.status);
    let activity = describe_job_activity(new_status, &histogram);

    flamenco_storage::save_job_status(conn, job_id, new_status, &activity).await?;

    Ok(vec![event::job_update(
        job.uuid,
        job.name,
        new_status,
        activity,
    )])
}

/// Job re-evaluation precedence from §4.3: first rule that matches wins.
pub fn resolve_job_status(histogram: &StatusHistogram<TaskStatus>, current: JobStatus) -> JobStatus {
    let total: u64 = histogram.values().sum();
    if total == 0 {
        return current;
    }

    let get = |status: TaskStatus| *histogram.get(&status).unwrap_or(&0);
    let active = get(TaskStatus::Active);
    let failed = get(TaskStatus::Failed);
    let queued = get(TaskStatus::Queued);
    let soft_failed = get(TaskStatus::SoftFailed);
    let completed = get(TaskStatus::Completed);
    let canceled = get(TaskStatus::Canceled);

    if active > 0 {
        JobStatus::Active
    } else if failed > 0 && queued == 0 && soft_failed == 0 {
        JobStatus::Failed
    } else if completed == total {
        JobStatus::Completed
    } else if canceled > 0 && canceled + completed == total {
        JobStatus::Canceled
    } else if queued > 0 || soft_failed > 0 {
        match current {
            JobStatus::Requeueing => JobStatus::Queued,
            JobStatus::CancelRequested => JobStatus::Canceled,
            other => other,
        }
    } else {
        current
    }
}

fn describe_job_activity(status: JobStatus, histogram: &StatusHistogram<TaskStatus>) -> String {
    let total: u64 = histogram.values().sum();
    let completed = *histogram.get(&TaskStatus::Completed).unwrap_or(&0);

    match status {
        JobStatus::Completed => "all tasks completed".to_string(),
        JobStatus::Failed => "one or more tasks failed and no tasks remain runnable".to_string(),
        JobStatus::Canceled => "all tasks canceled or completed".to_string(),
        _ => format!("{completed} of {total} tasks completed"),
    }
}

/// Requeue of an entire job (§4.3): move tasks from `from_statuses` back to
/// `queued`, clear the job's blocklist and per-task failure lists, then
/// re-evaluate. `from_statuses` names the tail set the operator intends to
/// give another chance, e.g. `{failed, soft-failed, canceled, completed}`.
pub async fn requeue_job(
    conn: &mut SqliteConnection,
    job_id: Id,
    from_statuses: &[TaskStatus],
) -> flamenco_core::Result<Vec<Event>> {
    flamenco_storage::update_jobs_task_statuses_conditional(
        conn,
        job_id,
        from_statuses,
        TaskStatus::Queued,
        "Requeued by Manager",
    )
    .await?;
    flamenco_storage::clear_job_blocklist(conn, job_id).await?;
    flamenco_storage::clear_failure_list_of_job(conn, job_id).await?;

    reevaluate_job(conn, job_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn histogram(pairs: &[(TaskStatus, u64)]) -> StatusHistogram<TaskStatus> {
        let mut map = HashMap::new();
        for (status, count) in pairs {
            map.insert(*status, *count);
        }
        map
    }

    #[test]
    fn any_active_task_makes_job_active() {
        let h = histogram(&[(TaskStatus::Active, 1), (TaskStatus::Queued, 2)]);
        assert_eq!(resolve_job_status(&h, JobStatus::Queued), JobStatus::Active);
    }

    #[test]
    fn failed_with_nothing_runnable_fails_the_job() {
        let h = histogram(&[(TaskStatus::Failed, 1), (TaskStatus::Completed, 2)]);
        assert_eq!(resolve_job_status(&h, JobStatus::Active), JobStatus::Failed);
    }

    #[test]
    fn failed_with_queued_remaining_does_not_fail_the_job() {
        let h = histogram(&[(TaskStatus::Failed, 1), (TaskStatus::Queued, 1)]);
        assert_eq!(resolve_job_status(&h, JobStatus::Active), JobStatus::Active);
    }

    #[test]
    fn all_completed_completes_the_job() {
        let h = histogram(&[(TaskStatus::Completed, 3)]);
        assert_eq!(resolve_job_status(&h, JobStatus::Active), JobStatus::Completed);
    }

    #[test]
    fn canceled_and_completed_mix_cancels_the_job() {
        let h = histogram(&[(TaskStatus::Canceled, 1), (TaskStatus::Completed, 2)]);
        assert_eq!(resolve_job_status(&h, JobStatus::CancelRequested), JobStatus::Canceled);
    }

    #[test]
    fn requeueing_normalises_to_queued_once_nothing_is_active() {
        let h = histogram(&[(TaskStatus::Queued, 3)]);
        assert_eq!(resolve_job_status(&h, JobStatus::Requeueing), JobStatus::Queued);
    }

    #[test]
    fn all_paused_leaves_job_status_unchanged() {
        let h = histogram(&[(TaskStatus::Paused, 3)]);
        assert_eq!(resolve_job_status(&h, JobStatus::Paused), JobStatus::Paused);
    }

    #[test]
    fn transition_table_matches_spec() {
        assert!(is_transition_allowed(TaskStatus::Queued, TaskStatus::Active));
        assert!(is_transition_allowed(TaskStatus::Active, TaskStatus::Completed));
        assert!(is_transition_allowed(TaskStatus::Active, TaskStatus::Failed));
        assert!(is_transition_allowed(TaskStatus::Active, TaskStatus::SoftFailed));
        assert!(is_transition_allowed(TaskStatus::SoftFailed, TaskStatus::Queued));
        assert!(is_transition_allowed(TaskStatus::SoftFailed, TaskStatus::Active));
        assert!(is_transition_allowed(TaskStatus::Active, TaskStatus::Queued));
        assert!(is_transition_allowed(TaskStatus::Paused, TaskStatus::Queued));
        assert!(is_transition_allowed(TaskStatus::Active, TaskStatus::Canceled));
        assert!(!is_transition_allowed(TaskStatus::Completed, TaskStatus::Paused));
        assert!(!is_transition_allowed(TaskStatus::Queued, TaskStatus::Completed));
    }
}
