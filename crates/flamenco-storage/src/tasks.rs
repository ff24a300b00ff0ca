use chrono::{DateTime, Utc};
use flamenco_core::{Error, Id, NotFoundKind, StatusHistogram, Task, TaskStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::rows::{histogram, parse_json, parse_status, parse_uuid};

const ALL_TASK_STATUSES: &[TaskStatus] = &[
    TaskStatus::Queued,
    TaskStatus::Active,
    TaskStatus::SoftFailed,
    TaskStatus::Failed,
    TaskStatus::Canceled,
    TaskStatus::Paused,
    TaskStatus::Completed,
];

fn task_from_row(row: SqliteRow) -> flamenco_core::Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        uuid: parse_uuid(row.try_get("uuid")?)?,
        job_id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        task_type: row.try_get("task_type")?,
        priority: row.try_get("priority")?,
        index: row.try_get("task_index")?,
        status: parse_status(row.try_get("status")?)?,
        activity: row.try_get("activity")?,
        worker_id: row.try_get("worker_id")?,
        last_touched_at: row.try_get("last_touched_at")?,
        commands: parse_json(row.try_get("commands")?)?,
        steps_total: row.try_get("steps_total")?,
        steps_completed: row.try_get("steps_completed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Fetch a task along with the UUIDs of its owning job and (if assigned)
/// worker, matching the `(task, jobUUID, workerUUID)` shape of `FetchTask`
/// from §4.1.
pub async fn fetch_task(
    conn: &mut SqliteConnection,
    uuid: Uuid,
) -> flamenco_core::Result<(Task, Uuid, Option<Uuid>)> {
    let row = sqlx::query("SELECT * FROM tasks WHERE uuid = ?")
        .bind(uuid.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(NotFoundKind::Task, uuid))?;
    let task = task_from_row(row)?;
    resolve_task_uuids(conn, task).await
}

pub async fn fetch_task_by_id(
    conn: &mut SqliteConnection,
    id: Id,
) -> flamenco_core::Result<(Task, Uuid, Option<Uuid>)> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(NotFoundKind::Task, id))?;
    let task = task_from_row(row)?;
    resolve_task_uuids(conn, task).await
}

async fn resolve_task_uuids(
    conn: &mut SqliteConnection,
    task: Task,
) -> flamenco_core::Result<(Task, Uuid, Option<Uuid>)> {
    let job_uuid: String = sqlx::query("SELECT uuid FROM jobs WHERE id = ?")
        .bind(task.job_id)
        .fetch_one(&mut *conn)
        .await?
        .try_get(0)?;
    let job_uuid = parse_uuid(&job_uuid)?;

    let worker_uuid = match task.worker_id {
        Some(worker_id) => {
            let uuid: String = sqlx::query("SELECT uuid FROM workers WHERE id = ?")
                .bind(worker_id)
                .fetch_one(&mut *conn)
                .await?
                .try_get(0)?;
            Some(parse_uuid(&uuid)?)
        }
        None => None,
    };

    Ok((task, job_uuid, worker_uuid))
}

pub async fn fetch_tasks_of_job(
    conn: &mut SqliteConnection,
    job_id: Id,
) -> flamenco_core::Result<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM tasks WHERE job_id = ? ORDER BY task_index ASC")
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(task_from_row).collect()
}

pub async fn fetch_tasks_in_status(
    conn: &mut SqliteConnection,
    job_id: Id,
    statuses: &[TaskStatus],
) -> flamenco_core::Result<Vec<Task>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT * FROM tasks WHERE job_id = ? AND status IN ({placeholders}) ORDER BY task_index ASC"
    );
    let mut query = sqlx::query(&sql).bind(job_id);
    for status in statuses {
        query = query.bind(status.as_str());
    }

    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(task_from_row).collect()
}

/// All tasks currently `active` and assigned to `worker_id`, across every
/// job. Used by `RequeueActiveTasksOfWorker` (§4.4) and worker sign-off.
pub async fn fetch_active_tasks_of_worker(
    conn: &mut SqliteConnection,
    worker_id: Id,
) -> flamenco_core::Result<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM tasks WHERE worker_id = ? AND status = 'active'")
        .bind(worker_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(task_from_row).collect()
}

/// All tasks with status `active` whose `last_touched_at` is at or before
/// `deadline` — the candidate set for the timeout detector's task pass
/// (§4.5).
pub async fn fetch_stale_active_tasks(
    conn: &mut SqliteConnection,
    deadline: DateTime<Utc>,
) -> flamenco_core::Result<Vec<Task>> {
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE status = 'active' AND last_touched_at <= ? ORDER BY id ASC",
    )
    .bind(deadline)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(task_from_row).collect()
}

/// Ids of `task_id`'s dependencies (prerequisite tasks).
pub async fn fetch_task_dependency_ids(
    conn: &mut SqliteConnection,
    task_id: Id,
) -> flamenco_core::Result<Vec<Id>> {
    let rows: Vec<(Id,)> =
        sqlx::query_as("SELECT dependency_id FROM task_dependencies WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Whether every dependency of `task_id` has status `completed` — the
/// per-task half of the scheduler's dependency-respect invariant (§8).
pub async fn dependencies_satisfied(
    conn: &mut SqliteConnection,
    task_id: Id,
) -> flamenco_core::Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS unmet
          FROM task_dependencies td
          JOIN tasks t ON t.id = td.dependency_id
         WHERE td.task_id = ? AND t.status <> 'completed'
        "#,
    )
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await?;
    let unmet: i64 = row.try_get("unmet")?;
    Ok(unmet == 0)
}

pub async fn update_task_status(
    conn: &mut SqliteConnection,
    task_id: Id,
    status: TaskStatus,
    activity: &str,
) -> flamenco_core::Result<()> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, activity = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(activity)
    .bind(Utc::now())
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Task, task_id));
    }

    Ok(())
}

pub async fn update_task_activity(
    conn: &mut SqliteConnection,
    task_id: Id,
    activity: &str,
) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE tasks SET activity = ?, updated_at = ? WHERE id = ?")
        .bind(activity)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Task, task_id));
    }

    Ok(())
}

/// Update a task's `steps_completed` and recompute the owning job's
/// `steps_total`/`steps_completed` in the same call, preserving the
/// step-count consistency invariant (§8).
pub async fn update_task_steps_completed(
    conn: &mut SqliteConnection,
    task_id: Id,
    steps_completed: i64,
) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE tasks SET steps_completed = ?, updated_at = ? WHERE id = ?")
        .bind(steps_completed)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Task, task_id));
    }

    let job_id: Id = sqlx::query("SELECT job_id FROM tasks WHERE id = ?")
        .bind(task_id)
        .fetch_one(&mut *conn)
        .await?
        .try_get("job_id")?;

    recompute_job_step_totals(conn, job_id).await
}

/// Sum `tasks.steps_total`/`steps_completed` for `job_id` back onto the
/// `jobs` row. Does not bump `updated_at`: step-count drift is routine
/// progress, not a status change worth surfacing as "recently touched".
pub async fn recompute_job_step_totals(
    conn: &mut SqliteConnection,
    job_id: Id,
) -> flamenco_core::Result<()> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(steps_total), 0) AS total, COALESCE(SUM(steps_completed), 0) AS done \
         FROM tasks WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_one(&mut *conn)
    .await?;
    let total: i64 = row.try_get("total")?;
    let done: i64 = row.try_get("done")?;

    sqlx::query("UPDATE jobs SET steps_total = ?, steps_completed = ? WHERE id = ?")
        .bind(total)
        .bind(done)
        .bind(job_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Assign `task_id` to `worker_id`, bumping both `updated_at` and
/// `last_touched_at` to now (§4.2 step 5).
pub async fn assign_task_to_worker(
    conn: &mut SqliteConnection,
    task_id: Id,
    worker_id: Id,
) -> flamenco_core::Result<()> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks SET worker_id = ?, updated_at = ?, last_touched_at = ? WHERE id = ?",
    )
    .bind(worker_id)
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Task, task_id));
    }

    Ok(())
}

/// Bump `last_touched_at` on a progress ping from the assigned worker.
pub async fn touch_task(conn: &mut SqliteConnection, task_id: Id) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE tasks SET last_touched_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Task, task_id));
    }

    Ok(())
}

/// Unconditionally set every task of `job_id` to `new_status`/`activity`.
pub async fn update_jobs_task_statuses(
    conn: &mut SqliteConnection,
    job_id: Id,
    new_status: TaskStatus,
    activity: &str,
) -> flamenco_core::Result<()> {
    sqlx::query("UPDATE tasks SET status = ?, activity = ?, updated_at = ? WHERE job_id = ?")
        .bind(new_status.as_str())
        .bind(activity)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Set tasks of `job_id` currently in one of `from_statuses` to
/// `new_status`/`activity`, leaving everything else untouched. This is the
/// primitive behind job-wide requeue (§4.3 "Requeue of an entire job").
pub async fn update_jobs_task_statuses_conditional(
    conn: &mut SqliteConnection,
    job_id: Id,
    from_statuses: &[TaskStatus],
    new_status: TaskStatus,
    activity: &str,
) -> flamenco_core::Result<u64> {
    if from_statuses.is_empty() {
        return Ok(0);
    }

    let placeholders = from_statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "UPDATE tasks SET status = ?, activity = ?, updated_at = ? \
         WHERE job_id = ? AND status IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql)
        .bind(new_status.as_str())
        .bind(activity)
        .bind(Utc::now())
        .bind(job_id);
    for status in from_statuses {
        query = query.bind(status.as_str());
    }

    let result = query.execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

pub async fn summarize_task_statuses(
    conn: &mut SqliteConnection,
    job_id: Id,
) -> flamenco_core::Result<StatusHistogram<TaskStatus>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE job_id = ? GROUP BY status")
            .bind(job_id)
            .fetch_all(&mut *conn)
            .await?;
    histogram(rows, ALL_TASK_STATUSES)
}
