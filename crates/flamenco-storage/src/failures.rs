use chrono::Utc;
use flamenco_core::{Id, TaskFailure};
use sqlx::{Row, SqliteConnection};

use crate::rows::parse_uuid;

/// Record that `worker_id` failed `task_id`. Idempotent: a second call for
/// the same pair leaves the failure list unchanged (§8 round-trips).
pub async fn add_worker_to_task_failed_list(
    conn: &mut SqliteConnection,
    task_id: Id,
    worker_id: Id,
) -> flamenco_core::Result<()> {
    sqlx::query(
        "INSERT INTO task_failures (task_id, worker_id, created_at) VALUES (?, ?, ?) \
         ON CONFLICT (task_id, worker_id) DO NOTHING",
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn clear_failure_list_of_task(
    conn: &mut SqliteConnection,
    task_id: Id,
) -> flamenco_core::Result<()> {
    sqlx::query("DELETE FROM task_failures WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Clear the failure list of every task belonging to `job_id`, used by
/// job-wide requeue (§4.3).
pub async fn clear_failure_list_of_job(
    conn: &mut SqliteConnection,
    job_id: Id,
) -> flamenco_core::Result<()> {
    sqlx::query(
        "DELETE FROM task_failures WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?)",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_task_failure_list(
    conn: &mut SqliteConnection,
    task_id: Id,
) -> flamenco_core::Result<Vec<TaskFailure>> {
    let rows = sqlx::query("SELECT * FROM task_failures WHERE task_id = ? ORDER BY created_at ASC")
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter()
        .map(|row| {
            Ok(TaskFailure {
                task_id: row.try_get("task_id")?,
                worker_id: row.try_get("worker_id")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Whether `worker_id` already appears in `task_id`'s failure list —
/// backs the failure-list-respect invariant (§8).
pub async fn worker_in_task_failure_list(
    conn: &mut SqliteConnection,
    task_id: Id,
    worker_id: Id,
) -> flamenco_core::Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM task_failures WHERE task_id = ? AND worker_id = ?",
    )
    .bind(task_id)
    .bind(worker_id)
    .fetch_one(&mut *conn)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n > 0)
}

/// Number of distinct workers in `task_id`'s failure list — the `k` from
/// §4.4 step 3 used to decide soft- vs. hard-failure.
pub async fn count_distinct_failed_workers(
    conn: &mut SqliteConnection,
    task_id: Id,
) -> flamenco_core::Result<u64> {
    let row = sqlx::query("SELECT COUNT(DISTINCT worker_id) AS n FROM task_failures WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(&mut *conn)
        .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n.max(0) as u64)
}

/// Failure count of `worker_id` across every task of type `task_type`
/// inside `job_id` — the `n` from §4.4 step 2 used to decide blocklisting.
pub async fn count_task_failures_of_worker(
    conn: &mut SqliteConnection,
    job_id: Id,
    worker_id: Id,
    task_type: &str,
) -> flamenco_core::Result<u64> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS n
          FROM task_failures tf
          JOIN tasks t ON t.id = tf.task_id
         WHERE t.job_id = ? AND tf.worker_id = ? AND t.task_type = ?
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(task_type)
    .fetch_one(&mut *conn)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n.max(0) as u64)
}

/// Uuids of workers that failed `task_id`, used by the scheduler to
/// exclude them from the feasible set without a join for every candidate.
pub async fn fetch_task_failure_worker_uuids(
    conn: &mut SqliteConnection,
    task_id: Id,
) -> flamenco_core::Result<Vec<uuid::Uuid>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT w.uuid FROM task_failures tf JOIN workers w ON w.id = tf.worker_id \
         WHERE tf.task_id = ?",
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(|(uuid,)| parse_uuid(&uuid)).collect()
}
