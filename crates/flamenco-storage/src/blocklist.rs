use chrono::Utc;
use flamenco_core::{Id, JobBlock};
use sqlx::{Row, SqliteConnection};

use crate::rows::parse_uuid;

/// Insert `(job_id, worker_id, task_type)` into the blocklist. Idempotent
/// (§8 round-trips).
pub async fn add_worker_to_job_blocklist(
    conn: &mut SqliteConnection,
    job_id: Id,
    worker_id: Id,
    task_type: &str,
) -> flamenco_core::Result<()> {
    sqlx::query(
        "INSERT INTO job_blocks (job_id, worker_id, task_type, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (job_id, worker_id, task_type) DO NOTHING",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(task_type)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_job_blocklist(
    conn: &mut SqliteConnection,
    job_id: Id,
) -> flamenco_core::Result<Vec<JobBlock>> {
    let rows = sqlx::query("SELECT * FROM job_blocks WHERE job_id = ? ORDER BY created_at ASC")
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter()
        .map(|row| {
            Ok(JobBlock {
                job_id: row.try_get("job_id")?,
                worker_id: row.try_get("worker_id")?,
                task_type: row.try_get("task_type")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

pub async fn clear_job_blocklist(conn: &mut SqliteConnection, job_id: Id) -> flamenco_core::Result<()> {
    sqlx::query("DELETE FROM job_blocks WHERE job_id = ?")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn remove_from_job_blocklist(
    conn: &mut SqliteConnection,
    job_id: Id,
    worker_id: Id,
    task_type: &str,
) -> flamenco_core::Result<()> {
    sqlx::query("DELETE FROM job_blocks WHERE job_id = ? AND worker_id = ? AND task_type = ?")
        .bind(job_id)
        .bind(worker_id)
        .bind(task_type)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Whether `(job_id, worker_id, task_type)` is currently blocklisted —
/// backs the blocklist-respect invariant (§8).
pub async fn is_blocklisted(
    conn: &mut SqliteConnection,
    job_id: Id,
    worker_id: Id,
    task_type: &str,
) -> flamenco_core::Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM job_blocks WHERE job_id = ? AND worker_id = ? AND task_type = ?",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(task_type)
    .fetch_one(&mut *conn)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n > 0)
}

/// Uuids of workers that support `task_type`, are not blocklisted for
/// `(job_id, task_type)`, and, if `tag_id` is given, are members of that
/// tag (§4.4 `WorkersLeftToRun`). Soft-deleted workers never count as "left
/// to run"; a worker whose `supported_task_types` doesn't include this
/// type was never a candidate for it in the first place.
pub async fn workers_left_to_run(
    conn: &mut SqliteConnection,
    job_id: Id,
    task_type: &str,
    tag_id: Option<Id>,
) -> flamenco_core::Result<Vec<uuid::Uuid>> {
    let rows: Vec<(String,)> = if let Some(tag_id) = tag_id {
        sqlx::query_as(
            r#"
            SELECT w.uuid
              FROM workers w
              JOIN worker_tag_members wtm ON wtm.worker_id = w.id AND wtm.worker_tag_id = ?
             WHERE w.deleted_at IS NULL
               AND EXISTS (
                   SELECT 1 FROM json_each(w.supported_task_types) jt WHERE jt.value = ?
               )
               AND NOT EXISTS (
                   SELECT 1 FROM job_blocks jb
                    WHERE jb.job_id = ? AND jb.worker_id = w.id AND jb.task_type = ?
               )
            "#,
        )
        .bind(tag_id)
        .bind(task_type)
        .bind(job_id)
        .bind(task_type)
        .fetch_all(&mut *conn)
        .await?
    } else {
        sqlx::query_as(
            r#"
            SELECT w.uuid
              FROM workers w
             WHERE w.deleted_at IS NULL
               AND EXISTS (
                   SELECT 1 FROM json_each(w.supported_task_types) jt WHERE jt.value = ?
               )
               AND NOT EXISTS (
                   SELECT 1 FROM job_blocks jb
                    WHERE jb.job_id = ? AND jb.worker_id = w.id AND jb.task_type = ?
               )
            "#,
        )
        .bind(task_type)
        .bind(job_id)
        .bind(task_type)
        .fetch_all(&mut *conn)
        .await?
    };

    rows.into_iter().map(|(uuid,)| parse_uuid(&uuid)).collect()
}
