use flamenco_core::{Id, Task, Worker};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::rows::{parse_json, parse_status, parse_uuid};

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

/// §4.2 step 2, the resume case: a task this worker already holds `active`
/// whose job is still in a runnable status. Lets a crashed-and-reconnected
/// worker pick up exactly where it left off instead of being handed
/// something new while the old assignment lingers.
pub async fn find_resume_task(
    conn: &mut SqliteConnection,
    worker_id: Id,
) -> flamenco_core::Result<Option<Task>> {
    let row = sqlx::query(
        r#"
        SELECT t.* FROM tasks t
          JOIN jobs j ON j.id = t.job_id
         WHERE t.worker_id = ? AND t.status = 'active' AND j.status IN ('queued', 'active')
         ORDER BY t.id ASC
         LIMIT 1
        "#,
    )
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(task_from_row).transpose()
}

/// §4.2 step 3, the schedule case: the single best feasible task for
/// `worker`, ordered by `(job.priority DESC, task.priority DESC)` with
/// ties broken by ascending task id so the choice is deterministic within
/// a transaction.
pub async fn find_schedulable_task(
    conn: &mut SqliteConnection,
    worker: &Worker,
) -> flamenco_core::Result<Option<Task>> {
    if worker.supported_task_types.is_empty() {
        return Ok(None);
    }

    let type_placeholders = worker
        .supported_task_types
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        r#"
        SELECT t.* FROM tasks t
          JOIN jobs j ON j.id = t.job_id
         WHERE t.status IN ('queued', 'soft-failed')
           AND j.status IN ('queued', 'active')
           AND t.task_type IN ({type_placeholders})
           AND NOT EXISTS (
               SELECT 1 FROM task_failures tf
                WHERE tf.task_id = t.id AND tf.worker_id = ?
           )
           AND NOT EXISTS (
               SELECT 1 FROM job_blocks jb
                WHERE jb.job_id = j.id AND jb.worker_id = ? AND jb.task_type = t.task_type
           )
           AND NOT EXISTS (
               SELECT 1 FROM task_dependencies td
                JOIN tasks dep ON dep.id = td.dependency_id
               WHERE td.task_id = t.id AND dep.status <> 'completed'
           )
           AND (
               j.worker_tag IS NULL
               OR EXISTS (
                   SELECT 1 FROM worker_tag_members wtm
                    WHERE wtm.worker_tag_id = j.worker_tag AND wtm.worker_id = ?
               )
           )
         ORDER BY j.priority DESC, t.priority DESC, t.id ASC
         LIMIT 1
        "#
    );

    let mut query = sqlx::query(&sql);
    for task_type in &worker.supported_task_types {
        query = query.bind(task_type);
    }
    query = query.bind(worker.id).bind(worker.id).bind(worker.id);

    let row = query.fetch_optional(&mut *conn).await?;
    row.map(task_from_row).transpose()
}
