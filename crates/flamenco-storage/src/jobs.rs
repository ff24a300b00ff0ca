use chrono::{DateTime, Utc};
use flamenco_core::{AuthoredJob, Error, Job, JobStatus, NotFoundKind, StatusHistogram};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::rows::{histogram, parse_json, parse_status, parse_uuid};

const ALL_JOB_STATUSES: &[JobStatus] = &[
    JobStatus::UnderConstruction,
    JobStatus::Queued,
    JobStatus::Active,
    JobStatus::Paused,
    JobStatus::PauseRequested,
    JobStatus::CancelRequested,
    JobStatus::Canceled,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Requeueing,
];

fn job_from_row(row: SqliteRow) -> flamenco_core::Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        uuid: parse_uuid(row.try_get("uuid")?)?,
        name: row.try_get("name")?,
        job_type: row.try_get("job_type")?,
        priority: row.try_get("priority")?,
        status: parse_status(row.try_get("status")?)?,
        activity: row.try_get("activity")?,
        settings: parse_json(row.try_get("settings")?)?,
        metadata: parse_json(row.try_get("metadata")?)?,
        worker_tag: row.try_get("worker_tag")?,
        delete_requested_at: row.try_get("delete_requested_at")?,
        steps_total: row.try_get("steps_total")?,
        steps_completed: row.try_get("steps_completed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Atomically persist an authored job (job + tasks + dependencies).
///
/// Tasks are inserted in the order given; `AuthoredTask::local_id` indices
/// are resolved against that order to populate `task_dependencies`. Cycles
/// are rejected with a validation error rather than silently accepted,
/// because the scheduler's dependency check would otherwise be able to spin
/// forever waiting for a task to complete that can never run (§9).
pub async fn store_authored_job(
    conn: &mut SqliteConnection,
    authored: &AuthoredJob,
) -> flamenco_core::Result<Job> {
    if has_cycle(authored) {
        return Err(Error::validation(
            "task dependency graph contains a cycle",
        ));
    }

    let now = Utc::now();
    let job = &authored.job;

    let job_id: i64 = sqlx::query(
        r#"
        INSERT INTO jobs (uuid, name, job_type, priority, status, activity, settings, metadata,
                           worker_tag, steps_total, steps_completed, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, '', ?, ?, ?, 0, 0, ?, ?)
        RETURNING id
        "#,
    )
    .bind(job.uuid.to_string())
    .bind(&job.name)
    .bind(&job.job_type)
    .bind(job.priority)
    .bind(job.status.as_str())
    .bind(job.settings.to_string())
    .bind(job.metadata.to_string())
    .bind(job.worker_tag)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?
    .try_get("id")?;

    let mut task_ids = Vec::with_capacity(authored.tasks.len());
    let mut steps_total = 0i64;

    for task in &authored.tasks {
        let commands_json = serde_json::to_string(&task.commands)
            .map_err(|e| Error::internal(anyhow::Error::new(e)))?;
        let task_steps: i64 = task.commands.iter().map(|c| c.total_steps).sum();
        steps_total += task_steps;

        let task_id: i64 = sqlx::query(
            r#"
            INSERT INTO tasks (uuid, job_id, name, task_type, priority, task_index, status,
                                activity, commands, steps_total, steps_completed, created_at,
                                updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, '', ?, ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task.uuid.to_string())
        .bind(job_id)
        .bind(&task.name)
        .bind(&task.task_type)
        .bind(task.priority)
        .bind(task.index)
        .bind(JobTaskStartStatus::for_job(job.status).as_str())
        .bind(commands_json)
        .bind(task_steps)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?
        .try_get("id")?;

        task_ids.push(task_id);
    }

    for dep in &authored.dependencies {
        sqlx::query("INSERT INTO task_dependencies (task_id, dependency_id) VALUES (?, ?)")
            .bind(task_ids[dep.task])
            .bind(task_ids[dep.dependency])
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("UPDATE jobs SET steps_total = ? WHERE id = ?")
        .bind(steps_total)
        .bind(job_id)
        .execute(&mut *conn)
        .await?;

    fetch_job_by_id(conn, job_id).await
}

/// Tasks of an under-construction job start `queued` just like any other;
/// the job-compiler is responsible for choosing the job's own starting
/// status (§3 "Lifecycles").
struct JobTaskStartStatus;
impl JobTaskStartStatus {
    fn for_job(_status: JobStatus) -> flamenco_core::TaskStatus {
        flamenco_core::TaskStatus::Queued
    }
}

fn has_cycle(authored: &AuthoredJob) -> bool {
    let n = authored.tasks.len();
    let mut adj = vec![Vec::new(); n];
    for dep in &authored.dependencies {
        // task depends on dependency: dependency must run first, i.e. edge
        // dependency -> task in the "must happen before" DAG.
        adj[dep.dependency].push(dep.task);
    }

    #[derive(Copy, Clone, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let mut marks = vec![Mark::Unvisited; n];

    fn visit(u: usize, adj: &[Vec<usize>], marks: &mut [Mark]) -> bool {
        match marks[u] {
            Mark::Done => return false,
            Mark::InProgress => return true,
            Mark::Unvisited => {}
        }
        marks[u] = Mark::InProgress;
        for &v in &adj[u] {
            if visit(v, adj, marks) {
                return true;
            }
        }
        marks[u] = Mark::Done;
        false
    }

    (0..n).any(|u| marks[u] == Mark::Unvisited && visit(u, &adj, &mut marks))
}

pub async fn fetch_job(conn: &mut SqliteConnection, uuid: Uuid) -> flamenco_core::Result<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE uuid = ?")
        .bind(uuid.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(NotFoundKind::Job, uuid))?;
    job_from_row(row)
}

pub async fn fetch_job_by_id(conn: &mut SqliteConnection, id: i64) -> flamenco_core::Result<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(NotFoundKind::Job, id))?;
    job_from_row(row)
}

pub async fn fetch_jobs(conn: &mut SqliteConnection) -> flamenco_core::Result<Vec<Job>> {
    let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at ASC")
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(job_from_row).collect()
}

pub async fn fetch_jobs_in_status(
    conn: &mut SqliteConnection,
    statuses: &[JobStatus],
) -> flamenco_core::Result<Vec<Job>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("SELECT * FROM jobs WHERE status IN ({placeholders}) ORDER BY created_at ASC");
    let mut query = sqlx::query(&sql);
    for status in statuses {
        query = query.bind(status.as_str());
    }

    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(job_from_row).collect()
}

/// Delete a job and everything that cascades from it. Refuses if foreign
/// keys are not enforced on this connection (§7 "refusing to delete
/// without referential cascade") — `Store::connect` always turns them on,
/// so this is primarily a defense against a connection opened incorrectly.
pub async fn delete_job(conn: &mut SqliteConnection, uuid: Uuid) -> flamenco_core::Result<()> {
    let enforced: i64 = sqlx::query("PRAGMA foreign_keys")
        .fetch_one(&mut *conn)
        .await?
        .try_get(0)?;
    if enforced == 0 {
        return Err(Error::integrity(
            flamenco_core::IntegrityKind::Cascade,
            "refusing to delete without referential cascade enabled",
        ));
    }

    let result = sqlx::query("DELETE FROM jobs WHERE uuid = ?")
        .bind(uuid.to_string())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Job, uuid));
    }

    Ok(())
}

/// Mark a job for deletion without deleting it. Re-requesting bumps the
/// timestamp but never duplicates anything, since this is a column update
/// rather than an insert (§8 idempotence).
pub async fn request_job_deletion(
    conn: &mut SqliteConnection,
    uuid: Uuid,
) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE jobs SET delete_requested_at = ? WHERE uuid = ?")
        .bind(Utc::now())
        .bind(uuid.to_string())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Job, uuid));
    }

    Ok(())
}

/// Mark every terminal job (`completed`, `failed`, `canceled`) last updated
/// before `older_than` for deletion, returning the affected UUIDs.
pub async fn request_job_mass_deletion(
    conn: &mut SqliteConnection,
    older_than: DateTime<Utc>,
) -> flamenco_core::Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        UPDATE jobs
           SET delete_requested_at = ?
         WHERE updated_at < ?
           AND status IN ('completed', 'failed', 'canceled')
        RETURNING uuid
        "#,
    )
    .bind(Utc::now())
    .bind(older_than)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| parse_uuid(row.try_get("uuid")?))
        .collect()
}

/// Update a job's status and activity string. Bumps `updated_at` (§4.3).
pub async fn save_job_status(
    conn: &mut SqliteConnection,
    job_id: i64,
    status: JobStatus,
    activity: &str,
) -> flamenco_core::Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET status = ?, activity = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(activity)
    .bind(Utc::now())
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Job, job_id));
    }

    Ok(())
}

pub async fn save_job_priority(
    conn: &mut SqliteConnection,
    job_id: i64,
    priority: i32,
) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE jobs SET priority = ?, updated_at = ? WHERE id = ?")
        .bind(priority)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Job, job_id));
    }

    Ok(())
}

/// Update job storage metadata (`settings`/`metadata`) *without* bumping
/// `updated_at`, so that batch maintenance tooling doesn't make jobs look
/// recently active (§4.3, §4.6's rationale for excluding this path).
pub async fn save_job_storage_info(
    conn: &mut SqliteConnection,
    job_id: i64,
    metadata: &serde_json::Value,
) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE jobs SET metadata = ? WHERE id = ?")
        .bind(metadata.to_string())
        .bind(job_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Job, job_id));
    }

    Ok(())
}

pub async fn summarize_job_statuses(
    conn: &mut SqliteConnection,
) -> flamenco_core::Result<StatusHistogram<JobStatus>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(&mut *conn)
            .await?;
    histogram(rows, ALL_JOB_STATUSES)
}
