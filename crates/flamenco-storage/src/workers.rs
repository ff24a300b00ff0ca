use chrono::{DateTime, Utc};
use flamenco_core::{Error, Id, NotFoundKind, StatusHistogram, Worker, WorkerStatus, WorkerTag};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::rows::{histogram, parse_json, parse_status, parse_uuid};

const ALL_WORKER_STATUSES: &[WorkerStatus] = &[
    WorkerStatus::Awake,
    WorkerStatus::Asleep,
    WorkerStatus::Offline,
    WorkerStatus::Error,
];

fn worker_from_row(row: SqliteRow) -> flamenco_core::Result<Worker> {
    let requested_status: Option<&str> = row.try_get("requested_status")?;
    Ok(Worker {
        id: row.try_get("id")?,
        uuid: parse_uuid(row.try_get("uuid")?)?,
        secret: row.try_get("secret")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        platform: row.try_get("platform")?,
        software: row.try_get("software")?,
        last_seen_at: row.try_get("last_seen_at")?,
        supported_task_types: parse_json(row.try_get("supported_task_types")?)?,
        status: parse_status(row.try_get("status")?)?,
        requested_status: requested_status.map(parse_status).transpose()?,
        lazy_status_request: row.try_get::<i64, _>("lazy_status_request")? != 0,
        can_restart: row.try_get::<i64, _>("can_restart")? != 0,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tag_from_row(row: SqliteRow) -> flamenco_core::Result<WorkerTag> {
    Ok(WorkerTag {
        id: row.try_get("id")?,
        uuid: parse_uuid(row.try_get("uuid")?)?,
        name: row.try_get("name")?,
    })
}

/// Create a worker on first sign-on (§3 "Lifecycles").
pub async fn create_worker(
    conn: &mut SqliteConnection,
    uuid: Uuid,
    secret: &str,
    name: &str,
    supported_task_types: &[String],
) -> flamenco_core::Result<Worker> {
    let now = Utc::now();
    let types_json = serde_json::to_string(supported_task_types)
        .map_err(|e| Error::internal(anyhow::Error::new(e)))?;

    let id: Id = sqlx::query(
        r#"
        INSERT INTO workers (uuid, secret, name, supported_task_types, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(uuid.to_string())
    .bind(secret)
    .bind(name)
    .bind(types_json)
    .bind(WorkerStatus::Awake.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?
    .try_get("id")?;

    fetch_worker_by_id(conn, id).await
}

pub async fn fetch_worker(conn: &mut SqliteConnection, uuid: Uuid) -> flamenco_core::Result<Worker> {
    let row = sqlx::query("SELECT * FROM workers WHERE uuid = ?")
        .bind(uuid.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(NotFoundKind::Worker, uuid))?;
    worker_from_row(row)
}

pub async fn fetch_worker_by_id(conn: &mut SqliteConnection, id: Id) -> flamenco_core::Result<Worker> {
    let row = sqlx::query("SELECT * FROM workers WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(NotFoundKind::Worker, id))?;
    worker_from_row(row)
}

/// All workers, excluding those soft-deleted, ordered by name.
pub async fn fetch_workers(conn: &mut SqliteConnection) -> flamenco_core::Result<Vec<Worker>> {
    let rows = sqlx::query("SELECT * FROM workers WHERE deleted_at IS NULL ORDER BY name ASC")
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(worker_from_row).collect()
}

pub async fn fetch_worker_tags(conn: &mut SqliteConnection) -> flamenco_core::Result<Vec<WorkerTag>> {
    let rows = sqlx::query("SELECT * FROM worker_tags ORDER BY name ASC")
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(tag_from_row).collect()
}

/// Whether `worker_id` is a member of `tag_id`.
pub async fn worker_has_tag(
    conn: &mut SqliteConnection,
    worker_id: Id,
    tag_id: Id,
) -> flamenco_core::Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM worker_tag_members WHERE worker_id = ? AND worker_tag_id = ?",
    )
    .bind(worker_id)
    .bind(tag_id)
    .fetch_one(&mut *conn)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n > 0)
}

pub async fn save_worker_status(
    conn: &mut SqliteConnection,
    worker_id: Id,
    status: WorkerStatus,
) -> flamenco_core::Result<()> {
    let result = sqlx::query(
        "UPDATE workers SET status = ?, requested_status = NULL, lazy_status_request = 0, \
         updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(worker_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Worker, worker_id));
    }

    Ok(())
}

/// Record a status the worker should transition to once it next checks in,
/// rather than immediately — the "transient requested analogues" from the
/// glossary's `WorkerStatus` entry.
pub async fn request_worker_status(
    conn: &mut SqliteConnection,
    worker_id: Id,
    requested: WorkerStatus,
    lazy: bool,
) -> flamenco_core::Result<()> {
    let result = sqlx::query(
        "UPDATE workers SET requested_status = ?, lazy_status_request = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(requested.as_str())
    .bind(lazy)
    .bind(Utc::now())
    .bind(worker_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Worker, worker_id));
    }

    Ok(())
}

pub async fn touch_worker_seen(
    conn: &mut SqliteConnection,
    worker_id: Id,
    address: Option<&str>,
) -> flamenco_core::Result<()> {
    let result = sqlx::query(
        "UPDATE workers SET last_seen_at = ?, address = COALESCE(?, address) WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(address)
    .bind(worker_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Worker, worker_id));
    }

    Ok(())
}

/// Non-excluded workers (status not `offline`/`error`) whose `last_seen_at`
/// is before `deadline` — the candidate set for the timeout detector's
/// worker pass (§4.5).
pub async fn fetch_stale_workers(
    conn: &mut SqliteConnection,
    deadline: DateTime<Utc>,
) -> flamenco_core::Result<Vec<Worker>> {
    let rows = sqlx::query(
        "SELECT * FROM workers \
         WHERE deleted_at IS NULL AND status NOT IN ('offline', 'error') \
           AND last_seen_at IS NOT NULL AND last_seen_at < ? \
         ORDER BY id ASC",
    )
    .bind(deadline)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(worker_from_row).collect()
}

pub async fn soft_delete_worker(conn: &mut SqliteConnection, worker_id: Id) -> flamenco_core::Result<()> {
    let result = sqlx::query("UPDATE workers SET deleted_at = ?, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(worker_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(NotFoundKind::Worker, worker_id));
    }

    Ok(())
}

pub async fn summarize_worker_statuses(
    conn: &mut SqliteConnection,
) -> flamenco_core::Result<StatusHistogram<WorkerStatus>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM workers WHERE deleted_at IS NULL GROUP BY status",
    )
    .fetch_all(&mut *conn)
    .await?;
    histogram(rows, ALL_WORKER_STATUSES)
}
