//! Task Scheduler (§4.2).

use flamenco_core::{Id, Task, TaskStatus};
use flamenco_storage::Store;

use crate::event::Event;
use crate::state_machine;

/// Find a runnable task for `worker_id` and atomically assign it, or
/// return `None` if nothing qualifies. The whole operation is one
/// read/write transaction (§4.2 "Concurrency"): two workers racing for the
/// same task can never both receive it.
///
/// On success, also returns the events the caller should broadcast once the
/// commit has gone through.
pub async fn assign_task(
    store: &Store,
    worker_id: Id,
) -> flamenco_core::Result<Option<(Task, Vec<Event>)>> {
    let mut txn = store.begin_write().await?;
    let conn = txn.conn();

    let worker = flamenco_storage::fetch_worker_by_id(conn, worker_id).await?;

    let (task_id, events) = match flamenco_storage::find_resume_task(conn, worker_id).await? {
        Some(task) => (task.id, Vec::new()),
        None => match flamenco_storage::find_schedulable_task(conn, &worker).await? {
            Some(task) => {
                flamenco_storage::assign_task_to_worker(conn, task.id, worker_id).await?;
                let events = state_machine::change_task_status(
                    conn,
                    task.id,
                    TaskStatus::Active,
                    "Task picked up by Worker",
                )
                .await?;
                (task.id, events)
            }
            None => {
                txn.commit().await?;
                return Ok(None);
            }
        },
    };

    let (task, _job_uuid, _worker_uuid) = flamenco_storage::fetch_task_by_id(conn, task_id).await?;
    txn.commit().await?;

    Ok(Some((task, events)))
}
