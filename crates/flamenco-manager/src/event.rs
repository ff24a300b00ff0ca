//! The in-process event bus (§4.7).
//!
//! [`Broker`] holds an ordered list of registered [`Forwarder`]s. Each
//! forwarder gets its own bounded channel (depth 10); [`Broker::broadcast`]
//! is non-blocking and never waits on a slow forwarder, it only logs when a
//! forwarder's queue is full. Events are only ever broadcast after the
//! transaction that produced them has committed (§2, §5).
//!
//! Task-log lines are not part of this bus: they go through the external
//! Log Storage collaborator (§6) because they can be voluminous and bulk
//! transports should never see them.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flamenco_core::{FarmStatus, JobStatus, TaskStatus, WorkerStatus};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

const FORWARDER_QUEUE_DEPTH: usize = 10;

#[derive(Clone, Debug, Serialize)]
pub struct JobUpdate {
    pub uuid: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub activity: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskUpdate {
    pub uuid: Uuid,
    pub job_uuid: Uuid,
    pub status: TaskStatus,
    pub activity: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerUpdate {
    pub uuid: Uuid,
    pub name: String,
    pub status: WorkerStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerTagUpdate {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LastRenderedUpdate {
    pub job_uuid: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FarmStatusUpdate {
    pub status: FarmStatus,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Starting,
    GoingDown,
}

/// A strongly typed event published on the bus. Each variant knows its own
/// topic string(s) (§6 "Topic names").
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    JobUpdate(JobUpdate),
    TaskUpdate(TaskUpdate),
    WorkerUpdate(WorkerUpdate),
    WorkerTagUpdate(WorkerTagUpdate),
    LastRendered(LastRenderedUpdate),
    FarmStatus(FarmStatusUpdate),
    Lifecycle(LifecycleEvent),
}

impl Event {
    /// Every topic this event should be delivered on. Some events fan out
    /// to both a collection-wide topic and an entity-specific one.
    pub fn topics(&self) -> Vec<String> {
        match self {
            Event::JobUpdate(update) => vec!["/jobs".to_string(), format!("/jobs/{}", update.uuid)],
            Event::TaskUpdate(_) => vec!["/task".to_string()],
            Event::WorkerUpdate(_) => vec!["/workers".to_string()],
            Event::WorkerTagUpdate(_) => vec!["/workertags".to_string()],
            Event::LastRendered(update) => vec![
                "/last-rendered".to_string(),
                format!("/jobs/{}/last-rendered", update.job_uuid),
            ],
            Event::FarmStatus(_) => vec!["/subscription".to_string()],
            Event::Lifecycle(_) => vec!["/lifecycle".to_string()],
        }
    }
}

/// An external collaborator that the broker fans events out to: an MQTT
/// client, an in-process WebSocket hub, or any future transport (§6).
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send(&self, topic: &str, event: &Event) -> anyhow::Result<()>;
}

struct Registration {
    forwarder: std::sync::Arc<dyn Forwarder>,
    tx: mpsc::Sender<(String, Event)>,
}

/// The broker: an ordered list of registered forwarders, each fed by its
/// own bounded queue so a slow forwarder can't stall event producers.
pub struct Broker {
    forwarders: Mutex<Vec<Registration>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Register a forwarder and spawn the task that drains its queue.
    pub fn register(&self, forwarder: std::sync::Arc<dyn Forwarder>) {
        let (tx, mut rx) = mpsc::channel::<(String, Event)>(FORWARDER_QUEUE_DEPTH);
        let task_forwarder = forwarder.clone();

        tokio::spawn(async move {
            while let Some((topic, event)) = rx.recv().await {
                if let Err(err) = task_forwarder.send(&topic, &event).await {
                    tracing::warn!(
                        forwarder = task_forwarder.name(),
                        "failed to forward event on {topic}: {err}"
                    );
                }
            }
        });

        self.forwarders.lock().unwrap().push(Registration { forwarder, tx });
    }

    /// Fan `event` out to every registered forwarder on every topic it
    /// applies to. Never blocks: a full forwarder queue is logged and
    /// dropped rather than backing up the caller.
    pub fn broadcast(&self, event: Event) {
        let topics = event.topics();
        let forwarders = self.forwarders.lock().unwrap();

        for registration in forwarders.iter() {
            for topic in &topics {
                match registration.tx.try_send((topic.clone(), event.clone())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            forwarder = registration.forwarder.name(),
                            "queue full, dropping event on {topic}"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::warn!(
                            forwarder = registration.forwarder.name(),
                            "forwarder task is gone, dropping event on {topic}"
                        );
                    }
                }
            }
        }
    }
}

/// `created_at`/`updated_at` pair helper, shared by event constructors so
/// callers don't have to reach into `flamenco_core::Job`/`Task` directly.
pub fn job_update(uuid: Uuid, name: String, status: JobStatus, activity: String) -> Event {
    Event::JobUpdate(JobUpdate {
        uuid,
        name,
        status,
        activity,
        updated_at: Utc::now(),
    })
}

pub fn task_update(uuid: Uuid, job_uuid: Uuid, status: TaskStatus, activity: String) -> Event {
    Event::TaskUpdate(TaskUpdate {
        uuid,
        job_uuid,
        status,
        activity,
        updated_at: Utc::now(),
    })
}

pub fn worker_update(uuid: Uuid, name: String, status: WorkerStatus) -> Event {
    Event::WorkerUpdate(WorkerUpdate {
        uuid,
        name,
        status,
        updated_at: Utc::now(),
    })
}

pub fn farm_status_update(status: FarmStatus) -> Event {
    Event::FarmStatus(FarmStatusUpdate { status })
}
