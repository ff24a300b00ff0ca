//! The Flamenco Manager data model (jobs, tasks, workers, and the
//! supporting relations that make the scheduler's invariants sound).
//!
//! These are semantic types, not wire types: `flamenco-storage` maps them
//! onto SQLite rows and `flamenco-manager` operates on them directly.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a status string read back from storage does not
/// match any known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

/// Status of a [`Job`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    UnderConstruction,
    Queued,
    Active,
    Paused,
    PauseRequested,
    CancelRequested,
    Canceled,
    Completed,
    Failed,
    Requeueing,
}

impl JobStatus {
    /// Jobs in one of these statuses can still hand out work to the
    /// scheduler (§4.2 step 3, "schedulable job" set).
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Active | Self::Queued)
    }

    /// True for the statuses in which a job is done and will not change
    /// again short of an operator-triggered requeue.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnderConstruction => "under-construction",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::PauseRequested => "pause-requested",
            Self::CancelRequested => "cancel-requested",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Requeueing => "requeueing",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "under-construction" => Self::UnderConstruction,
            "queued" => Self::Queued,
            "active" => Self::Active,
            "paused" => Self::Paused,
            "pause-requested" => Self::PauseRequested,
            "cancel-requested" => Self::CancelRequested,
            "canceled" => Self::Canceled,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "requeueing" => Self::Requeueing,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Status of a [`Task`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Active,
    SoftFailed,
    Failed,
    Canceled,
    Paused,
    Completed,
}

impl TaskStatus {
    /// The "schedulable" set from §4.2 step 3: tasks the scheduler is
    /// allowed to consider handing out (again).
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Queued | Self::SoftFailed)
    }

    pub fn is_runnable_for_pause(self) -> bool {
        !matches!(self, Self::Completed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::SoftFailed => "soft-failed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "active" => Self::Active,
            "soft-failed" => Self::SoftFailed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Liveness status of a [`Worker`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    Awake,
    Asleep,
    Offline,
    Error,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Awake => "awake",
            Self::Asleep => "asleep",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "awake" => Self::Awake,
            "asleep" => Self::Asleep,
            "offline" => Self::Offline,
            "error" => Self::Error,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Farm-wide status, as produced by the Farm Status Aggregator (§4.6).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FarmStatus {
    Starting,
    Inoperative,
    Active,
    Waiting,
    Idle,
    Asleep,
    Unknown,
}

/// Opaque per-entity identity: a database-local numeric id plus a
/// world-facing UUID. Every top-level entity (job, task, worker, tag)
/// carries both: the numeric id is what foreign keys and scheduler queries
/// use internally, the UUID is what collaborators outside Persistence see.
pub type Id = i64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    pub uuid: Uuid,
    pub name: String,
    pub job_type: String,
    pub priority: i32,
    pub status: JobStatus,
    pub activity: String,
    pub settings: serde_json::Value,
    pub metadata: serde_json::Value,
    pub worker_tag: Option<Id>,
    pub delete_requested_at: Option<DateTime<Utc>>,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub parameters: serde_json::Value,
    pub total_steps: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub uuid: Uuid,
    pub job_id: Id,
    pub name: String,
    pub task_type: String,
    pub priority: i32,
    /// Base-1 index, unique per job.
    pub index: i32,
    pub status: TaskStatus,
    pub activity: String,
    pub worker_id: Option<Id>,
    pub last_touched_at: Option<DateTime<Utc>>,
    pub commands: Vec<Command>,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task → prerequisite-task edge. Both tasks must belong to the same job.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: Id,
    pub dependency_id: Id,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: Id,
    pub uuid: Uuid,
    pub secret: String,
    pub name: String,
    pub address: Option<String>,
    pub platform: Option<String>,
    pub software: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub supported_task_types: Vec<String>,
    pub status: WorkerStatus,
    pub requested_status: Option<WorkerStatus>,
    pub lazy_status_request: bool,
    pub can_restart: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn supports(&self, task_type: &str) -> bool {
        self.supported_task_types.iter().any(|t| t == task_type)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerTag {
    pub id: Id,
    pub uuid: Uuid,
    pub name: String,
}

/// `(task, worker)` — records that this worker has failed this task.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: Id,
    pub worker_id: Id,
    pub created_at: DateTime<Utc>,
}

/// `(job, worker, task-type)` — this worker may no longer be offered tasks
/// of this type inside this job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobBlock {
    pub job_id: Id,
    pub worker_id: Id,
    pub task_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SleepSchedule {
    pub id: Id,
    pub worker_id: Id,
    pub is_active: bool,
    /// Bitmask, bit 0 = Sunday, per ISO week numbering used by the rest of
    /// the model's `chrono` timestamps.
    pub days_of_week: u8,
    pub start_time: chrono::NaiveTime,
    pub end_time: chrono::NaiveTime,
    pub next_check_at: Option<DateTime<Utc>>,
}

/// Singleton row pointing at the job whose most recent render thumbnail
/// was produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastRendered {
    pub job_id: Id,
    pub updated_at: DateTime<Utc>,
}

/// A histogram of statuses, e.g. the result of `SummarizeJobStatuses`.
pub type StatusHistogram<S> = HashMap<S, u64>;

/// The input the job author (job-compiler, §6) hands to
/// `StoreAuthoredJob`: a job plus its tasks and their dependency edges, all
/// persisted atomically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthoredJob {
    pub job: NewJob,
    pub tasks: Vec<NewTask>,
    pub dependencies: Vec<AuthoredDependency>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    pub uuid: Uuid,
    pub name: String,
    pub job_type: String,
    pub priority: i32,
    pub status: JobStatus,
    pub settings: serde_json::Value,
    pub metadata: serde_json::Value,
    pub worker_tag: Option<Id>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTask {
    /// Index into `tasks` in the enclosing [`AuthoredJob`]; used to resolve
    /// [`AuthoredDependency`] edges before ids are assigned.
    pub local_id: usize,
    pub uuid: Uuid,
    pub name: String,
    pub task_type: String,
    pub priority: i32,
    pub index: i32,
    pub commands: Vec<Command>,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct AuthoredDependency {
    pub task: usize,
    pub dependency: usize,
}
