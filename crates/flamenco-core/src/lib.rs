//! Data model and error taxonomy shared by the Flamenco Manager persistence
//! and engine crates. This crate does no I/O of its own.

mod error;
mod model;

pub use error::{Error, ErrorKind, IntegrityKind, NotFoundKind, Result};
pub use model::{
    AuthoredDependency, AuthoredJob, Command, FarmStatus, Id, Job, JobBlock, JobStatus,
    LastRendered, NewJob, NewTask, SleepSchedule, StatusHistogram, Task, TaskDependency,
    TaskFailure, TaskStatus, UnknownStatus, Worker, WorkerStatus, WorkerTag,
};
