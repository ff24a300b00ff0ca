use std::fmt;

/// An error produced by the Flamenco Manager core.
///
/// This wraps a private [`ErrorData`] so that the enum can grow new
/// variants without it being a breaking change; callers that need to
/// distinguish cases match on [`Error::kind`] instead of the error itself.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorData);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match &self.0 {
            ErrorData::NotFound(kind, _) => ErrorKind::NotFound(*kind),
            ErrorData::Integrity(kind, _) => ErrorKind::Integrity(*kind),
            ErrorData::Busy => ErrorKind::Busy,
            ErrorData::Cancelled => ErrorKind::Cancelled,
            ErrorData::Validation(_) => ErrorKind::Validation,
            ErrorData::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(kind: NotFoundKind, id: impl fmt::Display) -> Self {
        ErrorData::NotFound(kind, id.to_string()).into()
    }

    pub fn integrity(kind: IntegrityKind, message: impl Into<String>) -> Self {
        ErrorData::Integrity(kind, message.into()).into()
    }

    pub fn busy() -> Self {
        ErrorData::Busy.into()
    }

    pub fn cancelled() -> Self {
        ErrorData::Cancelled.into()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ErrorData::Validation(message.into()).into()
    }

    pub fn internal(error: impl Into<anyhow::Error>) -> Self {
        ErrorData::Internal(error.into()).into()
    }

    /// Whether this error is expected-transient and worth retrying at a
    /// higher layer (§5, §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Cancelled)
    }
}

/// Stable, matchable classification of an [`Error`] (§7 error taxonomy).
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// No row matching the request; see [`NotFoundKind`] for which entity.
    NotFound(NotFoundKind),
    /// Referential/storage integrity problem; fatal, refuses to serve.
    Integrity(IntegrityKind),
    /// The store could not be locked right now; retriable by the caller.
    Busy,
    /// The operation's deadline expired.
    Cancelled,
    /// Malformed input (bad UUID, unknown status, empty required field).
    Validation,
    /// Anything else.
    Internal,
}

#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NotFoundKind {
    Job,
    Task,
    Worker,
    WorkerTag,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Job => "job",
            Self::Task => "task",
            Self::Worker => "worker",
            Self::WorkerTag => "worker tag",
        };
        f.write_str(s)
    }
}

#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IntegrityKind {
    /// Referential cascade is disabled but a cascading delete was
    /// attempted (§7 "refusing to delete without referential cascade").
    Cascade,
    /// The storage engine's own integrity check failed at startup.
    Corrupt,
}

#[derive(Debug, thiserror::Error)]
enum ErrorData {
    #[error("no such {0}: {1}")]
    NotFound(NotFoundKind, String),

    #[error("{1}")]
    Integrity(IntegrityKind, String),

    #[error("database is busy")]
    Busy,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                // Callers that know *which* entity was being looked up should
                // prefer `Error::not_found` directly; this fallback only
                // fires when a query's own `RowNotFound` bubbles up
                // unannotated.
                ErrorData::NotFound(NotFoundKind::Job, "<unspecified>".to_string()).into()
            }
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match &*code {
                        // SQLITE_BUSY / SQLITE_LOCKED
                        "5" | "6" => return ErrorData::Busy.into(),
                        _ => {}
                    }
                }

                if db_err.is_foreign_key_violation() {
                    ErrorData::Integrity(
                        IntegrityKind::Cascade,
                        format!("foreign key violation: {db_err}"),
                    )
                    .into()
                } else {
                    ErrorData::Internal(anyhow::Error::new(err)).into()
                }
            }
            _ => ErrorData::Internal(anyhow::Error::new(err)).into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
