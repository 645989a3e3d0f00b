use std::fmt;
use std::time::Duration;

use crate::event::{DataParseError, EventType};
use crate::eventstore::EventStoreError;
use crate::lock::LockError;

/// Boxed error used where a driver or collaborator error is carried opaquely.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Machine-readable error codes for operator-facing decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidArgument,
    Conversion,
    NoProjection,
    NoValues,
    NoCondition,
    StorageFailed,
    TransientStorage,
    CheckpointConflict,
    LockContention,
    SchemaInitFailed,
    EventStoreUnavailable,
    BatchTimeout,
    Cancelled,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidArgument => "E2001",
            Self::Conversion => "E2002",
            Self::NoProjection => "E2003",
            Self::NoValues => "E2004",
            Self::NoCondition => "E2005",
            Self::StorageFailed => "E3001",
            Self::TransientStorage => "E3002",
            Self::CheckpointConflict => "E3003",
            Self::LockContention => "E5001",
            Self::SchemaInitFailed => "E5002",
            Self::EventStoreUnavailable => "E6001",
            Self::BatchTimeout => "E6002",
            Self::Cancelled => "E7001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidArgument => "Reducer received an event type it cannot handle",
            Self::Conversion => "Event payload could not be decoded",
            Self::NoProjection => "Statement executed without a projection name",
            Self::NoValues => "Statement has no column values",
            Self::NoCondition => "Statement has no conditions",
            Self::StorageFailed => "Projection storage rejected a statement",
            Self::TransientStorage => "Transient projection storage failure",
            Self::CheckpointConflict => "Projection checkpoint moved concurrently",
            Self::LockContention => "Projection lock contention",
            Self::SchemaInitFailed => "Projection schema initialization failed",
            Self::EventStoreUnavailable => "Event store unavailable",
            Self::BatchTimeout => "Projection batch exceeded its timeout",
            Self::Cancelled => "Projection processing cancelled",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the ledgerview config.toml and retry."),
            Self::InvalidArgument => Some(
                "The routing table and reducer disagree; deploy a build whose reducers match the registered events.",
            ),
            Self::Conversion => Some("Inspect the stored payload; the event shape drifted from the decoder."),
            Self::NoProjection | Self::NoValues | Self::NoCondition => {
                Some("The reducer built an incomplete statement; fix the reducer.")
            }
            Self::StorageFailed => Some("Check the projection table schema against the reducer's columns."),
            Self::TransientStorage | Self::CheckpointConflict | Self::LockContention => {
                Some("Retried automatically with backoff.")
            }
            Self::SchemaInitFailed => Some("Run `lv init` and inspect the projection database."),
            Self::EventStoreUnavailable => Some("Check the event store database and retry."),
            Self::BatchTimeout => Some("Lower `bulk_limit` or raise `transaction_timeout_ms`."),
            Self::Cancelled => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failure reported by an [`crate::statement::Executor`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Busy/locked database or similar; the batch can be retried.
    #[error("transient storage error: {0}")]
    Transient(#[source] BoxError),
    /// The statement itself was rejected.
    #[error("storage error: {0}")]
    Failed(#[source] BoxError),
}

impl ExecError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for ExecError {
    fn from(err: rusqlite::Error) -> Self {
        if is_transient_sqlite(&err) {
            Self::Transient(Box::new(err))
        } else {
            Self::Failed(Box::new(err))
        }
    }
}

/// Whether a rusqlite error is a lock/busy condition worth retrying.
#[must_use]
pub fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Errors produced while rendering or executing a statement.
#[derive(Debug, thiserror::Error)]
pub enum StatementError {
    #[error("no projection name given")]
    NoProjection,
    #[error("no values")]
    NoValues,
    #[error("no conditions")]
    NoCondition,
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl StatementError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoProjection => ErrorCode::NoProjection,
            Self::NoValues => ErrorCode::NoValues,
            Self::NoCondition => ErrorCode::NoCondition,
            Self::Exec(ExecError::Transient(_)) => ErrorCode::TransientStorage,
            Self::Exec(ExecError::Failed(_)) => ErrorCode::StorageFailed,
        }
    }
}

/// Schema initialization failure for one table of a check.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("table {table}: column {column} is missing and has neither a default nor is nullable")]
    MissingColumn { table: String, column: String },
    #[error("table {table}: {source}")]
    Sql {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Top-level error of the projection engine.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("reduce.wrong.event.type: got {got}, expected one of [{}]", join_types(.expected))]
    InvalidArgument {
        got: EventType,
        expected: Vec<EventType>,
    },
    #[error("could not decode {event_type} at sequence {sequence}: {source}")]
    Conversion {
        event_type: EventType,
        sequence: u64,
        #[source]
        source: DataParseError,
    },
    #[error(transparent)]
    Statement(#[from] StatementError),
    #[error("projection storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("schema initialization: {0}")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("checkpoint of {projection} for instance {instance_id} moved from {expected} to {found}")]
    CheckpointConflict {
        projection: String,
        instance_id: String,
        expected: u64,
        found: u64,
    },
    #[error("batch exceeded transaction timeout of {0:?}")]
    Timeout(Duration),
    #[error("processing cancelled")]
    Cancelled,
}

fn join_types(types: &[EventType]) -> String {
    types
        .iter()
        .map(EventType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ProjectionError {
    /// Build the error every reducer returns for an event it was not written for.
    #[must_use]
    pub fn invalid_argument(got: &EventType, expected: &[&str]) -> Self {
        Self::InvalidArgument {
            got: got.clone(),
            expected: expected.iter().map(|t| EventType::from(*t)).collect(),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Conversion { .. } => ErrorCode::Conversion,
            Self::Statement(err) => err.code(),
            Self::Storage(_) => ErrorCode::StorageFailed,
            Self::Schema(_) => ErrorCode::SchemaInitFailed,
            Self::EventStore(_) => ErrorCode::EventStoreUnavailable,
            Self::Lock(err) => err.code(),
            Self::CheckpointConflict { .. } => ErrorCode::CheckpointConflict,
            Self::Timeout(_) => ErrorCode::BatchTimeout,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Whether rolling back and retrying the batch can succeed.
    ///
    /// Reducer and statement-construction failures are deterministic: replaying
    /// the same event yields the same error, so they are not retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidArgument { .. } | Self::Conversion { .. } | Self::Cancelled => false,
            Self::Statement(StatementError::Exec(err)) => err.is_transient(),
            Self::Statement(_) => false,
            Self::Storage(err) => is_transient_sqlite(err),
            Self::Schema(_)
            | Self::EventStore(_)
            | Self::Lock(_)
            | Self::CheckpointConflict { .. }
            | Self::Timeout(_) => true,
        }
    }
}
