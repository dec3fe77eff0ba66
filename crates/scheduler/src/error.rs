//! Error types for job registration, scheduling and the external collaborators.

use routine_load_core::{DbId, TxnId, WorkerId};
use thiserror::Error;

use crate::job::JobState;

/// Errors surfaced to callers of the registry (creation and control requests).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job name '{name}' is already used by an unfinished job in database {db_id}")]
    NameConflict { db_id: DbId, name: String },

    #[error("user '{user}' has no LOAD privilege on {db}.{table}")]
    AuthorizationDenied {
        user: String,
        db: String,
        table: String,
    },

    #[error("malformed job definition: {0}")]
    MalformedSpec(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job} is {state}, which is final and cannot be changed")]
    JobAlreadyFinal { job: String, state: JobState },

    #[error("cannot {op} job {job} while it is {state}")]
    InvalidTransition {
        job: String,
        op: &'static str,
        state: JobState,
    },

    #[error("no workers available in cluster '{0}'")]
    CapacityUnavailable(String),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),
}

/// Errors from a single scheduling attempt. Never crosses the tick boundary.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("transaction label already exists: {0}")]
    LabelAlreadyExists(String),

    #[error("failed to begin transaction: {0}")]
    BeginTransaction(String),

    #[error("transaction {0} is already bound to another task")]
    TransactionRebound(TxnId),

    #[error("job is {0} and no longer accepts tasks")]
    NotSchedulable(JobState),

    #[error("no unclaimed partitions or concurrency left")]
    NothingToSchedule,

    #[error("journaling the attempt failed: {0}")]
    Journal(#[from] JournalError),
}

impl From<TransactionError> for ScheduleError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::LabelAlreadyExists(label) => ScheduleError::LabelAlreadyExists(label),
            other => ScheduleError::BeginTransaction(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("label already exists: {0}")]
    LabelAlreadyExists(String),

    #[error("begin failed: {0}")]
    Begin(String),

    #[error("commit of transaction {txn} failed: {reason}")]
    Commit { txn: TxnId, reason: String },

    #[error("abort of transaction {txn} failed: {reason}")]
    Abort { txn: TxnId, reason: String },

    #[error("transaction not found: {0}")]
    NotFound(TxnId),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker {0} is unreachable")]
    WorkerUnavailable(WorkerId),

    #[error("worker {worker} rejected the task: {reason}")]
    Rejected { worker: WorkerId, reason: String },
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}
