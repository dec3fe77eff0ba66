//! Task allocations: one micro-batch of a job, bound to one worker and one transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use routine_load_core::{DbId, JobId, Offset, PartitionId, TableId, TaskId, TxnId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::sync::lock;

/// Where a task starts reading a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOffset {
    /// Earliest offset still retained by the source.
    Beginning,
    /// Only records produced after the task starts.
    End,
    /// An explicit offset, inclusive.
    At(Offset),
}

impl StartOffset {
    /// The first offset after a committed one. Saturates at `Offset::MAX`.
    pub fn after(committed: Offset) -> Self {
        StartOffset::At(committed.saturating_add(1))
    }
}

/// Kafka-specific part of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaTaskPayload {
    pub brokers: String,
    pub topic: String,
    pub partitions: BTreeMap<PartitionId, StartOffset>,
}

/// Source-specific payload, one variant per source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPayload {
    Kafka(KafkaTaskPayload),
}

impl TaskPayload {
    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        match self {
            TaskPayload::Kafka(kafka) => kafka.partitions.keys().copied().collect(),
        }
    }

    /// Same partitions, new start positions.
    pub fn resumed(&self, resume: impl Fn(PartitionId) -> StartOffset) -> TaskPayload {
        match self {
            TaskPayload::Kafka(kafka) => TaskPayload::Kafka(KafkaTaskPayload {
                brokers: kafka.brokers.clone(),
                topic: kafka.topic.clone(),
                partitions: kafka.partitions.keys().map(|&p| (p, resume(p))).collect(),
            }),
        }
    }
}

/// Load description copied from the job so a worker needs nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTarget {
    pub db_id: DbId,
    pub table_id: TableId,
    pub columns: Vec<String>,
    pub where_predicate: Option<String>,
    pub column_separator: String,
}

/// Transaction and placement a task is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBinding {
    pub worker: WorkerId,
    pub txn_id: TxnId,
    pub label: String,
    pub attempt: u64,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

/// A single scheduling allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub job_id: JobId,
    pub worker: WorkerId,
    pub txn_id: TxnId,
    pub label: String,
    pub attempt: u64,
    pub target: LoadTarget,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// The failed task this one was renewed from.
    pub renewed_from: Option<TaskId>,
}

impl TaskInfo {
    pub fn new(
        job_id: JobId,
        target: LoadTarget,
        binding: TaskBinding,
        payload: TaskPayload,
    ) -> Self {
        Self {
            id: TaskId::new(),
            job_id,
            worker: binding.worker,
            txn_id: binding.txn_id,
            label: binding.label,
            attempt: binding.attempt,
            target,
            payload,
            created_at: binding.created_at,
            deadline: binding.deadline,
            renewed_from: None,
        }
    }

    /// Build the follow-up of a failed or expired task.
    ///
    /// The new task keeps the partition set of `prior` but gets its own
    /// identity and transaction, and resumes from `resume` rather than from
    /// wherever `prior` started.
    pub fn renew_from(
        prior: &TaskInfo,
        binding: TaskBinding,
        resume: impl Fn(PartitionId) -> StartOffset,
    ) -> Result<Self, ScheduleError> {
        if binding.txn_id == prior.txn_id {
            return Err(ScheduleError::TransactionRebound(binding.txn_id));
        }
        let payload = prior.payload.resumed(resume);
        let mut task = TaskInfo::new(prior.job_id, prior.target.clone(), binding, payload);
        task.renewed_from = Some(prior.id);
        Ok(task)
    }

    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        self.payload.partitions()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Result of executing a task, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Committed { offsets: BTreeMap<PartitionId, Offset> },
    Failed { reason: String },
}

/// An execution report flowing back from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn committed(task: &TaskInfo, offsets: BTreeMap<PartitionId, Offset>) -> Self {
        Self {
            job_id: task.job_id,
            task_id: task.id,
            outcome: TaskOutcome::Committed { offsets },
        }
    }

    pub fn failed(task: &TaskInfo, reason: impl Into<String>) -> Self {
        Self {
            job_id: task.job_id,
            task_id: task.id,
            outcome: TaskOutcome::Failed {
                reason: reason.into(),
            },
        }
    }
}

/// Transactions currently bound to a live task, process-wide.
#[derive(Debug, Default)]
pub struct TxnLedger {
    live: Mutex<HashSet<TxnId>>,
}

impl TxnLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a transaction. Returns false if it is already bound.
    pub fn claim(&self, txn: TxnId) -> bool {
        lock(&self.live).insert(txn)
    }

    pub fn release(&self, txn: TxnId) -> bool {
        lock(&self.live).remove(&txn)
    }

    pub fn contains(&self, txn: TxnId) -> bool {
        lock(&self.live).contains(&txn)
    }

    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
