//! Routine load jobs: definition, state machine and task production.
//!
//! A [`Job`] is plain data mutated under the lock of its [`JobEntry`]. The
//! entry is what the registry shares; it owns the locking so that nothing
//! awaits on a collaborator while the job is locked.

pub mod kafka;
pub mod state;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use routine_load_core::{DbId, JobId, Offset, PartitionId, TableId, TaskId, TxnId, WorkerId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborators::{EditLog, TransactionCoordinator};
use crate::config::SchedulerConfig;
use crate::definition::{JobDefinition, SourceType, TableRef};
use crate::error::{RegistryError, ScheduleError};
use crate::journal::EditLogEntry;
use crate::progress::ProgressTracker;
use crate::sync::lock;
use crate::task::{LoadTarget, TaskBinding, TaskInfo, TaskPayload, TxnLedger};

pub use kafka::KafkaSource;
pub use state::{JobState, PauseReason};

/// Source-specific job configuration, one variant per source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceConfig {
    Kafka(KafkaSource),
}

impl SourceConfig {
    pub fn from_definition(
        source_type: SourceType,
        def: &JobDefinition,
    ) -> Result<Self, RegistryError> {
        match source_type {
            SourceType::Kafka => {
                Ok(SourceConfig::Kafka(KafkaSource::from_properties(&def.properties)?))
            }
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            SourceConfig::Kafka(_) => SourceType::Kafka,
        }
    }

    pub fn partitions(&self) -> &[PartitionId] {
        match self {
            SourceConfig::Kafka(kafka) => &kafka.partitions,
        }
    }

    fn payload(
        &self,
        partitions: &BTreeSet<PartitionId>,
        progress: &ProgressTracker,
    ) -> TaskPayload {
        match self {
            SourceConfig::Kafka(kafka) => TaskPayload::Kafka(kafka.payload(partitions, progress)),
        }
    }

    fn resume_offset(
        &self,
        partition: PartitionId,
        progress: &ProgressTracker,
    ) -> crate::task::StartOffset {
        match self {
            SourceConfig::Kafka(kafka) => kafka.resume_offset(partition, progress),
        }
    }
}

/// Task counters of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub committed_tasks: u64,
    pub aborted_tasks: u64,
}

/// Immutable part of a job, as written to the edit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub target: TableRef,
    pub cluster: String,
    pub desired_concurrency: usize,
    pub columns: Vec<String>,
    pub where_predicate: Option<String>,
    pub column_separator: String,
    pub source: SourceConfig,
    pub created_at: DateTime<Utc>,
}

/// Inspection view of a job, for show/list requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    pub target: TableRef,
    pub cluster: String,
    pub state: JobState,
    pub source_type: SourceType,
    pub desired_concurrency: usize,
    pub partitions: Vec<PartitionId>,
    pub running_tasks: usize,
    pub progress: BTreeMap<PartitionId, Offset>,
    pub stats: JobStats,
    pub last_error: Option<String>,
    pub pause_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

/// A task allocation that has partitions reserved but no transaction yet.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub worker: WorkerId,
    pub attempt: u64,
    pub label: String,
    pub target: LoadTarget,
    pub partitions: BTreeSet<PartitionId>,
    /// The failed task whose partitions this plan takes over.
    pub renews: Option<TaskInfo>,
}

/// A task that left the running set and whose transaction must be aborted.
#[derive(Debug, Clone)]
pub struct Released {
    pub task: TaskInfo,
    pub reason: String,
}

/// Side effects of a job mutation that must happen outside the job lock.
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    pub released: Vec<Released>,
    pub transition: Option<(JobState, Option<String>)>,
}

impl Settlement {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.transition.is_none()
    }

    fn absorb(&mut self, other: Settlement) {
        self.released.extend(other.released);
        if other.transition.is_some() {
            self.transition = other.transition;
        }
    }
}

/// A user or system request that moves a job between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOp {
    Pause,
    Resume,
    Stop,
    Cancel(String),
}

impl ControlOp {
    pub fn name(&self) -> &'static str {
        match self {
            ControlOp::Pause => "pause",
            ControlOp::Resume => "resume",
            ControlOp::Stop => "stop",
            ControlOp::Cancel(_) => "cancel",
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitApplied {
    pub task: TaskInfo,
    pub progress: ProgressTracker,
    pub next_attempt: u64,
}

#[derive(Debug, Clone)]
struct RunningTask {
    info: TaskInfo,
    committing: bool,
}

/// One routine load job.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    name: String,
    target: TableRef,
    cluster: String,
    desired_concurrency: usize,
    columns: Vec<String>,
    where_predicate: Option<String>,
    column_separator: String,
    source: SourceConfig,

    state: JobState,
    progress: ProgressTracker,
    running: BTreeMap<TaskId, RunningTask>,
    /// Partitions held by plans waiting on a transaction, by attempt.
    reserved: BTreeMap<u64, BTreeSet<PartitionId>>,
    /// Failed tasks whose partitions are re-issued first.
    pending_renewals: VecDeque<TaskInfo>,
    next_attempt: u64,
    stats: JobStats,
    last_error: Option<String>,
    pause_reason: Option<PauseReason>,
    cancel_reason: Option<String>,
    created_at: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from a validated creation request.
    pub fn from_definition(def: &JobDefinition, now: DateTime<Utc>) -> Result<Self, RegistryError> {
        let source_type = def.validate()?;
        let source = SourceConfig::from_definition(source_type, def)?;
        Ok(Self::from_snapshot(JobSnapshot {
            id: JobId::new(),
            name: def.name.clone(),
            target: def.target.clone(),
            cluster: def.cluster.clone(),
            desired_concurrency: def.desired_concurrency,
            columns: def.columns.clone(),
            where_predicate: def.where_predicate.clone(),
            column_separator: def.column_separator_or_default(),
            source,
            created_at: now,
        }))
    }

    /// Rebuild a job from the edit log. Starts in NEED_SCHEDULE with no progress.
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            target: snapshot.target,
            cluster: snapshot.cluster,
            desired_concurrency: snapshot.desired_concurrency,
            columns: snapshot.columns,
            where_predicate: snapshot.where_predicate,
            column_separator: snapshot.column_separator,
            source: snapshot.source,
            state: JobState::NeedSchedule,
            progress: ProgressTracker::new(),
            running: BTreeMap::new(),
            reserved: BTreeMap::new(),
            pending_renewals: VecDeque::new(),
            next_attempt: 0,
            stats: JobStats::default(),
            last_error: None,
            pause_reason: None,
            cancel_reason: None,
            created_at: snapshot.created_at,
            paused_at: None,
            end_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut SourceConfig {
        &mut self.source
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        self.end_at
    }

    pub fn running_tasks(&self) -> Vec<TaskInfo> {
        self.running.values().map(|t| t.info.clone()).collect()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            target: self.target.clone(),
            cluster: self.cluster.clone(),
            desired_concurrency: self.desired_concurrency,
            columns: self.columns.clone(),
            where_predicate: self.where_predicate.clone(),
            column_separator: self.column_separator.clone(),
            source: self.source.clone(),
            created_at: self.created_at,
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            name: self.name.clone(),
            target: self.target.clone(),
            cluster: self.cluster.clone(),
            state: self.state,
            source_type: self.source.source_type(),
            desired_concurrency: self.desired_concurrency,
            partitions: self.source.partitions().to_vec(),
            running_tasks: self.running.len(),
            progress: self.progress.offsets().clone(),
            stats: self.stats.clone(),
            last_error: self.last_error.clone(),
            pause_reason: self.pause_reason.as_ref().map(|r| r.to_string()),
            cancel_reason: self.cancel_reason.clone(),
            created_at: self.created_at,
            paused_at: self.paused_at,
            end_at: self.end_at,
        }
    }

    fn load_target(&self) -> LoadTarget {
        LoadTarget {
            db_id: self.target.db_id,
            table_id: self.target.table_id,
            columns: self.columns.clone(),
            where_predicate: self.where_predicate.clone(),
            column_separator: self.column_separator.clone(),
        }
    }

    // ── Task production ─────────────────────────────────────────

    /// Concurrency the job can actually use: bounded by the config cap and
    /// by the partition count.
    pub fn effective_concurrency(&self, max_concurrency: usize) -> usize {
        self.desired_concurrency
            .min(max_concurrency)
            .min(self.source.partitions().len())
    }

    fn claimed_partitions(&self) -> BTreeSet<PartitionId> {
        let mut claimed: BTreeSet<PartitionId> =
            self.reserved.values().flatten().copied().collect();
        for task in self.running.values() {
            claimed.extend(task.info.partitions());
        }
        claimed
    }

    fn unclaimed_partitions(&self) -> Vec<PartitionId> {
        let claimed = self.claimed_partitions();
        self.source
            .partitions()
            .iter()
            .copied()
            .filter(|p| !claimed.contains(p))
            .collect()
    }

    fn free_slots(&self, max_concurrency: usize) -> usize {
        self.effective_concurrency(max_concurrency)
            .saturating_sub(self.running.len() + self.reserved.len())
    }

    /// Whether the tick should try to produce a task for this job.
    pub fn wants_task(&self, max_concurrency: usize) -> bool {
        self.state.is_schedulable()
            && self.free_slots(max_concurrency) > 0
            && !self.unclaimed_partitions().is_empty()
    }

    /// Reserve partitions for a new task on `worker`.
    ///
    /// Partitions of failed tasks are re-issued as a whole first. Otherwise
    /// unclaimed partitions are dealt round-robin over the free slots and
    /// this task takes the first share.
    pub fn plan_task(&mut self, worker: WorkerId, max_concurrency: usize) -> Option<TaskPlan> {
        if !self.state.is_schedulable() {
            return None;
        }
        let slots = self.free_slots(max_concurrency);
        if slots == 0 {
            return None;
        }
        let unclaimed = self.unclaimed_partitions();
        if unclaimed.is_empty() {
            return None;
        }

        let mut renews = None;
        while let Some(prior) = self.pending_renewals.pop_front() {
            let partitions = prior.partitions();
            if partitions.iter().all(|p| unclaimed.contains(p)) {
                renews = Some(prior);
                break;
            }
            debug!(
                job = %self.name,
                task = %prior.id,
                "dropping renewal with reassigned partitions"
            );
        }

        let partitions: BTreeSet<PartitionId> = match &renews {
            Some(prior) => prior.partitions(),
            None => unclaimed.iter().copied().step_by(slots).collect(),
        };

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.reserved.insert(attempt, partitions.clone());

        Some(TaskPlan {
            worker,
            attempt,
            label: format!("{}-{}-{}", self.name, self.id.0.simple(), attempt),
            target: self.load_target(),
            partitions,
            renews,
        })
    }

    /// Give back a plan whose transaction could not be begun.
    pub fn discard_plan(&mut self, plan: TaskPlan) {
        self.reserved.remove(&plan.attempt);
        if let Some(prior) = plan.renews {
            if self.state.is_schedulable() {
                self.pending_renewals.push_front(prior);
            }
        }
    }

    /// Turn a plan into a running task bound to `txn_id`.
    pub fn bind_task(
        &mut self,
        plan: TaskPlan,
        txn_id: TxnId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<TaskInfo, ScheduleError> {
        if self.reserved.remove(&plan.attempt).is_none() || !self.state.is_schedulable() {
            return Err(ScheduleError::NotSchedulable(self.state));
        }
        let binding = TaskBinding {
            worker: plan.worker,
            txn_id,
            label: plan.label,
            attempt: plan.attempt,
            created_at: now,
            deadline: Some(now + timeout),
        };
        let task = match plan.renews {
            Some(prior) => {
                let progress = &self.progress;
                let source = &self.source;
                TaskInfo::renew_from(&prior, binding, |p| source.resume_offset(p, progress))?
            }
            None => TaskInfo::new(
                self.id,
                plan.target,
                binding,
                self.source.payload(&plan.partitions, &self.progress),
            ),
        };
        self.running.insert(
            task.id,
            RunningTask {
                info: task.clone(),
                committing: false,
            },
        );
        Ok(task)
    }

    /// Record that a task reached its worker. Returns true on NEED_SCHEDULE → RUNNING.
    ///
    /// The task itself may already have reported back and left the running set.
    pub fn mark_dispatched(&mut self) -> bool {
        if self.state == JobState::NeedSchedule {
            self.state = JobState::Running;
            return true;
        }
        false
    }

    // ── Execution reports ───────────────────────────────────────

    /// Claim a running task for commit. `None` if the task is no longer live.
    pub fn begin_commit(&mut self, task_id: TaskId) -> Option<TaskInfo> {
        let task = self.running.get_mut(&task_id)?;
        if task.committing {
            return None;
        }
        task.committing = true;
        Some(task.info.clone())
    }

    /// Apply a committed task's offsets and release it.
    pub fn finish_commit(
        &mut self,
        task_id: TaskId,
        offsets: &BTreeMap<PartitionId, Offset>,
    ) -> Option<CommitApplied> {
        let task = self.running.remove(&task_id)?.info;
        let owned = task.partitions();
        let (accepted, foreign): (BTreeMap<_, _>, BTreeMap<_, _>) = offsets
            .iter()
            .map(|(&p, &o)| (p, o))
            .partition(|(p, _)| owned.contains(p));
        if !foreign.is_empty() {
            warn!(
                job = %self.name,
                task = %task.id,
                partitions = ?foreign.keys().collect::<Vec<_>>(),
                "ignoring offsets for partitions the task does not own"
            );
        }
        self.progress.merge(&accepted);
        self.stats.committed_tasks += 1;
        self.stats.consecutive_failures = 0;
        Some(CommitApplied {
            task,
            progress: self.progress.clone(),
            next_attempt: self.next_attempt,
        })
    }

    /// Return a task whose commit call failed to the failable set.
    pub fn abandon_commit(&mut self, task_id: TaskId) {
        if let Some(task) = self.running.get_mut(&task_id) {
            task.committing = false;
        }
    }

    /// Fail a running task and re-evaluate the job state. Tasks mid-commit
    /// are left alone.
    pub fn fail_task(
        &mut self,
        task_id: TaskId,
        reason: &str,
        now: DateTime<Utc>,
        max_failures: u32,
    ) -> Option<Settlement> {
        if self.running.get(&task_id)?.committing {
            return None;
        }
        let task = self.running.remove(&task_id)?.info;
        self.stats.consecutive_failures += 1;
        self.stats.total_failures += 1;
        self.stats.aborted_tasks += 1;
        self.last_error = Some(reason.to_string());

        let mut settlement = Settlement::default();
        if self.state.is_schedulable() {
            self.pending_renewals.push_back(task.clone());
        }
        settlement.released.push(Released {
            task,
            reason: reason.to_string(),
        });

        if self.state.is_schedulable() && self.stats.consecutive_failures >= max_failures {
            let pause = PauseReason::TooManyFailures {
                failures: self.stats.consecutive_failures,
                last_error: reason.to_string(),
            };
            warn!(job = %self.name, reason = %pause, "pausing job");
            settlement.absorb(self.enter(JobState::Paused, Some(pause.to_string()), now));
            self.pause_reason = Some(pause);
            self.paused_at = Some(now);
        }
        Some(settlement)
    }

    /// Fail every task whose deadline has passed, except those mid-commit.
    pub fn expire_overdue(&mut self, now: DateTime<Utc>, max_failures: u32) -> Settlement {
        let overdue: Vec<TaskId> = self
            .running
            .values()
            .filter(|t| !t.committing && t.info.is_overdue(now))
            .map(|t| t.info.id)
            .collect();
        let mut settlement = Settlement::default();
        for task_id in overdue {
            let failed = self.fail_task(task_id, "task exceeded its deadline", now, max_failures);
            if let Some(s) = failed {
                settlement.absorb(s);
            }
        }
        settlement
    }

    /// Fail every task placed on a worker that left the cluster.
    pub fn fail_worker_tasks(
        &mut self,
        worker: WorkerId,
        now: DateTime<Utc>,
        max_failures: u32,
    ) -> Settlement {
        let lost: Vec<TaskId> = self
            .running
            .values()
            .filter(|t| !t.committing && t.info.worker == worker)
            .map(|t| t.info.id)
            .collect();
        let mut settlement = Settlement::default();
        let reason = format!("worker {worker} left the cluster");
        for task_id in lost {
            if let Some(s) = self.fail_task(task_id, &reason, now, max_failures) {
                settlement.absorb(s);
            }
        }
        settlement
    }

    // ── State transitions ───────────────────────────────────────

    /// Move to `next` and drain tasks if the job stops being schedulable.
    /// Tasks already committing are left to finish.
    fn enter(&mut self, next: JobState, reason: Option<String>, now: DateTime<Utc>) -> Settlement {
        let previous = self.state;
        self.state = next;
        let mut settlement = Settlement {
            released: Vec::new(),
            transition: Some((next, reason)),
        };
        if previous.is_schedulable() && !next.is_schedulable() {
            self.reserved.clear();
            self.pending_renewals.clear();
            let draining: Vec<TaskId> = self
                .running
                .values()
                .filter(|t| !t.committing)
                .map(|t| t.info.id)
                .collect();
            for task_id in draining {
                if let Some(running) = self.running.remove(&task_id) {
                    settlement.released.push(Released {
                        task: running.info,
                        reason: format!("job is {next}"),
                    });
                }
            }
        }
        if next.is_final() {
            self.end_at = Some(now);
        }
        info!(job = %self.name, from = %previous, to = %next, "job state changed");
        settlement
    }

    fn check_transition(&self, op: &'static str, next: JobState) -> Result<(), RegistryError> {
        if self.state.is_final() {
            return Err(RegistryError::JobAlreadyFinal {
                job: self.name.clone(),
                state: self.state,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                job: self.name.clone(),
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// The state and journal reason `op` would move the job to. Nothing changes.
    pub fn control_target(
        &self,
        op: &ControlOp,
    ) -> Result<(JobState, Option<String>), RegistryError> {
        let (next, reason) = match op {
            ControlOp::Pause => (JobState::Paused, Some(PauseReason::User.to_string())),
            ControlOp::Resume => (JobState::NeedSchedule, None),
            ControlOp::Stop => (JobState::Stopped, Some(STOPPED_BY_USER.to_string())),
            ControlOp::Cancel(reason) => (JobState::Cancelled, Some(reason.clone())),
        };
        self.check_transition(op.name(), next)?;
        Ok((next, reason))
    }

    pub fn apply_control(
        &mut self,
        op: &ControlOp,
        now: DateTime<Utc>,
    ) -> Result<Settlement, RegistryError> {
        match op {
            ControlOp::Pause => self.pause(now),
            ControlOp::Resume => self.resume(now),
            ControlOp::Stop => self.stop(now),
            ControlOp::Cancel(reason) => self.cancel(reason, now),
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<Settlement, RegistryError> {
        self.check_transition("pause", JobState::Paused)?;
        let settlement = self.enter(JobState::Paused, Some(PauseReason::User.to_string()), now);
        self.pause_reason = Some(PauseReason::User);
        self.paused_at = Some(now);
        Ok(settlement)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<Settlement, RegistryError> {
        self.check_transition("resume", JobState::NeedSchedule)?;
        self.pause_reason = None;
        self.paused_at = None;
        self.stats.consecutive_failures = 0;
        Ok(self.enter(JobState::NeedSchedule, None, now))
    }

    /// Resume a job paused by failures once `interval` has passed.
    pub fn try_auto_resume(
        &mut self,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> Option<Settlement> {
        let eligible = self.state == JobState::Paused
            && matches!(self.pause_reason, Some(PauseReason::TooManyFailures { .. }))
            && self.paused_at.is_some_and(|at| now - at >= interval);
        if !eligible {
            return None;
        }
        info!(job = %self.name, "automatically resuming job");
        self.resume(now).ok()
    }

    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<Settlement, RegistryError> {
        self.check_transition("stop", JobState::Stopped)?;
        Ok(self.enter(JobState::Stopped, Some(STOPPED_BY_USER.into()), now))
    }

    pub fn cancel(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Settlement, RegistryError> {
        self.check_transition("cancel", JobState::Cancelled)?;
        self.cancel_reason = Some(reason.to_string());
        self.last_error = Some(reason.to_string());
        Ok(self.enter(JobState::Cancelled, Some(reason.to_string()), now))
    }

    /// Record a non-fatal error seen outside task execution.
    pub fn record_error(&mut self, error: String) {
        self.last_error = Some(error);
    }

    // ── Recovery ────────────────────────────────────────────────

    /// Apply a journaled state change. No tasks survive a restart, so
    /// RUNNING comes back as NEED_SCHEDULE.
    pub fn restore_state(&mut self, state: JobState, reason: Option<String>, at: DateTime<Utc>) {
        self.state = match state {
            JobState::Running => JobState::NeedSchedule,
            other => other,
        };
        match state {
            JobState::Paused => {
                self.pause_reason = Some(match reason.as_deref() {
                    Some(r) if r == PauseReason::User.to_string() => PauseReason::User,
                    _ => PauseReason::TooManyFailures {
                        failures: 0,
                        last_error: reason.clone().unwrap_or_default(),
                    },
                });
                self.paused_at = Some(at);
            }
            JobState::NeedSchedule | JobState::Running => {
                self.pause_reason = None;
                self.paused_at = None;
            }
            JobState::Cancelled => {
                self.cancel_reason = reason;
                self.end_at = Some(at);
            }
            JobState::Stopped => self.end_at = Some(at),
        }
    }

    pub fn restore_progress(&mut self, progress: ProgressTracker, next_attempt: u64) {
        self.progress = progress;
        self.restore_attempt(next_attempt);
    }

    /// Never move the attempt counter back, so labels are not reused.
    pub fn restore_attempt(&mut self, next_attempt: u64) {
        self.next_attempt = self.next_attempt.max(next_attempt);
    }

    pub fn next_attempt(&self) -> u64 {
        self.next_attempt
    }
}

const STOPPED_BY_USER: &str = "stopped by user";

// ── Shared entry ────────────────────────────────────────────────

/// A job as shared by the registry: immutable identity plus the locked job.
#[derive(Debug)]
pub struct JobEntry {
    id: JobId,
    name: String,
    db_id: DbId,
    table_id: TableId,
    cluster: String,
    /// False while the job's creation is not yet journaled. Lookups and the
    /// tick skip jobs that are not admitted.
    admitted: AtomicBool,
    job: Mutex<Job>,
}

pub type JobRef = Arc<JobEntry>;

impl JobEntry {
    pub fn new(job: Job) -> JobRef {
        Self::build(job, true)
    }

    /// An entry that holds its name but stays hidden until [`Self::admit`].
    pub fn pending(job: Job) -> JobRef {
        Self::build(job, false)
    }

    fn build(job: Job, admitted: bool) -> JobRef {
        Arc::new(Self {
            id: job.id,
            name: job.name.clone(),
            db_id: job.target.db_id,
            table_id: job.target.table_id,
            cluster: job.cluster.clone(),
            admitted: AtomicBool::new(admitted),
            job: Mutex::new(job),
        })
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }

    pub fn admit(&self) {
        self.admitted.store(true, Ordering::Release);
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Run `f` with the job locked. Never call a collaborator inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        let mut job = lock(&self.job);
        f(&mut job)
    }

    pub fn state(&self) -> JobState {
        self.with(|job| job.state())
    }

    pub fn is_final(&self) -> bool {
        self.with(|job| job.is_final())
    }

    pub fn view(&self) -> JobView {
        self.with(|job| job.view())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.with(|job| job.snapshot())
    }

    pub fn progress(&self) -> ProgressTracker {
        self.with(|job| job.progress().clone())
    }

    pub fn running_tasks(&self) -> Vec<TaskInfo> {
        self.with(|job| job.running_tasks())
    }

    /// Produce the next task for `worker`: reserve partitions, journal the
    /// attempt, begin a transaction with the attempt's label, then bind the
    /// task.
    ///
    /// On error nothing stays reserved and no transaction stays open.
    pub async fn produce_task(
        &self,
        worker: WorkerId,
        transactions: &dyn TransactionCoordinator,
        edit_log: &dyn EditLog,
        ledger: &TxnLedger,
        config: &SchedulerConfig,
    ) -> Result<TaskInfo, ScheduleError> {
        let plan = self
            .with(|job| job.plan_task(worker, config.max_desired_concurrency))
            .ok_or(ScheduleError::NothingToSchedule)?;
        let label = plan.label.clone();
        let (db_id, table_id) = (plan.target.db_id, plan.target.table_id);

        // A label must never be begun twice, even across a restart.
        let attempt = EditLogEntry::Attempt {
            job_id: self.id,
            next_attempt: plan.attempt + 1,
        };
        if let Err(e) = edit_log.append(&attempt).await {
            self.with(|job| job.discard_plan(plan));
            return Err(e.into());
        }

        let begun = transactions.begin(&label, db_id, table_id).await;
        let txn_id = match begun {
            Ok(txn_id) => txn_id,
            Err(e) => {
                self.with(|job| job.discard_plan(plan));
                return Err(e.into());
            }
        };
        if !ledger.claim(txn_id) {
            self.with(|job| job.discard_plan(plan));
            return Err(ScheduleError::TransactionRebound(txn_id));
        }

        let bound = self.with(|job| job.bind_task(plan, txn_id, Utc::now(), config.task_timeout()));
        match bound {
            Ok(task) => {
                debug!(
                    job = %self.name,
                    task = %task.id,
                    label = %task.label,
                    txn = %txn_id,
                    "task bound"
                );
                Ok(task)
            }
            Err(e) => {
                ledger.release(txn_id);
                let aborted = transactions.abort(txn_id, "job no longer schedulable").await;
                if let Err(abort_err) = aborted {
                    warn!(
                        job = %self.name,
                        txn = %txn_id,
                        error = %abort_err,
                        "failed to abort unbound transaction"
                    );
                }
                Err(e)
            }
        }
    }
}
