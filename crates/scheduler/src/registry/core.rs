use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use indexmap::IndexMap;
use routine_load_core::{DbId, JobId, TaskId};
use tracing::{info, warn};

use crate::capacity::CapacityPlanner;
use crate::collaborators::{AuthContext, Collaborators};
use crate::config::SchedulerConfig;
use crate::definition::JobDefinition;
use crate::error::{JournalError, RegistryError};
use crate::job::{Job, JobEntry, JobRef, JobState, Released, Settlement};
use crate::journal::EditLogEntry;
use crate::metrics::SchedulerMetrics;
use crate::sync::{read, write};
use crate::task::TxnLedger;

/// Registry of every routine load job.
///
/// Lock order: name index, then id index, then a job's own lock. No lock is
/// held across a collaborator call.
pub struct JobRegistry {
    pub(super) config: SchedulerConfig,
    pub(super) collaborators: Collaborators,
    /// Jobs by id, in registration order.
    pub(super) jobs: RwLock<IndexMap<JobId, JobRef>>,
    /// Database → job name → every job that ever had the name, oldest first.
    pub(super) names: RwLock<BTreeMap<DbId, HashMap<String, Vec<JobRef>>>>,
    pub(super) planner: CapacityPlanner,
    /// Transactions bound to live tasks.
    pub(super) ledger: TxnLedger,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) shutdown: Arc<AtomicBool>,
}

impl JobRegistry {
    pub fn new(config: SchedulerConfig, collaborators: Collaborators) -> Self {
        let planner =
            CapacityPlanner::new(config.default_max_tasks_per_worker, config.worker_overrides());
        Self {
            config,
            collaborators,
            jobs: RwLock::new(IndexMap::new()),
            names: RwLock::new(BTreeMap::new()),
            planner,
            ledger: TxnLedger::new(),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    // ── Creation ────────────────────────────────────────────────

    /// Create a job from a definition on behalf of `auth`.
    ///
    /// The job holds its name from the start but is hidden from lookups and
    /// the tick until its creation is journaled. Nothing stays registered if
    /// any step fails, journaling included.
    pub async fn create_job(
        &self,
        def: &JobDefinition,
        auth: &AuthContext,
    ) -> Result<JobId, RegistryError> {
        def.validate()?;
        if !self
            .collaborators
            .privileges
            .check_load_privilege(auth, &def.target.db_name, &def.target.table_name)
        {
            warn!(
                user = %auth.user,
                ip = %auth.remote_ip,
                table = %def.target,
                "load privilege denied"
            );
            return Err(RegistryError::AuthorizationDenied {
                user: auth.user.clone(),
                db: def.target.db_name.clone(),
                table: def.target.table_name.clone(),
            });
        }

        let job = Job::from_definition(def, Utc::now())?;
        let entry = self.register(JobEntry::pending(job))?;

        let journaled = self
            .collaborators
            .edit_log
            .append(&EditLogEntry::CreateJob(entry.snapshot()))
            .await;
        if let Err(e) = journaled {
            warn!(job = %entry.name(), error = %e, "journaling job creation failed, rolling back");
            self.unregister(entry.id());
            return Err(e.into());
        }
        entry.admit();

        info!(
            job = %entry.name(),
            id = %entry.id(),
            table = %def.target,
            concurrency = def.desired_concurrency,
            "routine load job created"
        );
        Ok(entry.id())
    }

    /// Register a job under both indexes.
    ///
    /// Fails with `NameConflict` if an unfinished job in the same database
    /// already has the name.
    pub fn add_job(&self, job: Job) -> Result<JobRef, RegistryError> {
        self.register(JobEntry::new(job))
    }

    fn register(&self, entry: JobRef) -> Result<JobRef, RegistryError> {
        let mut names = write(&self.names);
        let same_name = names
            .entry(entry.db_id())
            .or_default()
            .entry(entry.name().to_string())
            .or_default();
        if same_name.iter().any(|existing| !existing.is_final()) {
            return Err(RegistryError::NameConflict {
                db_id: entry.db_id(),
                name: entry.name().to_string(),
            });
        }
        write(&self.jobs).insert(entry.id(), Arc::clone(&entry));
        same_name.push(Arc::clone(&entry));
        Ok(entry)
    }

    /// Drop a job from both indexes.
    pub(super) fn unregister(&self, id: JobId) -> Option<JobRef> {
        let mut names = write(&self.names);
        let removed = write(&self.jobs).shift_remove(&id)?;
        if let Some(by_name) = names.get_mut(&removed.db_id()) {
            if let Some(list) = by_name.get_mut(removed.name()) {
                list.retain(|job| job.id() != id);
                if list.is_empty() {
                    by_name.remove(removed.name());
                }
            }
            if by_name.is_empty() {
                names.remove(&removed.db_id());
            }
        }
        Some(removed)
    }

    // ── Lookups ─────────────────────────────────────────────────

    pub fn get_job(&self, id: JobId) -> Option<JobRef> {
        read(&self.jobs).get(&id).filter(|job| job.is_admitted()).cloned()
    }

    /// Every job with `name` across databases: unfinished jobs first, then
    /// finished ones, each in database order then creation order.
    pub fn get_job_by_name(&self, name: &str) -> Vec<JobRef> {
        let candidates: Vec<JobRef> = read(&self.names)
            .values()
            .filter_map(|by_name| by_name.get(name))
            .flatten()
            .filter(|job| job.is_admitted())
            .cloned()
            .collect();
        unfinished_first(candidates)
    }

    /// Jobs filtered by database and exact name. Finished jobs are included
    /// only with `include_history`.
    pub fn get_jobs(
        &self,
        db_id: Option<DbId>,
        name: Option<&str>,
        include_history: bool,
    ) -> Vec<JobRef> {
        let candidates: Vec<JobRef> = self
            .all_jobs()
            .into_iter()
            .filter(|job| db_id.map_or(true, |db| job.db_id() == db))
            .filter(|job| name.map_or(true, |n| job.name() == n))
            .collect();
        let ordered = unfinished_first(candidates);
        if include_history {
            ordered
        } else {
            ordered.into_iter().filter(|job| !job.is_final()).collect()
        }
    }

    /// Snapshot of every job, in registration order.
    pub fn all_jobs(&self) -> Vec<JobRef> {
        read(&self.jobs).values().filter(|job| job.is_admitted()).cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        read(&self.jobs).values().filter(|job| job.is_admitted()).count()
    }

    /// Number of tasks currently holding a transaction.
    pub fn live_task_count(&self) -> usize {
        self.ledger.len()
    }

    // ── Metrics & shutdown ──────────────────────────────────────

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        read(&self.metrics).clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Signal the run loop to stop.
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    // ── Settlement ──────────────────────────────────────────────

    /// Release slots and transactions of tasks that left a job.
    pub(super) async fn release_tasks(&self, released: Vec<Released>) {
        for Released { task, reason } in released {
            self.planner.release(task.worker);
            self.ledger.release(task.txn_id);
            write(&self.metrics).tasks_aborted += 1;
            let aborted = self.collaborators.transactions.abort(task.txn_id, &reason).await;
            if let Err(e) = aborted {
                warn!(task = %task.id, txn = %task.txn_id, error = %e, "transaction abort failed");
            }
        }
    }

    /// Apply the side effects of a job mutation: release tasks, then journal
    /// the state change.
    pub(super) async fn settle(
        &self,
        job: &JobRef,
        settlement: Settlement,
    ) -> Result<(), JournalError> {
        self.release_tasks(settlement.released).await;
        match settlement.transition {
            Some((state, reason)) => self.journal_state(job, state, reason).await,
            None => Ok(()),
        }
    }

    pub(super) async fn journal_state(
        &self,
        job: &JobRef,
        state: JobState,
        reason: Option<String>,
    ) -> Result<(), JournalError> {
        let entry = EditLogEntry::ChangeState {
            job_id: job.id(),
            state,
            reason,
            at: Utc::now(),
        };
        self.collaborators.edit_log.append(&entry).await
    }

    /// Like [`Self::settle`] for background paths: journal failures are logged.
    pub(super) async fn settle_logged(&self, job: &JobRef, settlement: Settlement) {
        if let Err(e) = self.settle(job, settlement).await {
            warn!(job = %job.name(), error = %e, "journaling state change failed");
        }
    }

    /// Fail one running task. Returns false if the task was not live.
    pub(super) async fn fail_task(&self, job: &JobRef, task_id: TaskId, reason: &str) -> bool {
        let now = Utc::now();
        let max_failures = self.config.max_consecutive_failures;
        let settlement = job.with(|j| j.fail_task(task_id, reason, now, max_failures));
        match settlement {
            Some(settlement) => {
                warn!(job = %job.name(), task = %task_id, reason, "task failed");
                self.settle_logged(job, settlement).await;
                true
            }
            None => false,
        }
    }
}

/// Stable partition into unfinished jobs followed by finished ones.
fn unfinished_first(jobs: Vec<JobRef>) -> Vec<JobRef> {
    let (mut unfinished, finished): (Vec<_>, Vec<_>) =
        jobs.into_iter().partition(|job| !job.is_final());
    unfinished.extend(finished);
    unfinished
}
