use std::sync::atomic::Ordering;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collaborators::ClusterScope;
use crate::error::{DiscoveryError, ScheduleError};
use crate::job::{JobRef, JobState, SourceConfig};
use crate::journal::EditLogEntry;
use crate::sync::write;

use super::JobRegistry;

/// What one scheduling tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub dispatched: usize,
    pub begin_failures: usize,
    pub dispatch_failures: usize,
    /// Tasks failed for missing their deadline.
    pub expired: usize,
    /// Tasks failed because their worker left.
    pub lost: usize,
    pub resumed: usize,
    /// Set when no worker had an idle slot.
    pub no_capacity: bool,
}

impl JobRegistry {
    /// Run the scheduling loop until shutdown is signaled.
    pub async fn run(&self) {
        info!(
            tick_ms = self.config.tick_interval_ms,
            jobs = self.job_count(),
            "Scheduler starting"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let summary = self.tick().await;
            if summary.dispatched > 0 || summary.expired > 0 || summary.lost > 0 {
                debug!(?summary, "tick finished");
            }
        }
        info!("Scheduler stopped");
    }

    /// One scheduling pass: reconcile workers, expire and resume, refresh
    /// partitions, then place new tasks.
    pub async fn tick(&self) -> TickSummary {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = TickSummary::default();

        match self.update_worker_capacity().await {
            Ok(lost) => summary.lost = lost,
            Err(e) => warn!(error = %e, "worker capacity update failed, keeping last snapshot"),
        }
        summary.expired = self.expire_overdue_tasks(now).await;
        summary.resumed = self.auto_resume_jobs(now).await;
        self.refresh_partitions(now).await;
        self.schedule_tasks(&mut summary).await;

        let idle = self.get_cluster_idle_slot_num();
        let running = self.ledger.len();
        let mut metrics = write(&self.metrics);
        metrics.idle_slots = idle;
        metrics.running_tasks = running;
        metrics.tasks_expired += summary.expired as u64;
        metrics.record_tick(started.elapsed());
        summary
    }

    /// Fail every task past its deadline. Returns how many were released.
    pub(super) async fn expire_overdue_tasks(&self, now: DateTime<Utc>) -> usize {
        let max_failures = self.config.max_consecutive_failures;
        let mut expired = 0;
        for job in self.all_jobs() {
            let settlement = job.with(|j| j.expire_overdue(now, max_failures));
            if settlement.is_empty() {
                continue;
            }
            expired += settlement.released.len();
            warn!(
                job = %job.name(),
                tasks = settlement.released.len(),
                "tasks exceeded their deadline"
            );
            self.settle_logged(&job, settlement).await;
        }
        expired
    }

    pub(super) async fn auto_resume_jobs(&self, now: DateTime<Utc>) -> usize {
        let interval = self.config.auto_resume_interval();
        let mut resumed = 0;
        for job in self.all_jobs() {
            if let Some(settlement) = job.with(|j| j.try_auto_resume(now, interval)) {
                resumed += 1;
                self.settle_logged(&job, settlement).await;
            }
        }
        resumed
    }

    /// Re-read partitions of sources without an explicit partition list.
    /// A topic that no longer exists cancels the job.
    pub(super) async fn refresh_partitions(&self, now: DateTime<Utc>) {
        let interval = self.config.partition_refresh_interval();
        for job in self.all_jobs() {
            let due = job.with(|j| match j.source() {
                SourceConfig::Kafka(kafka)
                    if !j.is_final() && kafka.needs_refresh(now, interval) =>
                {
                    Some((kafka.brokers.clone(), kafka.topic.clone()))
                }
                _ => None,
            });
            let Some((brokers, topic)) = due else {
                continue;
            };

            let listed = self.collaborators.discovery.list_partitions(&brokers, &topic).await;
            match listed {
                Ok(partitions) => {
                    let added = job.with(|j| {
                        let SourceConfig::Kafka(kafka) = j.source_mut();
                        kafka.apply_discovered(partitions, now)
                    });
                    if !added.is_empty() {
                        info!(job = %job.name(), %topic, ?added, "discovered new partitions");
                    }
                }
                Err(DiscoveryError::TopicNotFound(topic)) => {
                    let reason = format!("kafka topic '{topic}' does not exist");
                    let cancelled = job.with(|j| j.cancel(&reason, now));
                    if let Ok(settlement) = cancelled {
                        warn!(job = %job.name(), %reason, "cancelling job");
                        self.settle_logged(&job, settlement).await;
                    }
                }
                Err(e) => {
                    warn!(job = %job.name(), %topic, error = %e, "partition discovery failed");
                    job.with(|j| j.record_error(e.to_string()));
                }
            }
        }
    }

    /// Place tasks for every job below its concurrency while slots remain.
    async fn schedule_tasks(&self, summary: &mut TickSummary) {
        if self.get_cluster_idle_slot_num() == 0 {
            debug!("no idle task slots, skipping placement");
            summary.no_capacity = true;
            return;
        }

        let max_concurrency = self.config.max_desired_concurrency;
        let schedulable: Vec<JobRef> = self
            .all_jobs()
            .into_iter()
            .filter(|job| job.state().is_schedulable())
            .collect();

        for job in schedulable {
            let scope = ClusterScope::named(job.cluster());
            while job.with(|j| j.wants_task(max_concurrency)) {
                let Some(worker) = self.planner.reserve_least_loaded(&scope) else {
                    debug!(job = %job.name(), cluster = %job.cluster(), "no idle slot in cluster");
                    break;
                };

                let produced = job
                    .produce_task(
                        worker,
                        &*self.collaborators.transactions,
                        &*self.collaborators.edit_log,
                        &self.ledger,
                        &self.config,
                    )
                    .await;
                let task = match produced {
                    Ok(task) => task,
                    Err(ScheduleError::NothingToSchedule) => {
                        self.planner.release(worker);
                        break;
                    }
                    Err(e) => {
                        self.planner.release(worker);
                        warn!(
                            job = %job.name(),
                            error = %e,
                            "task production failed, retrying next tick"
                        );
                        summary.begin_failures += 1;
                        write(&self.metrics).begin_failures += 1;
                        break;
                    }
                };

                let dispatched = self.collaborators.dispatcher.dispatch(worker, &task).await;
                if let Err(e) = dispatched {
                    summary.dispatch_failures += 1;
                    write(&self.metrics).dispatch_failures += 1;
                    self.fail_task(&job, task.id, &format!("dispatch to worker failed: {e}")).await;
                    break;
                }

                summary.dispatched += 1;
                write(&self.metrics).tasks_dispatched += 1;
                debug!(
                    job = %job.name(),
                    task = %task.id,
                    %worker,
                    label = %task.label,
                    "task dispatched"
                );
                if job.with(|j| j.mark_dispatched()) {
                    let entry = EditLogEntry::ChangeState {
                        job_id: job.id(),
                        state: JobState::Running,
                        reason: None,
                        at: Utc::now(),
                    };
                    if let Err(e) = self.collaborators.edit_log.append(&entry).await {
                        warn!(job = %job.name(), error = %e, "journaling state change failed");
                    }
                }
            }
        }
    }
}
