use chrono::{DateTime, Utc};
use routine_load_core::DbId;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::job::{Job, JobSnapshot, JobState};
use crate::journal::EditLogEntry;
use crate::sync::read;

use super::JobRegistry;

/// Counts from an edit log replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub entries: usize,
    pub jobs_created: usize,
    pub jobs_purged: usize,
    /// Entries naming a job the log never created.
    pub orphaned: usize,
    /// Older jobs cancelled because a later creation reused their name.
    pub superseded: usize,
}

impl JobRegistry {
    /// Rebuild jobs from edit log entries, oldest first.
    ///
    /// No task survives a restart: jobs that were running come back as
    /// NEED_SCHEDULE and resume from their last journaled progress.
    pub fn replay(&self, entries: &[EditLogEntry]) -> Result<ReplaySummary, RegistryError> {
        let mut summary = ReplaySummary {
            entries: entries.len(),
            ..ReplaySummary::default()
        };

        for entry in entries {
            match entry {
                EditLogEntry::CreateJob(snapshot) => {
                    summary.superseded += self.restore_job(snapshot)?;
                    summary.jobs_created += 1;
                    continue;
                }
                EditLogEntry::Purge { job_id } => {
                    if self.unregister(*job_id).is_some() {
                        summary.jobs_purged += 1;
                        continue;
                    }
                }
                EditLogEntry::ChangeState {
                    job_id,
                    state,
                    reason,
                    at,
                } => {
                    if let Some(job) = self.get_job(*job_id) {
                        job.with(|j| j.restore_state(*state, reason.clone(), *at));
                        continue;
                    }
                }
                EditLogEntry::Attempt {
                    job_id,
                    next_attempt,
                } => {
                    if let Some(job) = self.get_job(*job_id) {
                        job.with(|j| j.restore_attempt(*next_attempt));
                        continue;
                    }
                }
                EditLogEntry::Progress {
                    job_id,
                    progress,
                    next_attempt,
                } => {
                    if let Some(job) = self.get_job(*job_id) {
                        job.with(|j| j.restore_progress(progress.clone(), *next_attempt));
                        continue;
                    }
                }
            }
            warn!(job = %entry.job_id(), "journal entry for unknown job");
            summary.orphaned += 1;
        }

        info!(
            entries = summary.entries,
            jobs = self.job_count(),
            purged = summary.jobs_purged,
            superseded = summary.superseded,
            "edit log replayed"
        );
        Ok(summary)
    }

    /// Register a journaled job. A log written before control changes were
    /// journaled first can hold a newer creation while an older job with the
    /// same name still looks unfinished. The newer creation wins and the older
    /// jobs are cancelled. Returns how many were cancelled.
    fn restore_job(&self, snapshot: &JobSnapshot) -> Result<usize, RegistryError> {
        match self.add_job(Job::from_snapshot(snapshot.clone())) {
            Ok(_) => Ok(0),
            Err(RegistryError::NameConflict { db_id, name }) => {
                let superseded = self.supersede(db_id, &name, snapshot.created_at);
                warn!(
                    job = %name,
                    db = %db_id,
                    superseded,
                    "newer job creation reuses an unfinished name"
                );
                self.add_job(Job::from_snapshot(snapshot.clone()))?;
                Ok(superseded)
            }
            Err(e) => Err(e),
        }
    }

    fn supersede(&self, db_id: DbId, name: &str, at: DateTime<Utc>) -> usize {
        let generations = read(&self.names)
            .get(&db_id)
            .and_then(|by_name| by_name.get(name))
            .cloned()
            .unwrap_or_default();
        let mut superseded = 0;
        for job in generations.iter().filter(|job| !job.is_final()) {
            let reason = Some("superseded by a newer job with the same name".to_string());
            job.with(|j| j.restore_state(JobState::Cancelled, reason, at));
            superseded += 1;
        }
        superseded
    }
}
