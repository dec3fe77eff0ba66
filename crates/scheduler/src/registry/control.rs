use chrono::{Duration, Utc};
use routine_load_core::{DbId, JobId, TableId};
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::job::{ControlOp, JobRef};
use crate::journal::EditLogEntry;
use crate::sync::read;

use super::JobRegistry;

impl JobRegistry {
    pub async fn pause_job(&self, id: JobId) -> Result<(), RegistryError> {
        self.control(self.require(id)?, ControlOp::Pause).await
    }

    pub async fn resume_job(&self, id: JobId) -> Result<(), RegistryError> {
        self.control(self.require(id)?, ControlOp::Resume).await
    }

    pub async fn stop_job(&self, id: JobId) -> Result<(), RegistryError> {
        self.control(self.require(id)?, ControlOp::Stop).await
    }

    pub async fn cancel_job(&self, id: JobId, reason: &str) -> Result<(), RegistryError> {
        self.control(self.require(id)?, ControlOp::Cancel(reason.to_string())).await
    }

    pub async fn pause_job_by_name(&self, db_id: DbId, name: &str) -> Result<(), RegistryError> {
        self.control(self.resolve_name(db_id, name)?, ControlOp::Pause).await
    }

    pub async fn resume_job_by_name(&self, db_id: DbId, name: &str) -> Result<(), RegistryError> {
        self.control(self.resolve_name(db_id, name)?, ControlOp::Resume).await
    }

    pub async fn stop_job_by_name(&self, db_id: DbId, name: &str) -> Result<(), RegistryError> {
        self.control(self.resolve_name(db_id, name)?, ControlOp::Stop).await
    }

    pub async fn cancel_job_by_name(
        &self,
        db_id: DbId,
        name: &str,
        reason: &str,
    ) -> Result<(), RegistryError> {
        let job = self.resolve_name(db_id, name)?;
        self.control(job, ControlOp::Cancel(reason.to_string())).await
    }

    /// Cancel every unfinished job loading into a dropped table.
    pub async fn on_table_dropped(&self, table_id: TableId) -> usize {
        let affected: Vec<JobRef> = self
            .all_jobs()
            .into_iter()
            .filter(|job| job.table_id() == table_id && !job.is_final())
            .collect();
        let mut cancelled = 0;
        for job in affected {
            let reason = format!("target table {table_id} was dropped");
            match self.control(job, ControlOp::Cancel(reason)).await {
                Ok(()) => cancelled += 1,
                Err(RegistryError::JobAlreadyFinal { .. }) => {}
                Err(e) => {
                    warn!(table = %table_id, error = %e, "cancelling job of dropped table failed")
                }
            }
        }
        cancelled
    }

    /// Remove finished jobs that ended more than `retention` ago.
    pub async fn purge_final_jobs(&self, retention: Duration) -> Result<usize, RegistryError> {
        let cutoff = Utc::now() - retention;
        let expired: Vec<JobRef> = self
            .all_jobs()
            .into_iter()
            .filter(|job| {
                job.with(|j| j.is_final() && j.end_at().is_some_and(|end| end <= cutoff))
            })
            .collect();

        let mut purged = 0;
        for job in expired {
            self.collaborators
                .edit_log
                .append(&EditLogEntry::Purge { job_id: job.id() })
                .await?;
            self.unregister(job.id());
            info!(job = %job.name(), id = %job.id(), "purged finished job");
            purged += 1;
        }
        Ok(purged)
    }

    fn require(&self, id: JobId) -> Result<JobRef, RegistryError> {
        self.get_job(id).ok_or_else(|| RegistryError::JobNotFound(id.to_string()))
    }

    /// The unfinished job with `name` in `db_id`, else its latest finished one.
    fn resolve_name(&self, db_id: DbId, name: &str) -> Result<JobRef, RegistryError> {
        let generations: Vec<JobRef> = read(&self.names)
            .get(&db_id)
            .and_then(|by_name| by_name.get(name))
            .map(|jobs| jobs.iter().filter(|job| job.is_admitted()).cloned().collect())
            .unwrap_or_default();
        generations
            .iter()
            .find(|job| !job.is_final())
            .or_else(|| generations.last())
            .cloned()
            .ok_or_else(|| RegistryError::JobNotFound(format!("{name} in database {db_id}")))
    }

    /// Journal the state `op` leads to, then apply it. A journal failure
    /// leaves the job untouched.
    async fn control(&self, job: JobRef, op: ControlOp) -> Result<(), RegistryError> {
        let (state, reason) = job.with(|j| j.control_target(&op))?;
        self.journal_state(&job, state, reason).await?;

        // The job may have moved on while the entry was written.
        let settlement = job.with(|j| j.apply_control(&op, Utc::now()))?;
        info!(
            job = %job.name(),
            op = op.name(),
            drained = settlement.released.len(),
            "job control applied"
        );
        self.release_tasks(settlement.released).await;
        Ok(())
    }
}
