use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::journal::EditLogEntry;
use crate::sync::write;
use crate::task::{TaskOutcome, TaskReport};

use super::JobRegistry;

/// How an execution report was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReportDisposition {
    /// Offsets were committed and merged into progress.
    Committed,
    /// The task was failed and its transaction aborted.
    Aborted,
    /// The report named a task that is no longer live. Nothing changed.
    Stale,
}

impl JobRegistry {
    /// Apply an execution report from a worker.
    ///
    /// A commit goes through the transaction coordinator before progress
    /// moves. A failed commit call is handled as an aborted task.
    pub async fn apply_report(
        &self,
        report: TaskReport,
    ) -> Result<ReportDisposition, RegistryError> {
        let Some(job) = self.get_job(report.job_id) else {
            return Ok(self.stale(&report, "unknown job"));
        };

        match report.outcome {
            TaskOutcome::Committed { ref offsets } => {
                let Some(task) = job.with(|j| j.begin_commit(report.task_id)) else {
                    return Ok(self.stale(&report, "task is not live"));
                };

                let committed = self.collaborators.transactions.commit(task.txn_id, offsets).await;
                if let Err(e) = committed {
                    warn!(
                        job = %job.name(),
                        task = %task.id,
                        txn = %task.txn_id,
                        error = %e,
                        "commit failed"
                    );
                    job.with(|j| j.abandon_commit(task.id));
                    self.fail_task(&job, task.id, &format!("commit failed: {e}")).await;
                    return Ok(ReportDisposition::Aborted);
                }

                let Some(applied) = job.with(|j| j.finish_commit(task.id, offsets)) else {
                    return Ok(self.stale(&report, "task left before commit finished"));
                };
                self.planner.release(applied.task.worker);
                self.ledger.release(applied.task.txn_id);
                write(&self.metrics).tasks_committed += 1;
                info!(
                    job = %job.name(),
                    task = %applied.task.id,
                    label = %applied.task.label,
                    partitions = offsets.len(),
                    "task committed"
                );

                self.collaborators
                    .edit_log
                    .append(&EditLogEntry::Progress {
                        job_id: job.id(),
                        progress: applied.progress,
                        next_attempt: applied.next_attempt,
                    })
                    .await?;
                Ok(ReportDisposition::Committed)
            }
            TaskOutcome::Failed { ref reason } => {
                if self.fail_task(&job, report.task_id, reason).await {
                    Ok(ReportDisposition::Aborted)
                } else {
                    Ok(self.stale(&report, "task is not live"))
                }
            }
        }
    }

    fn stale(&self, report: &TaskReport, why: &str) -> ReportDisposition {
        debug!(job = %report.job_id, task = %report.task_id, why, "discarding stale report");
        write(&self.metrics).stale_reports += 1;
        ReportDisposition::Stale
    }
}
