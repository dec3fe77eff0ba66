use std::collections::BTreeMap;

use chrono::Utc;
use routine_load_core::WorkerId;
use tracing::{debug, warn};

use crate::capacity::WorkerSlots;
use crate::collaborators::ClusterScope;
use crate::error::RegistryError;

use super::JobRegistry;

impl JobRegistry {
    /// Re-read cluster membership and replace the planner's worker set.
    ///
    /// Tasks placed on workers that left are failed. Returns how many.
    pub async fn update_worker_capacity(&self) -> Result<usize, RegistryError> {
        let workers = self.collaborators.membership.list_workers(&ClusterScope::All).await?;
        let departed = self.planner.reconcile(&workers);
        if departed.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let max_failures = self.config.max_consecutive_failures;
        let mut lost = 0;
        for job in self.all_jobs() {
            for &worker in &departed {
                let settlement = job.with(|j| j.fail_worker_tasks(worker, now, max_failures));
                if settlement.is_empty() {
                    continue;
                }
                lost += settlement.released.len();
                warn!(
                    job = %job.name(),
                    %worker,
                    tasks = settlement.released.len(),
                    "worker left with running tasks"
                );
                self.settle_logged(&job, settlement).await;
            }
        }
        debug!(departed = departed.len(), lost, "worker capacity updated");
        Ok(lost)
    }

    /// Least loaded worker of `cluster`, lowest id on ties.
    pub fn get_min_task_worker_id(&self, cluster: &str) -> Result<WorkerId, RegistryError> {
        self.planner
            .least_loaded(&ClusterScope::named(cluster))
            .ok_or_else(|| RegistryError::CapacityUnavailable(cluster.to_string()))
    }

    /// Idle task slots summed over every known worker.
    pub fn get_cluster_idle_slot_num(&self) -> usize {
        self.planner.total_idle_slots(&ClusterScope::All)
    }

    pub fn worker_slots(&self) -> BTreeMap<WorkerId, WorkerSlots> {
        self.planner.snapshot()
    }
}
