//! Per-worker task slot accounting.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use routine_load_core::WorkerId;
use serde::Serialize;
use tracing::{debug, info};

use crate::collaborators::{ClusterScope, WorkerInfo};
use crate::sync::{read, write};

/// Slot usage of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSlots {
    pub cluster: String,
    pub max_tasks: usize,
    pub running: usize,
}

impl WorkerSlots {
    pub fn idle(&self) -> usize {
        self.max_tasks.saturating_sub(self.running)
    }
}

/// Tracks how many tasks each worker runs against its maximum.
///
/// The worker set is replaced wholesale by [`CapacityPlanner::reconcile`];
/// running counts survive for workers present in both snapshots.
#[derive(Debug)]
pub struct CapacityPlanner {
    default_max_tasks: usize,
    max_task_overrides: HashMap<WorkerId, usize>,
    workers: RwLock<BTreeMap<WorkerId, WorkerSlots>>,
}

impl CapacityPlanner {
    pub fn new(default_max_tasks: usize, max_task_overrides: HashMap<WorkerId, usize>) -> Self {
        Self {
            default_max_tasks,
            max_task_overrides,
            workers: RwLock::new(BTreeMap::new()),
        }
    }

    fn max_tasks_for(&self, worker: WorkerId) -> usize {
        self.max_task_overrides
            .get(&worker)
            .copied()
            .unwrap_or(self.default_max_tasks)
    }

    /// Replace the known workers. Returns the workers that left.
    pub fn reconcile(&self, snapshot: &[WorkerInfo]) -> Vec<WorkerId> {
        let mut workers = write(&self.workers);
        let mut next = BTreeMap::new();
        for info in snapshot {
            let running = workers.get(&info.id).map(|w| w.running).unwrap_or(0);
            next.insert(
                info.id,
                WorkerSlots {
                    cluster: info.cluster.clone(),
                    max_tasks: self.max_tasks_for(info.id),
                    running,
                },
            );
        }
        let departed: Vec<WorkerId> =
            workers.keys().filter(|id| !next.contains_key(id)).copied().collect();
        let joined = next.keys().filter(|id| !workers.contains_key(id)).count();
        if !departed.is_empty() || joined > 0 {
            info!(
                workers = next.len(),
                joined,
                departed = departed.len(),
                "worker set changed"
            );
        }
        *workers = next;
        departed
    }

    pub fn idle_slots(&self, worker: WorkerId) -> usize {
        read(&self.workers).get(&worker).map(WorkerSlots::idle).unwrap_or(0)
    }

    pub fn total_idle_slots(&self, scope: &ClusterScope) -> usize {
        read(&self.workers)
            .values()
            .filter(|w| scope.contains(&w.cluster))
            .map(WorkerSlots::idle)
            .sum()
    }

    /// Worker with the fewest running tasks, lowest id on ties.
    pub fn least_loaded(&self, scope: &ClusterScope) -> Option<WorkerId> {
        read(&self.workers)
            .iter()
            .filter(|(_, w)| scope.contains(&w.cluster))
            .min_by_key(|(id, w)| (w.running, **id))
            .map(|(id, _)| *id)
    }

    /// Take a slot on the least loaded worker that still has one.
    pub fn reserve_least_loaded(&self, scope: &ClusterScope) -> Option<WorkerId> {
        let mut workers = write(&self.workers);
        let (id, slots) = workers
            .iter_mut()
            .filter(|(_, w)| scope.contains(&w.cluster) && w.idle() > 0)
            .min_by_key(|(id, w)| (w.running, **id))?;
        slots.running += 1;
        debug!(worker = %id, running = slots.running, max = slots.max_tasks, "reserved task slot");
        Some(*id)
    }

    /// Give a slot back. Unknown workers are ignored.
    pub fn release(&self, worker: WorkerId) {
        if let Some(slots) = write(&self.workers).get_mut(&worker) {
            slots.running = slots.running.saturating_sub(1);
        }
    }

    pub fn running(&self, worker: WorkerId) -> Option<usize> {
        read(&self.workers).get(&worker).map(|w| w.running)
    }

    pub fn snapshot(&self) -> BTreeMap<WorkerId, WorkerSlots> {
        read(&self.workers).clone()
    }

    pub fn worker_count(&self) -> usize {
        read(&self.workers).len()
    }
}
