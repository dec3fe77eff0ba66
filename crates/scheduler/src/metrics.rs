use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Completed scheduling ticks.
    pub ticks: u64,
    /// Tasks accepted by a worker.
    pub tasks_dispatched: u64,
    pub tasks_committed: u64,
    /// Tasks that failed, were drained, or whose commit failed.
    pub tasks_aborted: u64,
    /// Tasks failed for missing their deadline.
    pub tasks_expired: u64,
    /// Transaction begins that failed during task production.
    pub begin_failures: u64,
    pub dispatch_failures: u64,
    /// Reports for tasks that were no longer live.
    pub stale_reports: u64,
    /// Idle slots across all workers at the end of the last tick.
    pub idle_slots: usize,
    pub running_tasks: usize,
    pub last_tick: Option<DateTime<Utc>>,
    pub avg_tick_duration: Duration,
}

impl SchedulerMetrics {
    /// Record a finished tick.
    pub fn record_tick(&mut self, duration: Duration) {
        self.ticks += 1;
        self.last_tick = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_tick_duration = if self.ticks == 1 {
            duration
        } else {
            let prev_nanos = self.avg_tick_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.ticks as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}
