use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use routine_load_core::config::{profiled_env_opt, profiled_env_u64, profiled_env_usize};
use routine_load_core::{CoreError, WorkerId};
use serde::{Deserialize, Serialize};

/// Scheduler tuning.
///
/// Parsed from TOML, then overridden from `ROUTINE_LOAD_*` environment
/// variables (profiled, see [`routine_load_core::config`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scheduling ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Task slots per worker unless overridden.
    #[serde(default = "default_max_tasks_per_worker")]
    pub default_max_tasks_per_worker: usize,

    /// Per-worker slot overrides.
    #[serde(default)]
    pub worker_max_tasks: Vec<WorkerMaxTasks>,

    /// Consecutive task failures after which a job is paused.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// How long a job paused by failures waits before it is resumed.
    #[serde(default = "default_auto_resume_interval_secs")]
    pub auto_resume_interval_secs: u64,

    #[serde(default = "default_partition_refresh_interval_secs")]
    pub partition_refresh_interval_secs: u64,

    /// Upper bound on any job's concurrency.
    #[serde(default = "default_max_desired_concurrency")]
    pub max_desired_concurrency: usize,

    /// Edit log file. `None` keeps the log in memory.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

/// Slot count for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMaxTasks {
    pub worker: WorkerId,
    pub max_tasks: usize,
}

fn default_tick_interval_ms() -> u64 { 500 }
fn default_max_tasks_per_worker() -> usize { 10 }
fn default_max_consecutive_failures() -> u32 { 3 }
fn default_task_timeout_secs() -> u64 { 20 }
fn default_auto_resume_interval_secs() -> u64 { 300 }
fn default_partition_refresh_interval_secs() -> u64 { 60 }
fn default_max_desired_concurrency() -> usize { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_max_tasks_per_worker: default_max_tasks_per_worker(),
            worker_max_tasks: Vec::new(),
            max_consecutive_failures: default_max_consecutive_failures(),
            task_timeout_secs: default_task_timeout_secs(),
            auto_resume_interval_secs: default_auto_resume_interval_secs(),
            partition_refresh_interval_secs: default_partition_refresh_interval_secs(),
            max_desired_concurrency: default_max_desired_concurrency(),
            journal_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, apply env overrides, and validate.
    pub fn from_toml(toml_str: &str, profile: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.apply_env_overrides(profile);
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>, profile: &str) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content, profile)
    }

    /// Defaults plus env overrides, for runs without a config file.
    pub fn from_env(profile: &str) -> Result<Self, CoreError> {
        let mut config = Self::default();
        config.apply_env_overrides(profile);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, profile: &str) {
        self.tick_interval_ms =
            profiled_env_u64(profile, "ROUTINE_LOAD_TICK_INTERVAL_MS", self.tick_interval_ms);
        self.default_max_tasks_per_worker = profiled_env_usize(
            profile,
            "ROUTINE_LOAD_MAX_TASKS_PER_WORKER",
            self.default_max_tasks_per_worker,
        );
        self.max_consecutive_failures = profiled_env_u64(
            profile,
            "ROUTINE_LOAD_MAX_CONSECUTIVE_FAILURES",
            self.max_consecutive_failures as u64,
        ) as u32;
        self.task_timeout_secs =
            profiled_env_u64(profile, "ROUTINE_LOAD_TASK_TIMEOUT_SECS", self.task_timeout_secs);
        self.auto_resume_interval_secs = profiled_env_u64(
            profile,
            "ROUTINE_LOAD_AUTO_RESUME_INTERVAL_SECS",
            self.auto_resume_interval_secs,
        );
        self.partition_refresh_interval_secs = profiled_env_u64(
            profile,
            "ROUTINE_LOAD_PARTITION_REFRESH_INTERVAL_SECS",
            self.partition_refresh_interval_secs,
        );
        self.max_desired_concurrency = profiled_env_usize(
            profile,
            "ROUTINE_LOAD_MAX_DESIRED_CONCURRENCY",
            self.max_desired_concurrency,
        );
        if let Some(path) = profiled_env_opt(profile, "ROUTINE_LOAD_JOURNAL_PATH") {
            self.journal_path = Some(PathBuf::from(path));
        }
    }

    // ── Validation ──────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), CoreError> {
        let zero = [
            ("tick_interval_ms", self.tick_interval_ms == 0),
            ("default_max_tasks_per_worker", self.default_max_tasks_per_worker == 0),
            ("max_consecutive_failures", self.max_consecutive_failures == 0),
            ("task_timeout_secs", self.task_timeout_secs == 0),
            ("max_desired_concurrency", self.max_desired_concurrency == 0),
        ];
        if let Some((key, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(CoreError::Config(format!("{key} must be positive")));
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn worker_overrides(&self) -> HashMap<WorkerId, usize> {
        self.worker_max_tasks.iter().map(|o| (o.worker, o.max_tasks)).collect()
    }

    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.tick_interval_ms)
    }

    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_timeout_secs as i64)
    }

    pub fn auto_resume_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_resume_interval_secs as i64)
    }

    pub fn partition_refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.partition_refresh_interval_secs as i64)
    }
}
