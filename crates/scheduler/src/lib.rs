//! Routine load scheduling: long-running jobs that continuously ingest from
//! a partitioned source into a table, one transaction per micro-batch task.
//!
//! The [`JobRegistry`] owns every job, places tasks on workers through the
//! [`CapacityPlanner`], and applies execution reports as they come back.

pub mod capacity;
pub mod collaborators;
pub mod config;
pub mod definition;
pub mod error;
pub mod job;
pub mod journal;
pub mod memory;
pub mod metrics;
pub mod progress;
pub mod registry;
pub mod task;

mod sync;

pub use capacity::CapacityPlanner;
pub use collaborators::{AuthContext, ClusterScope, Collaborators, WorkerInfo};
pub use config::SchedulerConfig;
pub use definition::{JobDefinition, SourceType, TableRef};
pub use error::{RegistryError, ScheduleError};
pub use job::{ControlOp, JobEntry, JobRef, JobState, JobView, PauseReason};
pub use journal::{EditLogEntry, FileEditLog};
pub use metrics::SchedulerMetrics;
pub use progress::ProgressTracker;
pub use registry::{JobRegistry, ReportDisposition, TickSummary};
pub use task::{TaskInfo, TaskOutcome, TaskReport};
