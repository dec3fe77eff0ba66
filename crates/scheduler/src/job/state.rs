use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Registered, waiting for its first task to be dispatched.
    NeedSchedule,
    /// At least one task has been dispatched.
    Running,
    /// No new tasks are produced until the job is resumed.
    Paused,
    /// Stopped by a user. Final.
    Stopped,
    /// Cancelled after an unrecoverable error. Final.
    Cancelled,
}

impl JobState {
    pub fn is_final(self) -> bool {
        matches!(self, JobState::Stopped | JobState::Cancelled)
    }

    /// States in which the tick may produce tasks for the job.
    pub fn is_schedulable(self) -> bool {
        matches!(self, JobState::NeedSchedule | JobState::Running)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (NeedSchedule, Running) => true,
            (NeedSchedule | Running, Paused) => true,
            (Paused, NeedSchedule) => true,
            (NeedSchedule | Running | Paused, Stopped) => true,
            (NeedSchedule | Running | Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::NeedSchedule => write!(f, "NEED_SCHEDULE"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Paused => write!(f, "PAUSED"),
            JobState::Stopped => write!(f, "STOPPED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Why a job is paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    /// Paused by an explicit user request.
    User,
    /// Too many consecutive task failures. Eligible for automatic resume.
    TooManyFailures { failures: u32, last_error: String },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::User => write!(f, "paused by user"),
            PauseReason::TooManyFailures {
                failures,
                last_error,
            } => write!(f, "{failures} consecutive task failures, last error: {last_error}"),
        }
    }
}
