//! Edit log entries and the JSON-lines file log.
//!
//! One entry per line:
//! ```text
//! {"create_job":{"id":"…","name":"orders",…}}
//! {"change_state":{"job_id":"…","state":"PAUSED","reason":"paused by user","at":"…"}}
//! {"attempt":{"job_id":"…","next_attempt":3}}
//! {"progress":{"job_id":"…","progress":{"0":100},"next_attempt":3}}
//! {"purge":{"job_id":"…"}}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routine_load_core::JobId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collaborators::EditLog;
use crate::error::JournalError;
use crate::job::{JobSnapshot, JobState};
use crate::progress::ProgressTracker;
use crate::sync::lock;

/// A durable registry mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditLogEntry {
    CreateJob(JobSnapshot),
    ChangeState {
        job_id: JobId,
        state: JobState,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// Written when a task attempt is planned, before its transaction begins.
    Attempt {
        job_id: JobId,
        next_attempt: u64,
    },
    Progress {
        job_id: JobId,
        progress: ProgressTracker,
        next_attempt: u64,
    },
    Purge {
        job_id: JobId,
    },
}

impl EditLogEntry {
    pub fn job_id(&self) -> JobId {
        match self {
            EditLogEntry::CreateJob(snapshot) => snapshot.id,
            EditLogEntry::ChangeState { job_id, .. }
            | EditLogEntry::Attempt { job_id, .. }
            | EditLogEntry::Progress { job_id, .. }
            | EditLogEntry::Purge { job_id } => *job_id,
        }
    }
}

/// Append-only JSON-lines edit log.
pub struct FileEditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileEditLog {
    /// Open (or create) the log at `path`, creating parent directories.
    ///
    /// A torn final line is cut off first, so new entries start on a line of
    /// their own.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::truncate_torn_tail(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn truncate_torn_tail(path: &Path) -> Result<(), JournalError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.is_empty() || contents.ends_with(b"\n") {
            return Ok(());
        }
        let keep = contents.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        warn!(
            path = %path.display(),
            dropped_bytes = contents.len() - keep,
            "truncating torn journal tail"
        );
        file.set_len(keep as u64)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry of the log at `path`. A missing file is an empty log.
    ///
    /// A torn final line (a crash mid-append) is skipped; a malformed line
    /// anywhere else is an error.
    pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<EditLogEntry>, JournalError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i == last => {
                    warn!(path = %path.display(), error = %e, "skipping torn journal tail");
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(path = %path.display(), entries = entries.len(), "journal read");
        Ok(entries)
    }
}

#[async_trait]
impl EditLog for FileEditLog {
    async fn append(&self, entry: &EditLogEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = lock(&self.file);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
