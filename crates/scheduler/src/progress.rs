//! Per-job consumption cursor over source partitions.

use std::collections::BTreeMap;

use routine_load_core::{Offset, PartitionId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Partition → last committed offset.
///
/// Offsets only move forward. A merge that would move a partition backwards
/// comes from a stale task and is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressTracker {
    offsets: BTreeMap<PartitionId, Offset>,
}

/// What a merge did to the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Partitions whose committed offset moved forward (or were seen for the first time).
    pub advanced: Vec<PartitionId>,
    /// Partitions whose reported offset was behind the tracker.
    pub regressed: Vec<PartitionId>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_offsets(offsets: BTreeMap<PartitionId, Offset>) -> Self {
        Self { offsets }
    }

    /// Last committed offset for a partition, if anything was committed.
    pub fn get(&self, partition: PartitionId) -> Option<Offset> {
        self.offsets.get(&partition).copied()
    }

    pub fn offsets(&self) -> &BTreeMap<PartitionId, Offset> {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Merge the offsets a committed task reported.
    pub fn merge(&mut self, committed: &BTreeMap<PartitionId, Offset>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for (&partition, &offset) in committed {
            match self.offsets.get(&partition).copied() {
                Some(current) if offset < current => {
                    warn!(
                        partition,
                        current, offset, "ignoring committed offset behind progress"
                    );
                    outcome.regressed.push(partition);
                }
                Some(current) if offset == current => {}
                _ => {
                    self.offsets.insert(partition, offset);
                    outcome.advanced.push(partition);
                }
            }
        }
        outcome
    }

    /// Serialize as a checkpoint: `{"<partition>": offset, ...}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Restore from a checkpoint written by [`ProgressTracker::to_json`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
