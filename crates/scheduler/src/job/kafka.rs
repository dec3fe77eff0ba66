//! Kafka source variant: property decoding, partition discovery and task payloads.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use routine_load_core::{Offset, PartitionId};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::progress::ProgressTracker;
use crate::task::{KafkaTaskPayload, StartOffset};

pub const KAFKA_BROKER_LIST_PROPERTY: &str = "kafka_broker_list";
pub const KAFKA_TOPIC_PROPERTY: &str = "kafka_topic";
pub const KAFKA_PARTITIONS_PROPERTY: &str = "kafka_partitions";
pub const KAFKA_OFFSETS_PROPERTY: &str = "kafka_offsets";
pub const KAFKA_DEFAULT_OFFSETS_PROPERTY: &str = "kafka_default_offsets";

const KNOWN_PROPERTIES: [&str; 5] = [
    KAFKA_BROKER_LIST_PROPERTY,
    KAFKA_TOPIC_PROPERTY,
    KAFKA_PARTITIONS_PROPERTY,
    KAFKA_OFFSETS_PROPERTY,
    KAFKA_DEFAULT_OFFSETS_PROPERTY,
];

const OFFSET_BEGINNING: &str = "OFFSET_BEGINNING";
const OFFSET_END: &str = "OFFSET_END";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaSource {
    pub brokers: String,
    pub topic: String,
    /// Partitions fixed by the definition. Disables discovery.
    pub explicit_partitions: Option<Vec<PartitionId>>,
    /// Start positions given in the definition, by partition.
    pub initial_offsets: BTreeMap<PartitionId, Offset>,
    /// Start position for partitions with neither progress nor an initial offset.
    pub default_offset: StartOffset,
    /// Current partition set of the topic.
    pub partitions: Vec<PartitionId>,
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
}

impl KafkaSource {
    /// Decode the custom properties of a job definition.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self, RegistryError> {
        if let Some(unknown) = properties
            .keys()
            .find(|k| !KNOWN_PROPERTIES.contains(&k.as_str()))
        {
            return Err(malformed(format!("unknown kafka property '{unknown}'")));
        }

        let brokers = required(properties, KAFKA_BROKER_LIST_PROPERTY)?;
        if brokers.split(',').any(|b| b.trim().is_empty()) {
            return Err(malformed(format!("{KAFKA_BROKER_LIST_PROPERTY} has an empty entry")));
        }
        let topic = required(properties, KAFKA_TOPIC_PROPERTY)?;

        let explicit_partitions = match properties.get(KAFKA_PARTITIONS_PROPERTY) {
            Some(raw) => Some(parse_partitions(raw)?),
            None => None,
        };

        let initial_offsets = match properties.get(KAFKA_OFFSETS_PROPERTY) {
            Some(raw) => {
                let Some(partitions) = &explicit_partitions else {
                    return Err(malformed(format!(
                        "{KAFKA_OFFSETS_PROPERTY} requires {KAFKA_PARTITIONS_PROPERTY}"
                    )));
                };
                let offsets = parse_offsets(raw)?;
                if offsets.len() != partitions.len() {
                    return Err(malformed(format!(
                        "{} partitions but {} offsets",
                        partitions.len(),
                        offsets.len()
                    )));
                }
                partitions.iter().copied().zip(offsets).collect()
            }
            None => BTreeMap::new(),
        };

        let default_offset = match properties
            .get(KAFKA_DEFAULT_OFFSETS_PROPERTY)
            .map(|s| s.trim())
        {
            None | Some(OFFSET_BEGINNING) => StartOffset::Beginning,
            Some(OFFSET_END) => StartOffset::End,
            Some(other) => {
                return Err(malformed(format!(
                    "{KAFKA_DEFAULT_OFFSETS_PROPERTY} must be {OFFSET_BEGINNING} or {OFFSET_END}, \
                     got '{other}'"
                )))
            }
        };

        let partitions = explicit_partitions.clone().unwrap_or_default();
        Ok(Self {
            brokers,
            topic,
            explicit_partitions,
            initial_offsets,
            default_offset,
            partitions,
            last_refresh: None,
        })
    }

    /// Whether partitions should be re-read from the brokers.
    pub fn needs_refresh(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        if self.explicit_partitions.is_some() {
            return false;
        }
        match self.last_refresh {
            None => true,
            Some(last) => now - last >= interval,
        }
    }

    /// Replace the discovered partition set. Returns partitions that are new.
    pub fn apply_discovered(
        &mut self,
        mut discovered: Vec<PartitionId>,
        now: DateTime<Utc>,
    ) -> Vec<PartitionId> {
        discovered.sort_unstable();
        discovered.dedup();
        let known: BTreeSet<_> = self.partitions.iter().copied().collect();
        let added = discovered.iter().copied().filter(|p| !known.contains(p)).collect();
        self.partitions = discovered;
        self.last_refresh = Some(now);
        added
    }

    /// Where a new task should start reading `partition`.
    pub fn resume_offset(&self, partition: PartitionId, progress: &ProgressTracker) -> StartOffset {
        if let Some(committed) = progress.get(partition) {
            return StartOffset::after(committed);
        }
        match self.initial_offsets.get(&partition) {
            Some(&offset) => StartOffset::At(offset),
            None => self.default_offset,
        }
    }

    pub fn payload(
        &self,
        partitions: &BTreeSet<PartitionId>,
        progress: &ProgressTracker,
    ) -> KafkaTaskPayload {
        KafkaTaskPayload {
            brokers: self.brokers.clone(),
            topic: self.topic.clone(),
            partitions: partitions
                .iter()
                .map(|&p| (p, self.resume_offset(p, progress)))
                .collect(),
        }
    }
}

fn malformed(msg: String) -> RegistryError {
    RegistryError::MalformedSpec(msg)
}

fn required(properties: &BTreeMap<String, String>, key: &str) -> Result<String, RegistryError> {
    match properties.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(malformed(format!("{key} is required"))),
    }
}

fn parse_partitions(raw: &str) -> Result<Vec<PartitionId>, RegistryError> {
    let mut partitions = Vec::new();
    for part in raw.split(',') {
        let partition: PartitionId = part
            .trim()
            .parse()
            .map_err(|_| malformed(format!("invalid kafka partition '{}'", part.trim())))?;
        if partition < 0 {
            return Err(malformed(format!("negative kafka partition {partition}")));
        }
        if partitions.contains(&partition) {
            return Err(malformed(format!("duplicate kafka partition {partition}")));
        }
        partitions.push(partition);
    }
    Ok(partitions)
}

fn parse_offsets(raw: &str) -> Result<Vec<Offset>, RegistryError> {
    raw.split(',')
        .map(|part| {
            let part = part.trim();
            match part.parse::<Offset>() {
                Ok(offset) if offset >= 0 => Ok(offset),
                _ => Err(malformed(format!("invalid kafka offset '{part}'"))),
            }
        })
        .collect()
}
