//! Job creation requests, as produced by the statement layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use routine_load_core::{DbId, TableId};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub const DEFAULT_CLUSTER: &str = "default_cluster";
pub const DEFAULT_COLUMN_SEPARATOR: &str = "\t";

/// Resolved target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub db_id: DbId,
    pub db_name: String,
    pub table_id: TableId,
    pub table_name: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db_name, self.table_name)
    }
}

/// Supported source types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Kafka,
}

impl FromStr for SourceType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KAFKA" => Ok(SourceType::Kafka),
            other => Err(RegistryError::MalformedSpec(format!(
                "unsupported source type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Kafka => write!(f, "KAFKA"),
        }
    }
}

/// A request to create a routine load job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub target: TableRef,
    #[serde(default = "default_desired_concurrency")]
    pub desired_concurrency: usize,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, rename = "where")]
    pub where_predicate: Option<String>,
    #[serde(default)]
    pub column_separator: Option<String>,
    pub source_type: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Source-specific properties, e.g. `kafka_broker_list` and `kafka_topic`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_desired_concurrency() -> usize { 3 }
fn default_cluster() -> String { DEFAULT_CLUSTER.to_string() }

impl JobDefinition {
    /// Validate everything that does not depend on the source type.
    pub fn validate(&self) -> Result<SourceType, RegistryError> {
        if self.name.is_empty() {
            return Err(RegistryError::MalformedSpec("job name is empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RegistryError::MalformedSpec(format!(
                "job name '{}' may only contain letters, digits, '_' and '-'",
                self.name
            )));
        }
        if self.desired_concurrency == 0 {
            return Err(RegistryError::MalformedSpec(
                "desired concurrency must be a positive integer".into(),
            ));
        }
        if self.cluster.is_empty() {
            return Err(RegistryError::MalformedSpec("cluster is empty".into()));
        }
        if let Some(sep) = &self.column_separator {
            if sep.is_empty() {
                return Err(RegistryError::MalformedSpec("column separator is empty".into()));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if column.is_empty() {
                return Err(RegistryError::MalformedSpec("column name is empty".into()));
            }
            if !seen.insert(column.to_ascii_lowercase()) {
                return Err(RegistryError::MalformedSpec(format!(
                    "duplicate column '{column}'"
                )));
            }
        }
        self.source_type.parse()
    }

    pub fn column_separator_or_default(&self) -> String {
        self.column_separator
            .clone()
            .unwrap_or_else(|| DEFAULT_COLUMN_SEPARATOR.to_string())
    }
}
