//! Traits for the services the registry talks to.
//!
//! Everything that may suspend is an `async_trait`. Implementations backed
//! by memory live in [`crate::memory`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use routine_load_core::{DbId, Offset, PartitionId, TableId, TxnId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, DispatchError, JournalError, MembershipError, TransactionError};
use crate::journal::EditLogEntry;
use crate::task::TaskInfo;

/// Identity of the requesting user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user: String,
    pub remote_ip: String,
}

impl AuthContext {
    pub fn new(user: impl Into<String>, remote_ip: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            remote_ip: remote_ip.into(),
        }
    }
}

/// A live worker as reported by cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub cluster: String,
}

/// Which workers a lookup considers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterScope {
    All,
    Named(String),
}

impl ClusterScope {
    pub fn named(cluster: impl Into<String>) -> Self {
        ClusterScope::Named(cluster.into())
    }

    pub fn contains(&self, cluster: &str) -> bool {
        match self {
            ClusterScope::All => true,
            ClusterScope::Named(name) => name == cluster,
        }
    }
}

/// Load privilege lookup. Synchronous: it only reads cached grants.
pub trait PrivilegeChecker: Send + Sync {
    fn check_load_privilege(&self, ctx: &AuthContext, db: &str, table: &str) -> bool;
}

/// Load transactions. Each task runs in exactly one transaction.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    /// Begin a transaction. Fails with `LabelAlreadyExists` if `label` was used before.
    async fn begin(&self, label: &str, db: DbId, table: TableId) -> Result<TxnId, TransactionError>;

    /// Commit, publishing the offsets the task consumed up to.
    async fn commit(
        &self,
        txn: TxnId,
        offsets: &BTreeMap<PartitionId, Offset>,
    ) -> Result<(), TransactionError>;

    async fn abort(&self, txn: TxnId, reason: &str) -> Result<(), TransactionError>;
}

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn list_workers(&self, scope: &ClusterScope) -> Result<Vec<WorkerInfo>, MembershipError>;
}

/// Hands tasks to workers. Success only means the worker accepted the task;
/// the outcome comes back later as a [`crate::task::TaskReport`].
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, worker: WorkerId, task: &TaskInfo) -> Result<(), DispatchError>;
}

#[async_trait]
pub trait PartitionDiscovery: Send + Sync {
    async fn list_partitions(
        &self,
        brokers: &str,
        topic: &str,
    ) -> Result<Vec<PartitionId>, DiscoveryError>;
}

/// Durable log of registry mutations, replayed on startup.
#[async_trait]
pub trait EditLog: Send + Sync {
    async fn append(&self, entry: &EditLogEntry) -> Result<(), JournalError>;
}

/// Every collaborator the registry needs.
#[derive(Clone)]
pub struct Collaborators {
    pub privileges: Arc<dyn PrivilegeChecker>,
    pub transactions: Arc<dyn TransactionCoordinator>,
    pub membership: Arc<dyn ClusterMembership>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub discovery: Arc<dyn PartitionDiscovery>,
    pub edit_log: Arc<dyn EditLog>,
}
