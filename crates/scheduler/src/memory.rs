//! In-memory collaborators for tests and the simulation binary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use routine_load_core::{DbId, Offset, PartitionId, TableId, TxnId, WorkerId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::collaborators::{
    AuthContext, ClusterMembership, ClusterScope, Collaborators, EditLog, PartitionDiscovery,
    PrivilegeChecker, TaskDispatcher, TransactionCoordinator, WorkerInfo,
};
use crate::error::{DiscoveryError, DispatchError, JournalError, MembershipError, TransactionError};
use crate::journal::EditLogEntry;
use crate::sync::lock;
use crate::task::TaskInfo;

// ── Privileges ──────────────────────────────────────────────────

/// Grants everything except an explicit deny list of users.
#[derive(Debug, Default)]
pub struct StaticPrivileges {
    denied_users: Mutex<HashSet<String>>,
}

impl StaticPrivileges {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny(&self, user: &str) {
        lock(&self.denied_users).insert(user.to_string());
    }
}

impl PrivilegeChecker for StaticPrivileges {
    fn check_load_privilege(&self, ctx: &AuthContext, _db: &str, _table: &str) -> bool {
        !lock(&self.denied_users).contains(&ctx.user)
    }
}

// ── Transactions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    Prepared,
    Committed(BTreeMap<PartitionId, Offset>),
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub label: String,
    pub db: DbId,
    pub table: TableId,
    pub status: TxnStatus,
}

/// Transaction coordinator that keeps every transaction in memory.
#[derive(Debug)]
pub struct MemoryTransactions {
    next_id: AtomicU64,
    labels: Mutex<HashSet<String>>,
    txns: Mutex<BTreeMap<TxnId, TxnRecord>>,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
}

impl Default for MemoryTransactions {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            labels: Mutex::new(HashSet::new()),
            txns: Mutex::new(BTreeMap::new()),
            fail_begin: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
        }
    }
}

impl MemoryTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `begin` fail until reset.
    pub fn set_fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::Relaxed);
    }

    /// Pretend `label` was used by an earlier transaction.
    pub fn reserve_label(&self, label: &str) {
        lock(&self.labels).insert(label.to_string());
    }

    pub fn status(&self, txn: TxnId) -> Option<TxnStatus> {
        lock(&self.txns).get(&txn).map(|r| r.status.clone())
    }

    pub fn records(&self) -> BTreeMap<TxnId, TxnRecord> {
        lock(&self.txns).clone()
    }

    pub fn count_with(&self, pred: impl Fn(&TxnStatus) -> bool) -> usize {
        lock(&self.txns).values().filter(|r| pred(&r.status)).count()
    }
}

#[async_trait]
impl TransactionCoordinator for MemoryTransactions {
    async fn begin(
        &self,
        label: &str,
        db: DbId,
        table: TableId,
    ) -> Result<TxnId, TransactionError> {
        if self.fail_begin.load(Ordering::Relaxed) {
            return Err(TransactionError::Begin("coordinator unavailable".into()));
        }
        if !lock(&self.labels).insert(label.to_string()) {
            return Err(TransactionError::LabelAlreadyExists(label.to_string()));
        }
        let txn = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.txns).insert(
            txn,
            TxnRecord {
                label: label.to_string(),
                db,
                table,
                status: TxnStatus::Prepared,
            },
        );
        debug!(%txn, label, "transaction begun");
        Ok(txn)
    }

    async fn commit(
        &self,
        txn: TxnId,
        offsets: &BTreeMap<PartitionId, Offset>,
    ) -> Result<(), TransactionError> {
        if self.fail_commit.load(Ordering::Relaxed) {
            return Err(TransactionError::Commit {
                txn,
                reason: "publish failed".into(),
            });
        }
        let mut txns = lock(&self.txns);
        let record = txns.get_mut(&txn).ok_or(TransactionError::NotFound(txn))?;
        if record.status != TxnStatus::Prepared {
            return Err(TransactionError::Commit {
                txn,
                reason: format!("transaction is {:?}", record.status),
            });
        }
        record.status = TxnStatus::Committed(offsets.clone());
        Ok(())
    }

    async fn abort(&self, txn: TxnId, reason: &str) -> Result<(), TransactionError> {
        let mut txns = lock(&self.txns);
        let record = txns.get_mut(&txn).ok_or(TransactionError::NotFound(txn))?;
        if let TxnStatus::Committed(_) = record.status {
            return Err(TransactionError::Abort {
                txn,
                reason: "transaction already committed".into(),
            });
        }
        record.status = TxnStatus::Aborted(reason.to_string());
        Ok(())
    }
}

// ── Membership ──────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StaticMembership {
    workers: Mutex<Vec<WorkerInfo>>,
}

impl StaticMembership {
    pub fn new(workers: Vec<WorkerInfo>) -> Self {
        Self {
            workers: Mutex::new(workers),
        }
    }

    /// `count` workers with ids `1..=count`, all in `cluster`.
    pub fn uniform(count: u64, cluster: &str) -> Self {
        Self::new(
            (1..=count)
                .map(|id| WorkerInfo {
                    id: WorkerId(id),
                    cluster: cluster.to_string(),
                })
                .collect(),
        )
    }

    pub fn set_workers(&self, workers: Vec<WorkerInfo>) {
        *lock(&self.workers) = workers;
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn list_workers(&self, scope: &ClusterScope) -> Result<Vec<WorkerInfo>, MembershipError> {
        Ok(lock(&self.workers)
            .iter()
            .filter(|w| scope.contains(&w.cluster))
            .cloned()
            .collect())
    }
}

// ── Dispatch ────────────────────────────────────────────────────

/// Records dispatched tasks. Workers in the failing set reject.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(WorkerId, TaskInfo)>>,
    failing: Mutex<HashSet<WorkerId>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_worker(&self, worker: WorkerId) {
        lock(&self.failing).insert(worker);
    }

    pub fn heal_worker(&self, worker: WorkerId) {
        lock(&self.failing).remove(&worker);
    }

    pub fn dispatched(&self) -> Vec<(WorkerId, TaskInfo)> {
        lock(&self.dispatched).clone()
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        lock(&self.dispatched).iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn last(&self) -> Option<TaskInfo> {
        lock(&self.dispatched).last().map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, worker: WorkerId, task: &TaskInfo) -> Result<(), DispatchError> {
        if lock(&self.failing).contains(&worker) {
            return Err(DispatchError::WorkerUnavailable(worker));
        }
        lock(&self.dispatched).push((worker, task.clone()));
        Ok(())
    }
}

/// Forwards dispatched tasks over a channel to simulated workers.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<(WorkerId, TaskInfo)>,
}

impl ChannelDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(WorkerId, TaskInfo)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskDispatcher for ChannelDispatcher {
    async fn dispatch(&self, worker: WorkerId, task: &TaskInfo) -> Result<(), DispatchError> {
        self.tx.send((worker, task.clone())).map_err(|_| DispatchError::Rejected {
            worker,
            reason: "worker channel closed".into(),
        })
    }
}

// ── Discovery ───────────────────────────────────────────────────

/// Topic → partitions. Unknown topics are `TopicNotFound`.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    topics: Mutex<HashMap<String, Vec<PartitionId>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_partitions(&self, topic: &str, partitions: Vec<PartitionId>) {
        lock(&self.topics).insert(topic.to_string(), partitions);
    }

    pub fn remove_topic(&self, topic: &str) {
        lock(&self.topics).remove(topic);
    }
}

#[async_trait]
impl PartitionDiscovery for StaticDiscovery {
    async fn list_partitions(
        &self,
        _brokers: &str,
        topic: &str,
    ) -> Result<Vec<PartitionId>, DiscoveryError> {
        lock(&self.topics)
            .get(topic)
            .cloned()
            .ok_or_else(|| DiscoveryError::TopicNotFound(topic.to_string()))
    }
}

// ── Edit log ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryEditLog {
    entries: Mutex<Vec<EditLogEntry>>,
    unavailable: AtomicBool,
}

impl MemoryEditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<EditLogEntry> {
        lock(&self.entries).clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }
}

#[async_trait]
impl EditLog for MemoryEditLog {
    async fn append(&self, entry: &EditLogEntry) -> Result<(), JournalError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(JournalError::Unavailable("edit log is read-only".into()));
        }
        lock(&self.entries).push(entry.clone());
        Ok(())
    }
}

// ── Bundle ──────────────────────────────────────────────────────

/// Every in-memory collaborator, with typed handles kept for inspection.
#[derive(Clone)]
pub struct MemoryCluster {
    pub privileges: Arc<StaticPrivileges>,
    pub transactions: Arc<MemoryTransactions>,
    pub membership: Arc<StaticMembership>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub discovery: Arc<StaticDiscovery>,
    pub edit_log: Arc<MemoryEditLog>,
}

impl MemoryCluster {
    pub fn new(workers: Vec<WorkerInfo>) -> Self {
        Self {
            privileges: Arc::new(StaticPrivileges::allow_all()),
            transactions: Arc::new(MemoryTransactions::new()),
            membership: Arc::new(StaticMembership::new(workers)),
            dispatcher: Arc::new(RecordingDispatcher::new()),
            discovery: Arc::new(StaticDiscovery::new()),
            edit_log: Arc::new(MemoryEditLog::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            privileges: self.privileges.clone(),
            transactions: self.transactions.clone(),
            membership: self.membership.clone(),
            dispatcher: self.dispatcher.clone(),
            discovery: self.discovery.clone(),
            edit_log: self.edit_log.clone(),
        }
    }
}
