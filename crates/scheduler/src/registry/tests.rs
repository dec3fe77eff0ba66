use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use routine_load_core::{DbId, JobId, TableId, WorkerId};
use tokio::sync::Notify;

use crate::collaborators::{AuthContext, Collaborators, EditLog, WorkerInfo};
use crate::config::SchedulerConfig;
use crate::definition::{JobDefinition, TableRef, DEFAULT_CLUSTER};
use crate::error::{JournalError, RegistryError};
use crate::job::kafka::{
    KAFKA_BROKER_LIST_PROPERTY, KAFKA_PARTITIONS_PROPERTY, KAFKA_TOPIC_PROPERTY,
};
use crate::job::{Job, JobState};
use crate::journal::EditLogEntry;
use crate::memory::{MemoryCluster, MemoryEditLog, TxnStatus};
use crate::registry::{JobRegistry, ReportDisposition};
use crate::task::{StartOffset, TaskInfo, TaskPayload, TaskReport};

fn worker(id: u64) -> WorkerInfo {
    WorkerInfo {
        id: WorkerId(id),
        cluster: DEFAULT_CLUSTER.to_string(),
    }
}

fn setup_with(config: SchedulerConfig, workers: &[u64]) -> (JobRegistry, MemoryCluster) {
    let cluster = MemoryCluster::new(workers.iter().map(|&id| worker(id)).collect());
    let registry = JobRegistry::new(config, cluster.collaborators());
    (registry, cluster)
}

fn setup(workers: &[u64]) -> (JobRegistry, MemoryCluster) {
    setup_with(SchedulerConfig::default(), workers)
}

fn definition(db: u64, name: &str, partitions: &str, concurrency: usize) -> JobDefinition {
    let mut properties = BTreeMap::new();
    properties.insert(KAFKA_BROKER_LIST_PROPERTY.to_string(), "127.0.0.1:9092".to_string());
    properties.insert(KAFKA_TOPIC_PROPERTY.to_string(), "topic1".to_string());
    if !partitions.is_empty() {
        properties.insert(KAFKA_PARTITIONS_PROPERTY.to_string(), partitions.to_string());
    }
    JobDefinition {
        name: name.to_string(),
        target: TableRef {
            db_id: DbId(db),
            db_name: format!("db{db}"),
            table_id: TableId(db * 100),
            table_name: "table1".into(),
        },
        desired_concurrency: concurrency,
        columns: vec![],
        where_predicate: None,
        column_separator: None,
        source_type: "KAFKA".into(),
        cluster: DEFAULT_CLUSTER.into(),
        properties,
    }
}

fn auth() -> AuthContext {
    AuthContext::new("root", "127.0.0.1")
}

async fn create(
    registry: &JobRegistry,
    db: u64,
    name: &str,
    partitions: &str,
    concurrency: usize,
) -> JobId {
    registry
        .create_job(&definition(db, name, partitions, concurrency), &auth())
        .await
        .unwrap()
}

fn start_offset(task: &TaskInfo, partition: i32) -> StartOffset {
    let TaskPayload::Kafka(kafka) = &task.payload;
    kafka.partitions[&partition]
}

fn db_states(jobs: &[crate::job::JobRef]) -> Vec<(u64, JobState)> {
    jobs.iter().map(|j| (j.db_id().0, j.state())).collect()
}

/// Edit log that holds every job creation until `open` is called.
#[derive(Default)]
struct GatedEditLog {
    inner: MemoryEditLog,
    gate: Notify,
    waiting: AtomicBool,
}

impl GatedEditLog {
    fn open(&self) {
        self.gate.notify_one();
    }

    async fn wait_for_creation(&self) {
        while !self.waiting.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl EditLog for GatedEditLog {
    async fn append(&self, entry: &EditLogEntry) -> Result<(), JournalError> {
        if matches!(entry, EditLogEntry::CreateJob(_)) {
            self.waiting.store(true, Ordering::SeqCst);
            self.gate.notified().await;
        }
        self.inner.append(entry).await
    }
}

// ── Creation & lookup ───────────────────────────────────────────

#[tokio::test]
async fn create_job_registers_and_journals() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;

    let job = registry.get_job(id).unwrap();
    assert_eq!(job.state(), JobState::NeedSchedule);
    assert_eq!(job.name(), "job1");

    let entries = cluster.edit_log.entries();
    assert_eq!(entries.len(), 1);
    assert!(matches!(&entries[0], EditLogEntry::CreateJob(s) if s.id == id));
}

#[tokio::test]
async fn duplicate_name_rejected_while_unfinished() {
    let (registry, _cluster) = setup(&[1]);
    create(&registry, 1, "job1", "0", 1).await;

    let err = registry
        .create_job(&definition(1, "job1", "0", 1), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NameConflict { db_id: DbId(1), .. }));
    assert_eq!(registry.job_count(), 1);
}

#[tokio::test]
async fn name_reusable_after_job_finishes() {
    let (registry, _cluster) = setup(&[1]);
    let first = create(&registry, 1, "job1", "0", 1).await;
    registry.stop_job(first).await.unwrap();

    let second = create(&registry, 1, "job1", "0", 1).await;
    let by_name: Vec<JobId> = registry.get_job_by_name("job1").iter().map(|j| j.id()).collect();
    assert_eq!(by_name, vec![second, first]);
}

#[tokio::test]
async fn same_name_in_other_database_allowed() {
    let (registry, _cluster) = setup(&[1]);
    create(&registry, 1, "job1", "0", 1).await;
    create(&registry, 2, "job1", "0", 1).await;
    assert_eq!(registry.get_job_by_name("job1").len(), 2);
}

#[tokio::test]
async fn unauthorized_creation_leaves_nothing() {
    let (registry, cluster) = setup(&[1]);
    cluster.privileges.deny("mallory");

    let err = registry
        .create_job(&definition(1, "job1", "0", 1), &AuthContext::new("mallory", "10.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::AuthorizationDenied { ref user, .. } if user == "mallory"
    ));
    assert_eq!(registry.job_count(), 0);
    assert!(cluster.edit_log.entries().is_empty());
}

#[tokio::test]
async fn malformed_definitions_rejected() {
    let (registry, _cluster) = setup(&[1]);

    let zero = definition(1, "job1", "0", 0);
    assert!(matches!(
        registry.create_job(&zero, &auth()).await,
        Err(RegistryError::MalformedSpec(_))
    ));

    let mut unknown = definition(1, "job1", "0", 1);
    unknown.properties.insert("kafka_client_id".into(), "x".into());
    assert!(matches!(
        registry.create_job(&unknown, &auth()).await,
        Err(RegistryError::MalformedSpec(_))
    ));
    assert_eq!(registry.job_count(), 0);
}

#[tokio::test]
async fn journal_failure_rolls_back_creation() {
    let (registry, cluster) = setup(&[1]);
    cluster.edit_log.set_unavailable(true);

    let err = registry
        .create_job(&definition(1, "job1", "0", 1), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Journal(_)));
    assert_eq!(registry.job_count(), 0);
    assert!(registry.get_job_by_name("job1").is_empty());

    cluster.edit_log.set_unavailable(false);
    create(&registry, 1, "job1", "0", 1).await;
}

#[tokio::test]
async fn job_stays_hidden_until_its_creation_is_journaled() {
    let cluster = MemoryCluster::new(vec![worker(1)]);
    let edit_log = Arc::new(GatedEditLog::default());
    let registry = Arc::new(JobRegistry::new(
        SchedulerConfig::default(),
        Collaborators {
            edit_log: edit_log.clone(),
            ..cluster.collaborators()
        },
    ));

    let creator = registry.clone();
    let creating = tokio::spawn(async move {
        creator.create_job(&definition(1, "job1", "0", 1), &auth()).await
    });
    edit_log.wait_for_creation().await;

    assert_eq!(registry.tick().await.dispatched, 0);
    assert_eq!(registry.job_count(), 0);
    assert!(registry.get_job_by_name("job1").is_empty());
    let err = registry
        .create_job(&definition(1, "job1", "0", 1), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NameConflict { .. }), "the name is held");

    edit_log.open();
    let id = creating.await.unwrap().unwrap();
    assert_eq!(registry.tick().await.dispatched, 1);
    let task = cluster.dispatcher.last().unwrap();
    registry
        .apply_report(TaskReport::committed(&task, BTreeMap::from([(0, 10)])))
        .await
        .unwrap();

    let entries = edit_log.inner.entries();
    assert!(matches!(&entries[0], EditLogEntry::CreateJob(s) if s.id == id));
    let (restored, _fresh) = setup(&[1]);
    let summary = restored.replay(&entries).unwrap();
    assert_eq!(summary.orphaned, 0);
    assert_eq!(restored.get_job(id).unwrap().progress().get(0), Some(10));
}

#[tokio::test]
async fn get_job_by_name_lists_unfinished_first() {
    let (registry, _cluster) = setup(&[1]);
    // A (final) and B in db1, C (final) in db2, registered in that order.
    let a = create(&registry, 1, "orders", "0", 1).await;
    registry.stop_job(a).await.unwrap();
    let b = create(&registry, 1, "orders", "0", 1).await;
    let c = create(&registry, 2, "orders", "0", 1).await;
    registry.cancel_job(c, "manual").await.unwrap();

    let ids: Vec<JobId> = registry.get_job_by_name("orders").iter().map(|j| j.id()).collect();
    assert_eq!(ids, vec![b, a, c]);

    let listed: Vec<JobId> = registry
        .get_jobs(None, Some("orders"), true)
        .iter()
        .map(|j| j.id())
        .collect();
    assert_eq!(listed, vec![b, a, c]);
}

#[tokio::test]
async fn get_jobs_hides_history_unless_asked() {
    let (registry, _cluster) = setup(&[1]);
    let a = create(&registry, 1, "a", "0", 1).await;
    create(&registry, 1, "b", "0", 1).await;
    create(&registry, 2, "c", "0", 1).await;
    registry.stop_job(a).await.unwrap();

    assert_eq!(registry.get_jobs(None, None, false).len(), 2);
    assert_eq!(registry.get_jobs(None, None, true).len(), 3);
    assert_eq!(
        db_states(&registry.get_jobs(Some(DbId(1)), None, true)),
        vec![(1, JobState::NeedSchedule), (1, JobState::Stopped)]
    );
    assert!(registry.get_jobs(None, Some("zzz"), true).is_empty());
}

// ── Placement ───────────────────────────────────────────────────

#[tokio::test]
async fn capacity_queries_follow_running_tasks() {
    let (registry, _cluster) = setup(&[1, 2]);
    create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;

    assert_eq!(registry.get_cluster_idle_slot_num(), 19);
    assert_eq!(registry.get_min_task_worker_id(DEFAULT_CLUSTER).unwrap(), WorkerId(2));
    assert!(matches!(
        registry.get_min_task_worker_id("other_cluster"),
        Err(RegistryError::CapacityUnavailable(_))
    ));
}

#[tokio::test]
async fn tick_dispatches_up_to_effective_concurrency() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0,1,2", 2).await;

    let summary = registry.tick().await;
    assert_eq!(summary.dispatched, 2);

    let tasks = cluster.dispatcher.tasks();
    assert_eq!(tasks.len(), 2);
    assert!(tasks[0].partitions().is_disjoint(&tasks[1].partitions()));
    assert_eq!(registry.get_job(id).unwrap().state(), JobState::Running);
    assert_eq!(registry.get_cluster_idle_slot_num(), 8);

    assert_eq!(registry.tick().await.dispatched, 0, "concurrency already filled");
}

#[tokio::test]
async fn tick_without_workers_places_nothing() {
    let (registry, cluster) = setup(&[]);
    create(&registry, 1, "job1", "0", 1).await;

    let summary = registry.tick().await;
    assert!(summary.no_capacity);
    assert_eq!(summary.dispatched, 0);
    assert!(cluster.dispatcher.tasks().is_empty());
}

#[tokio::test]
async fn worker_slots_bound_placement() {
    let mut config = SchedulerConfig::default();
    config.default_max_tasks_per_worker = 1;
    let (registry, cluster) = setup_with(config, &[1]);
    create(&registry, 1, "a", "0", 1).await;
    create(&registry, 1, "b", "0", 1).await;

    assert_eq!(registry.tick().await.dispatched, 1);
    assert_eq!(cluster.dispatcher.tasks().len(), 1);
    assert_eq!(registry.get_cluster_idle_slot_num(), 0);
}

// ── Reports ─────────────────────────────────────────────────────

#[tokio::test]
async fn commit_advances_progress_and_frees_slot() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 2).await;
    assert_eq!(registry.tick().await.dispatched, 1, "one partition caps concurrency at one");
    assert_eq!(registry.get_job(id).unwrap().state(), JobState::Running);
    let task = cluster.dispatcher.last().unwrap();

    let disposition = registry
        .apply_report(TaskReport::committed(&task, BTreeMap::from([(0, 100)])))
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Committed);

    let job = registry.get_job(id).unwrap();
    assert_eq!(job.progress().get(0), Some(100));
    assert!(job.running_tasks().is_empty());
    assert_eq!(registry.get_cluster_idle_slot_num(), 10);
    assert!(matches!(cluster.transactions.status(task.txn_id), Some(TxnStatus::Committed(_))));
    assert!(cluster
        .edit_log
        .entries()
        .iter()
        .any(|e| matches!(e, EditLogEntry::Progress { job_id, .. } if *job_id == id)));

    registry.tick().await;
    let next = cluster.dispatcher.last().unwrap();
    assert_ne!(next.id, task.id);
    assert_eq!(start_offset(&next, 0), StartOffset::At(101));
}

#[tokio::test]
async fn repeated_commit_report_is_stale() {
    let (registry, cluster) = setup(&[1]);
    create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();

    let report = TaskReport::committed(&task, BTreeMap::from([(0, 10)]));
    registry.apply_report(report.clone()).await.unwrap();
    assert_eq!(registry.apply_report(report).await.unwrap(), ReportDisposition::Stale);
    assert_eq!(registry.metrics().stale_reports, 1);
    assert_eq!(registry.metrics().tasks_committed, 1);
}

#[tokio::test]
async fn report_for_unknown_job_is_stale() {
    let (registry, cluster) = setup(&[1]);
    create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let mut task = cluster.dispatcher.last().unwrap();
    task.job_id = JobId::new();

    let disposition = registry.apply_report(TaskReport::failed(&task, "boom")).await.unwrap();
    assert_eq!(disposition, ReportDisposition::Stale);
}

#[tokio::test]
async fn failed_task_is_renewed_from_committed_progress() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;

    registry.tick().await;
    let first = cluster.dispatcher.last().unwrap();
    registry
        .apply_report(TaskReport::committed(&first, BTreeMap::from([(0, 50)])))
        .await
        .unwrap();

    registry.tick().await;
    let second = cluster.dispatcher.last().unwrap();
    let disposition = registry
        .apply_report(TaskReport::failed(&second, "load error"))
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Aborted);
    assert!(matches!(cluster.transactions.status(second.txn_id), Some(TxnStatus::Aborted(_))));

    registry.tick().await;
    let third = cluster.dispatcher.last().unwrap();
    assert_eq!(third.renewed_from, Some(second.id));
    assert_eq!(third.partitions(), second.partitions());
    assert_ne!(third.txn_id, second.txn_id);
    assert_eq!(start_offset(&third, 0), StartOffset::At(51));

    let view = registry.get_job(id).unwrap().view();
    assert_eq!(view.stats.consecutive_failures, 1);
    assert_eq!(view.last_error.as_deref(), Some("load error"));
}

#[tokio::test]
async fn report_after_failure_is_stale_and_keeps_progress() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();

    registry.apply_report(TaskReport::failed(&task, "timeout")).await.unwrap();
    let late = registry
        .apply_report(TaskReport::committed(&task, BTreeMap::from([(0, 999)])))
        .await
        .unwrap();
    assert_eq!(late, ReportDisposition::Stale);
    assert!(registry.get_job(id).unwrap().progress().is_empty());
}

#[tokio::test]
async fn commit_call_failure_aborts_task() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();
    cluster.transactions.set_fail_commit(true);

    let disposition = registry
        .apply_report(TaskReport::committed(&task, BTreeMap::from([(0, 10)])))
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Aborted);

    let job = registry.get_job(id).unwrap();
    assert!(job.progress().is_empty());
    assert!(job.running_tasks().is_empty());
    assert_eq!(registry.get_cluster_idle_slot_num(), 10);
}

#[tokio::test]
async fn consecutive_failures_pause_the_job() {
    let mut config = SchedulerConfig::default();
    config.max_consecutive_failures = 2;
    let (registry, cluster) = setup_with(config, &[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;

    for _ in 0..2 {
        registry.tick().await;
        let task = cluster.dispatcher.last().unwrap();
        registry.apply_report(TaskReport::failed(&task, "bad record")).await.unwrap();
    }

    let job = registry.get_job(id).unwrap();
    assert_eq!(job.state(), JobState::Paused);
    assert!(job.view().pause_reason.unwrap().contains("bad record"));
    assert_eq!(registry.tick().await.dispatched, 0);
    assert!(cluster.edit_log.entries().iter().any(|e| matches!(
        e,
        EditLogEntry::ChangeState { state: JobState::Paused, .. }
    )));
}

#[tokio::test]
async fn failure_paused_job_auto_resumes() {
    let mut config = SchedulerConfig::default();
    config.max_consecutive_failures = 1;
    config.auto_resume_interval_secs = 0;
    let (registry, cluster) = setup_with(config, &[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;

    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();
    registry.apply_report(TaskReport::failed(&task, "boom")).await.unwrap();
    assert_eq!(registry.get_job(id).unwrap().state(), JobState::Paused);

    let summary = registry.tick().await;
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.dispatched, 1);
}

// ── Scheduling failures ─────────────────────────────────────────

#[tokio::test]
async fn begin_failure_is_counted_and_retried() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    cluster.transactions.set_fail_begin(true);

    let summary = registry.tick().await;
    assert_eq!(summary.begin_failures, 1);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(registry.get_cluster_idle_slot_num(), 10);
    assert!(registry.get_job(id).unwrap().running_tasks().is_empty());
    assert_eq!(registry.metrics().begin_failures, 1);

    cluster.transactions.set_fail_begin(false);
    assert_eq!(registry.tick().await.dispatched, 1);
}

#[tokio::test]
async fn attempt_journal_failure_begins_nothing() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    cluster.edit_log.set_unavailable(true);

    let summary = registry.tick().await;
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.begin_failures, 1);
    assert!(cluster.transactions.records().is_empty());
    assert_eq!(registry.get_cluster_idle_slot_num(), 10);

    cluster.edit_log.set_unavailable(false);
    assert_eq!(registry.tick().await.dispatched, 1);
    assert_eq!(cluster.dispatcher.last().unwrap().label, format!("job1-{}-1", id.0.simple()));
}

#[tokio::test]
async fn label_collision_moves_to_next_attempt() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    cluster.transactions.reserve_label(&format!("job1-{}-0", id.0.simple()));

    assert_eq!(registry.tick().await.begin_failures, 1);
    assert_eq!(registry.tick().await.dispatched, 1);
    let task = cluster.dispatcher.last().unwrap();
    assert_eq!(task.label, format!("job1-{}-1", id.0.simple()));
}

#[tokio::test]
async fn dispatch_failure_fails_the_task() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    cluster.dispatcher.fail_worker(WorkerId(1));

    let summary = registry.tick().await;
    assert_eq!(summary.dispatch_failures, 1);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(registry.get_cluster_idle_slot_num(), 10);
    assert_eq!(registry.live_task_count(), 0);
    assert_eq!(
        cluster.transactions.count_with(|s| matches!(s, TxnStatus::Aborted(_))),
        1
    );
    assert_eq!(registry.get_job(id).unwrap().view().stats.consecutive_failures, 1);
}

#[tokio::test]
async fn overdue_tasks_are_expired() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();

    let expired = registry.expire_overdue_tasks(Utc::now() + Duration::seconds(60)).await;
    assert_eq!(expired, 1);
    assert!(registry.get_job(id).unwrap().running_tasks().is_empty());
    assert!(matches!(cluster.transactions.status(task.txn_id), Some(TxnStatus::Aborted(_))));
}

#[tokio::test]
async fn departed_worker_tasks_are_failed_and_replaced() {
    let (registry, cluster) = setup(&[1, 2]);
    create(&registry, 1, "job1", "0,1", 2).await;
    registry.tick().await;
    let on_first: Vec<_> = cluster
        .dispatcher
        .dispatched()
        .into_iter()
        .filter(|(w, _)| *w == WorkerId(1))
        .collect();
    assert_eq!(on_first.len(), 1);

    cluster.membership.set_workers(vec![worker(2)]);
    let summary = registry.tick().await;
    assert_eq!(summary.lost, 1);
    assert_eq!(summary.dispatched, 1);

    let replacement = cluster.dispatcher.last().unwrap();
    assert_eq!(replacement.worker, WorkerId(2));
    assert_eq!(replacement.partitions(), on_first[0].1.partitions());
    assert!(!registry.worker_slots().contains_key(&WorkerId(1)));
}

// ── Control ─────────────────────────────────────────────────────

#[tokio::test]
async fn pause_drains_and_resume_reschedules() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();

    registry.pause_job_by_name(DbId(1), "job1").await.unwrap();
    assert_eq!(registry.get_job(id).unwrap().state(), JobState::Paused);
    assert!(matches!(cluster.transactions.status(task.txn_id), Some(TxnStatus::Aborted(_))));
    assert_eq!(registry.get_cluster_idle_slot_num(), 10);

    let err = registry.pause_job(id).await.unwrap_err();
    assert!(matches!(err, RegistryError::InvalidTransition { op: "pause", .. }));

    registry.resume_job(id).await.unwrap();
    assert_eq!(registry.get_job(id).unwrap().state(), JobState::NeedSchedule);
    assert_eq!(registry.tick().await.dispatched, 1);
}

#[tokio::test]
async fn finished_jobs_reject_control() {
    let (registry, _cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.stop_job_by_name(DbId(1), "job1").await.unwrap();

    let err = registry.resume_job_by_name(DbId(1), "job1").await.unwrap_err();
    assert!(matches!(err, RegistryError::JobAlreadyFinal { state: JobState::Stopped, .. }));
    assert!(err.to_string().contains("STOPPED"));
    assert!(registry.cancel_job(id, "late").await.is_err());
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let (registry, _cluster) = setup(&[1]);
    assert!(matches!(registry.pause_job(JobId::new()).await, Err(RegistryError::JobNotFound(_))));
    assert!(matches!(
        registry.stop_job_by_name(DbId(9), "nope").await,
        Err(RegistryError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn dropping_the_table_cancels_its_jobs() {
    let (registry, _cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    create(&registry, 2, "job2", "0", 1).await;

    assert_eq!(registry.on_table_dropped(TableId(100)).await, 1);
    let view = registry.get_job(id).unwrap().view();
    assert_eq!(view.state, JobState::Cancelled);
    assert!(view.cancel_reason.unwrap().contains("dropped"));
    assert_eq!(registry.get_jobs(None, None, false).len(), 1);
}

#[tokio::test]
async fn purge_removes_finished_jobs() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    create(&registry, 1, "job2", "0", 1).await;
    registry.stop_job(id).await.unwrap();

    assert_eq!(registry.purge_final_jobs(Duration::hours(1)).await.unwrap(), 0);
    assert_eq!(registry.purge_final_jobs(Duration::zero()).await.unwrap(), 1);
    assert!(registry.get_job(id).is_none());
    assert!(registry.get_job_by_name("job1").is_empty());
    assert!(cluster
        .edit_log
        .entries()
        .iter()
        .any(|e| matches!(e, EditLogEntry::Purge { job_id } if *job_id == id)));
}

// ── Partition discovery ─────────────────────────────────────────

#[tokio::test]
async fn discovered_partitions_become_schedulable() {
    let (registry, cluster) = setup(&[1]);
    cluster.discovery.set_partitions("topic1", vec![1, 0]);
    let id = create(&registry, 1, "job1", "", 3).await;

    assert_eq!(registry.tick().await.dispatched, 2);
    assert_eq!(registry.get_job(id).unwrap().view().partitions, vec![0, 1]);
}

#[tokio::test]
async fn missing_topic_cancels_the_job() {
    let (registry, _cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "", 1).await;

    registry.tick().await;
    let view = registry.get_job(id).unwrap().view();
    assert_eq!(view.state, JobState::Cancelled);
    assert!(view.cancel_reason.unwrap().contains("topic1"));
}

// ── Recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state_and_progress() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let task = cluster.dispatcher.last().unwrap();
    registry
        .apply_report(TaskReport::committed(&task, BTreeMap::from([(0, 100)])))
        .await
        .unwrap();
    registry.pause_job(id).await.unwrap();

    let (restored, fresh) = setup(&[1]);
    let summary = restored.replay(&cluster.edit_log.entries()).unwrap();
    assert_eq!(summary.jobs_created, 1);
    assert_eq!(summary.orphaned, 0);

    let job = restored.get_job(id).unwrap();
    assert_eq!(job.state(), JobState::Paused);
    assert_eq!(job.progress().get(0), Some(100));

    restored.resume_job(id).await.unwrap();
    restored.tick().await;
    let resumed = fresh.dispatcher.last().unwrap();
    assert_eq!(start_offset(&resumed, 0), StartOffset::At(101));
    assert_eq!(resumed.label, format!("job1-{}-1", id.0.simple()));
}

#[tokio::test]
async fn labels_are_not_reused_after_restart_without_commits() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    let first = cluster.dispatcher.last().unwrap();
    registry
        .apply_report(TaskReport::failed(&first, "worker crashed"))
        .await
        .unwrap();
    registry.tick().await;
    let in_flight = cluster.dispatcher.last().unwrap();
    assert_eq!(in_flight.attempt, 1);

    // Same coordinator after the restart: it still knows every label begun.
    let restored_cluster = MemoryCluster::new(vec![worker(1)]);
    let restored = JobRegistry::new(
        SchedulerConfig::default(),
        Collaborators {
            transactions: cluster.transactions.clone(),
            ..restored_cluster.collaborators()
        },
    );
    restored.replay(&cluster.edit_log.entries()).unwrap();

    let summary = restored.tick().await;
    assert_eq!(summary.begin_failures, 0);
    assert_eq!(summary.dispatched, 1);
    let resumed = restored_cluster.dispatcher.last().unwrap();
    assert_eq!(resumed.label, format!("job1-{}-2", id.0.simple()));
}

#[tokio::test]
async fn control_journal_failure_leaves_the_job_unchanged() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    cluster.edit_log.set_unavailable(true);

    let err = registry.stop_job(id).await.unwrap_err();
    assert!(matches!(err, RegistryError::Journal(_)));
    let job = registry.get_job(id).unwrap();
    assert_eq!(job.state(), JobState::Running);
    assert_eq!(job.running_tasks().len(), 1);
    assert_eq!(cluster.transactions.count_with(|s| matches!(s, TxnStatus::Prepared)), 1);

    cluster.edit_log.set_unavailable(false);
    let err = registry
        .create_job(&definition(1, "job1", "0", 1), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NameConflict { .. }));

    // Memory and the journal still agree.
    let (restored, _fresh) = setup(&[1]);
    restored.replay(&cluster.edit_log.entries()).unwrap();
    assert!(!restored.get_job(id).unwrap().is_final());

    registry.stop_job(id).await.unwrap();
    create(&registry, 1, "job1", "0", 1).await;
    let (restored, _fresh) = setup(&[1]);
    let summary = restored.replay(&cluster.edit_log.entries()).unwrap();
    assert_eq!(summary.superseded, 0);
    assert_eq!(restored.get_job(id).unwrap().state(), JobState::Stopped);
}

#[tokio::test]
async fn replay_lets_a_newer_creation_supersede_an_unfinished_name() {
    let older = Job::from_definition(&definition(1, "job1", "0", 1), Utc::now())
        .unwrap()
        .snapshot();
    let newer = Job::from_definition(&definition(1, "job1", "0", 1), Utc::now())
        .unwrap()
        .snapshot();
    let entries = vec![
        EditLogEntry::CreateJob(older.clone()),
        EditLogEntry::CreateJob(newer.clone()),
    ];

    let (restored, fresh) = setup(&[1]);
    let summary = restored.replay(&entries).unwrap();
    assert_eq!(summary.jobs_created, 2);
    assert_eq!(summary.superseded, 1);

    let superseded = restored.get_job(older.id).unwrap();
    assert_eq!(superseded.state(), JobState::Cancelled);
    assert!(superseded.view().cancel_reason.unwrap().contains("superseded"));
    assert_eq!(restored.get_job(newer.id).unwrap().state(), JobState::NeedSchedule);

    assert_eq!(restored.tick().await.dispatched, 1);
    assert_eq!(fresh.dispatcher.last().unwrap().job_id, newer.id);
}

#[tokio::test]
async fn replay_brings_running_jobs_back_unscheduled() {
    let (registry, cluster) = setup(&[1]);
    let id = create(&registry, 1, "job1", "0", 1).await;
    registry.tick().await;
    assert_eq!(registry.get_job(id).unwrap().state(), JobState::Running);

    let (restored, _fresh) = setup(&[1]);
    restored.replay(&cluster.edit_log.entries()).unwrap();
    let job = restored.get_job(id).unwrap();
    assert_eq!(job.state(), JobState::NeedSchedule);
    assert!(job.running_tasks().is_empty());
}
