//! routine-load-scheduler: runs the job registry against simulated workers.
//!
//! Jobs are read from a TOML file (`[[jobs]]` entries) and the edit log is
//! replayed on startup, so a restart resumes every job from its last
//! committed offsets. Workers are in-process tasks that "load" a fixed
//! number of records per partition and report the commit back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use clap::Parser;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use routine_load_core::{Offset, PartitionId, WorkerId};
use routine_load_scheduler::collaborators::{EditLog, WorkerInfo};
use routine_load_scheduler::job::kafka::{KAFKA_PARTITIONS_PROPERTY, KAFKA_TOPIC_PROPERTY};
use routine_load_scheduler::memory::{
    ChannelDispatcher, MemoryEditLog, MemoryTransactions, StaticDiscovery, StaticMembership,
    StaticPrivileges,
};
use routine_load_scheduler::task::{StartOffset, TaskPayload};
use routine_load_scheduler::{
    AuthContext, Collaborators, FileEditLog, JobDefinition, JobRegistry, SchedulerConfig, TaskInfo,
    TaskReport,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Routine load scheduler with simulated workers.
#[derive(Parser, Debug)]
#[command(name = "routine-load-scheduler", version, about)]
struct Cli {
    /// Scheduler config TOML. Defaults plus env overrides when omitted.
    #[arg(long, env = "ROUTINE_LOAD_CONFIG")]
    config: Option<PathBuf>,

    /// TOML file with `[[jobs]]` definitions to create on startup.
    #[arg(long, env = "ROUTINE_LOAD_JOBS")]
    jobs: Option<PathBuf>,

    /// Number of simulated workers.
    #[arg(long, env = "ROUTINE_LOAD_WORKERS", default_value_t = 3)]
    workers: u64,

    /// Partitions reported for topics of jobs without an explicit list.
    #[arg(long, env = "ROUTINE_LOAD_TOPIC_PARTITIONS", default_value_t = 4)]
    topic_partitions: i32,

    /// Records a simulated worker loads per partition and task.
    #[arg(long, env = "ROUTINE_LOAD_BATCH_RECORDS", default_value_t = 1000)]
    batch_records: i64,

    /// How long a simulated worker takes per task, in milliseconds.
    #[arg(long, env = "ROUTINE_LOAD_TASK_LATENCY_MS", default_value_t = 200)]
    task_latency_ms: u64,

    /// Keep the edit log in memory only.
    #[arg(long)]
    no_journal: bool,

    /// Finished jobs are purged after this many hours.
    #[arg(long, env = "ROUTINE_LOAD_HISTORY_HOURS", default_value_t = 72)]
    history_hours: i64,
}

#[derive(Debug, Default, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobDefinition>,
}

fn load_jobs(path: &Path) -> anyhow::Result<Vec<JobDefinition>> {
    let content = std::fs::read_to_string(path)?;
    let file: JobsFile = toml::from_str(&content)?;
    Ok(file.jobs)
}

// ── Simulated workers ───────────────────────────────────────────────

/// Offsets a worker would commit after loading `batch` records from each
/// partition of `task`. Partitions starting at the end have nothing to load.
fn simulated_offsets(task: &TaskInfo, batch: i64) -> BTreeMap<PartitionId, Offset> {
    let TaskPayload::Kafka(kafka) = &task.payload;
    kafka
        .partitions
        .iter()
        .filter_map(|(&partition, start)| match start {
            StartOffset::Beginning => Some((partition, batch - 1)),
            StartOffset::At(offset) => Some((partition, offset.saturating_add(batch - 1))),
            StartOffset::End => None,
        })
        .collect()
}

async fn run_workers(
    registry: Arc<JobRegistry>,
    mut rx: mpsc::UnboundedReceiver<(WorkerId, TaskInfo)>,
    batch: i64,
    latency: StdDuration,
) {
    while let Some((worker, task)) = rx.recv().await {
        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let offsets = simulated_offsets(&task, batch);
            let report = TaskReport::committed(&task, offsets);
            match registry.apply_report(report).await {
                Ok(disposition) => {
                    info!(%worker, label = %task.label, ?disposition, "task report applied")
                }
                Err(e) => error!(%worker, label = %task.label, error = %e, "task report failed"),
            }
        });
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    routine_load_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let core = routine_load_core::Config::from_env();
    core.log_summary();

    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path, &core.profile)?,
        None => SchedulerConfig::from_env(&core.profile)?,
    };

    // Replay before the log is opened for appends.
    let (edit_log, replayed): (Arc<dyn EditLog>, _) = if cli.no_journal {
        (Arc::new(MemoryEditLog::new()), Vec::new())
    } else {
        let path = config.journal_path.clone().unwrap_or_else(|| core.journal_path.clone());
        let entries = FileEditLog::read_entries(&path)?;
        info!(path = %path.display(), entries = entries.len(), "journal loaded");
        (Arc::new(FileEditLog::open(path)?), entries)
    };

    let workers: Vec<WorkerInfo> = (1..=cli.workers)
        .map(|id| WorkerInfo {
            id: WorkerId(id),
            cluster: core.default_cluster.clone(),
        })
        .collect();
    let discovery = Arc::new(StaticDiscovery::new());
    let (dispatcher, rx) = ChannelDispatcher::channel();
    let collaborators = Collaborators {
        privileges: Arc::new(StaticPrivileges::allow_all()),
        transactions: Arc::new(MemoryTransactions::new()),
        membership: Arc::new(StaticMembership::new(workers)),
        dispatcher: Arc::new(dispatcher),
        discovery: discovery.clone(),
        edit_log,
    };

    let registry = Arc::new(JobRegistry::new(config, collaborators));
    let summary = registry.replay(&replayed)?;
    info!(?summary, "registry restored");

    let definitions = match &cli.jobs {
        Some(path) => load_jobs(path)?,
        None => Vec::new(),
    };
    let auth = AuthContext::new("admin", "127.0.0.1");
    for def in &definitions {
        if !def.properties.contains_key(KAFKA_PARTITIONS_PROPERTY) {
            if let Some(topic) = def.properties.get(KAFKA_TOPIC_PROPERTY) {
                discovery.set_partitions(topic, (0..cli.topic_partitions).collect());
            }
        }
        let restored = registry.get_jobs(Some(def.target.db_id), Some(&def.name), false);
        if !restored.is_empty() {
            info!(job = %def.name, "job already restored from journal");
            continue;
        }
        match registry.create_job(def, &auth).await {
            Ok(id) => info!(job = %def.name, %id, "job created"),
            Err(e) => warn!(job = %def.name, error = %e, "job rejected"),
        }
    }

    tokio::spawn(run_workers(
        registry.clone(),
        rx,
        cli.batch_records,
        StdDuration::from_millis(cli.task_latency_ms),
    ));

    let purger = registry.clone();
    let retention = chrono::Duration::hours(cli.history_hours);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(600));
        loop {
            interval.tick().await;
            match purger.purge_final_jobs(retention).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "finished jobs purged"),
                Err(e) => warn!(error = %e, "purging finished jobs failed"),
            }
        }
    });

    let scheduler = registry.clone();
    let handle = tokio::spawn(async move { scheduler.run().await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    registry.shutdown();
    handle.await?;

    let metrics = serde_json::to_string_pretty(&registry.metrics())?;
    info!("final metrics:\n{metrics}");
    Ok(())
}
