use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cluster::discovery::check_job_id;
use crate::error::{LaunchError, Result};

/// Sent by the supervisor that initiates fail-fast. Only the first abort for
/// a job is kept; every other node reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortNotice {
    pub origin_node: usize,
    pub role: Option<String>,
    pub exit_code: Option<i32>,
    pub reason: String,
    pub sent_at: DateTime<Utc>,
}

impl AbortNotice {
    pub fn new(origin_node: usize, reason: impl Into<String>) -> Self {
        Self {
            origin_node,
            role: None,
            exit_code: None,
            reason: reason.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn for_role(mut self, role: impl Into<String>, exit_code: Option<i32>) -> Self {
        self.role = Some(role.into());
        self.exit_code = exit_code;
        self
    }
}

/// Everything the supervisors of a job have told each other so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub abort: Option<AbortNotice>,
    /// Nodes that have bootstrapped into the cluster runtime
    pub joined: BTreeSet<usize>,
    /// node id -> whether every local role exited cleanly
    pub finished: BTreeMap<usize, bool>,
}

impl ControlSnapshot {
    pub fn all_joined(&self, node_count: usize) -> bool {
        (0..node_count).all(|node_id| self.joined.contains(&node_id))
    }

    pub fn all_succeeded(&self, node_count: usize) -> bool {
        self.finished.len() == node_count && self.finished.values().all(|ok| *ok)
    }
}

/// Message channel between the supervisors of one job.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Record an abort. If another node got there first, its notice is kept
    /// and returned instead.
    async fn abort(&self, job_id: &str, notice: AbortNotice) -> Result<AbortNotice>;

    /// Record that `node_id` has joined the cluster runtime. Repeating the
    /// report is harmless.
    async fn report_joined(&self, job_id: &str, node_id: usize) -> Result<()>;

    async fn report_finished(&self, job_id: &str, node_id: usize, succeeded: bool) -> Result<()>;

    async fn snapshot(&self, job_id: &str) -> Result<ControlSnapshot>;

    /// Forget everything recorded for `job_id`. The leader calls this before
    /// publishing its endpoint so a resubmitted job starts clean.
    async fn reset(&self, job_id: &str) -> Result<()>;
}

/// Control channel for nodes that live in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryControlChannel {
    jobs: Arc<RwLock<HashMap<String, ControlSnapshot>>>,
}

impl MemoryControlChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlChannel for MemoryControlChannel {
    async fn abort(&self, job_id: &str, notice: AbortNotice) -> Result<AbortNotice> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.entry(job_id.to_string()).or_default();
        Ok(entry.abort.get_or_insert(notice).clone())
    }

    async fn report_joined(&self, job_id: &str, node_id: usize) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.to_string())
            .or_default()
            .joined
            .insert(node_id);
        Ok(())
    }

    async fn report_finished(&self, job_id: &str, node_id: usize, succeeded: bool) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.to_string())
            .or_default()
            .finished
            .insert(node_id, succeeded);
        Ok(())
    }

    async fn snapshot(&self, job_id: &str) -> Result<ControlSnapshot> {
        Ok(self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset(&self, job_id: &str) -> Result<()> {
        self.jobs.write().await.remove(job_id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinedRecord {
    node_id: usize,
    joined_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FinishedRecord {
    node_id: usize,
    succeeded: bool,
    reported_at: DateTime<Utc>,
}

/// Control channel over a shared directory:
///
/// ```text
/// <dir>/<job_id>/abort.json        first abort, never overwritten
/// <dir>/<job_id>/joined-<id>.json  join report per node
/// <dir>/<job_id>/node-<id>.json    completion report per node
/// ```
///
/// The abort record is published by hard-linking a fully written temp file,
/// so exactly one writer wins and readers never see partial content.
#[derive(Debug, Clone)]
pub struct FileControlChannel {
    dir: PathBuf,
}

impl FileControlChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        check_job_id(job_id)?;
        let dir = self.dir.join(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn write_temp(dir: &Path, bytes: Vec<u8>) -> Result<PathBuf> {
        let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        Ok(tmp)
    }

    async fn read_abort(path: &Path) -> Result<Option<AbortNotice>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                LaunchError::Discovery(format!("corrupt abort record {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ControlChannel for FileControlChannel {
    async fn abort(&self, job_id: &str, notice: AbortNotice) -> Result<AbortNotice> {
        let dir = self.job_dir(job_id).await?;
        let path = dir.join("abort.json");
        let tmp = Self::write_temp(&dir, serde_json::to_vec(&notice)?).await?;

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            tracing::debug!(path = %tmp.display(), error = %e, "Failed to remove temp file");
        }

        match linked {
            Ok(()) => {
                tracing::warn!(job_id, origin_node = notice.origin_node, reason = %notice.reason, "Abort published");
                Ok(notice)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Self::read_abort(&path)
                .await?
                .ok_or_else(|| LaunchError::Discovery("abort record vanished".into())),
            Err(e) => Err(e.into()),
        }
    }

    async fn report_joined(&self, job_id: &str, node_id: usize) -> Result<()> {
        let dir = self.job_dir(job_id).await?;
        let record = JoinedRecord {
            node_id,
            joined_at: Utc::now(),
        };
        let tmp = Self::write_temp(&dir, serde_json::to_vec(&record)?).await?;
        tokio::fs::rename(&tmp, dir.join(format!("joined-{}.json", node_id))).await?;
        Ok(())
    }

    async fn report_finished(&self, job_id: &str, node_id: usize, succeeded: bool) -> Result<()> {
        let dir = self.job_dir(job_id).await?;
        let record = FinishedRecord {
            node_id,
            succeeded,
            reported_at: Utc::now(),
        };
        let tmp = Self::write_temp(&dir, serde_json::to_vec(&record)?).await?;
        tokio::fs::rename(&tmp, dir.join(format!("node-{}.json", node_id))).await?;
        Ok(())
    }

    async fn snapshot(&self, job_id: &str) -> Result<ControlSnapshot> {
        check_job_id(job_id)?;
        let dir = self.dir.join(job_id);
        let mut snapshot = ControlSnapshot {
            abort: Self::read_abort(&dir.join("abort.json")).await?,
            ..ControlSnapshot::default()
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(snapshot),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".json") {
                continue;
            }
            if name.starts_with("joined-") {
                let bytes = tokio::fs::read(entry.path()).await?;
                let record: JoinedRecord = serde_json::from_slice(&bytes)?;
                snapshot.joined.insert(record.node_id);
            } else if name.starts_with("node-") {
                let bytes = tokio::fs::read(entry.path()).await?;
                let record: FinishedRecord = serde_json::from_slice(&bytes)?;
                snapshot.finished.insert(record.node_id, record.succeeded);
            }
        }

        Ok(snapshot)
    }

    async fn reset(&self, job_id: &str) -> Result<()> {
        check_job_id(job_id)?;
        let dir = self.dir.join(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(job_id, dir = %dir.display(), "Cleared previous control records");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
