use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{LaunchError, Result};

/// Address followers use to reach the leader's cluster runtime (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.0)
    }

    pub fn port(&self) -> Option<u16> {
        self.0.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single well-known slot through which the leader publishes its
/// endpoint for a job and followers find it.
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn publish(&self, job_id: &str, endpoint: &Endpoint) -> Result<()>;

    /// `Ok(None)` while the leader has not published yet.
    async fn lookup(&self, job_id: &str) -> Result<Option<Endpoint>>;

    async fn retract(&self, job_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct EndpointRecord {
    endpoint: Endpoint,
    published_at: DateTime<Utc>,
}

/// Discovery through a directory every node can see (NFS, Lustre, ...).
///
/// The leader writes `<dir>/<job_id>.endpoint` via write-then-rename so a
/// follower never observes a half written record.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    dir: PathBuf,
}

impl FileDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, job_id: &str) -> Result<PathBuf> {
        check_job_id(job_id)?;
        Ok(self.dir.join(format!("{}.endpoint", job_id)))
    }
}

#[async_trait]
impl EndpointDiscovery for FileDiscovery {
    async fn publish(&self, job_id: &str, endpoint: &Endpoint) -> Result<()> {
        let path = self.slot_path(job_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let record = EndpointRecord {
            endpoint: endpoint.clone(),
            published_at: Utc::now(),
        };
        let tmp = self
            .dir
            .join(format!(".{}.endpoint.{}", job_id, Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec(&record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::info!(job_id, endpoint = %endpoint, path = %path.display(), "Leader endpoint published");
        Ok(())
    }

    async fn lookup(&self, job_id: &str) -> Result<Option<Endpoint>> {
        let path = self.slot_path(job_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: EndpointRecord = serde_json::from_slice(&bytes).map_err(|e| {
                    LaunchError::Discovery(format!("corrupt record {}: {}", path.display(), e))
                })?;
                Ok(Some(record.endpoint))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn retract(&self, job_id: &str) -> Result<()> {
        let path = self.slot_path(job_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Endpoint known up front, e.g. passed on the command line.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    endpoint: Endpoint,
}

impl StaticDiscovery {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl EndpointDiscovery for StaticDiscovery {
    async fn publish(&self, job_id: &str, endpoint: &Endpoint) -> Result<()> {
        if endpoint != &self.endpoint {
            tracing::warn!(
                job_id,
                published = %endpoint,
                configured = %self.endpoint,
                "Leader endpoint differs from the statically configured one"
            );
        }
        Ok(())
    }

    async fn lookup(&self, _job_id: &str) -> Result<Option<Endpoint>> {
        Ok(Some(self.endpoint.clone()))
    }

    async fn retract(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

/// In-process slots. Clones share state, so several nodes simulated in one
/// process see each other's endpoints.
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscovery {
    slots: Arc<RwLock<HashMap<String, Endpoint>>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointDiscovery for MemoryDiscovery {
    async fn publish(&self, job_id: &str, endpoint: &Endpoint) -> Result<()> {
        self.slots
            .write()
            .await
            .insert(job_id.to_string(), endpoint.clone());
        Ok(())
    }

    async fn lookup(&self, job_id: &str) -> Result<Option<Endpoint>> {
        Ok(self.slots.read().await.get(job_id).cloned())
    }

    async fn retract(&self, job_id: &str) -> Result<()> {
        self.slots.write().await.remove(job_id);
        Ok(())
    }
}

/// Job ids become file names in the shared directories.
pub(crate) fn check_job_id(job_id: &str) -> Result<()> {
    let valid = !job_id.is_empty()
        && !job_id.starts_with('.')
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LaunchError::Discovery(format!(
            "job id {:?} is not usable as a file name",
            job_id
        )))
    }
}
