use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::allocation::{DeviceAssignment, NodeRank};
use crate::cluster::discovery::{Endpoint, EndpointDiscovery};
use crate::cluster::runtime::ClusterRuntime;
use crate::config::BootstrapConfig;
use crate::error::{LaunchError, Result};

/// Proof that this node is part of the job's cluster runtime.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub job_id: String,
    pub node: NodeRank,
    pub endpoint: Endpoint,
    pub assignments: Arc<[DeviceAssignment]>,
    pub joined_at: DateTime<Utc>,
}

/// Starts (leader) or joins (follower) the cluster runtime for one node.
///
/// # Leader
/// Starts the runtime and publishes its endpoint to the discovery slot.
///
/// # Followers
/// Use the endpoint they were given, or poll discovery until the leader
/// publishes, then join. Finding and joining the leader together give up
/// after `BootstrapConfig::wait_window_ms` with
/// [`LaunchError::BootstrapTimeout`].
///
/// Once bootstrap succeeds, later calls return the same handle.
pub struct Bootstrapper {
    job_id: String,
    runtime: Arc<dyn ClusterRuntime>,
    discovery: Arc<dyn EndpointDiscovery>,
    config: BootstrapConfig,
    handle: Mutex<Option<ClusterHandle>>,
}

impl Bootstrapper {
    pub fn new(
        job_id: impl Into<String>,
        runtime: Arc<dyn ClusterRuntime>,
        discovery: Arc<dyn EndpointDiscovery>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            runtime,
            discovery,
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn bootstrap(
        &self,
        node: NodeRank,
        assignments: &[DeviceAssignment],
        leader_endpoint: Option<Endpoint>,
    ) -> Result<ClusterHandle> {
        // Held for the whole call so concurrent callers wait for the first one.
        let mut slot = self.handle.lock().await;

        if let Some(existing) = slot.as_ref() {
            if existing.node != node {
                return Err(LaunchError::InvalidSpec(format!(
                    "node {} already bootstrapped, cannot bootstrap as node {}",
                    existing.node.node_id, node.node_id
                )));
            }
            tracing::debug!(job_id = %self.job_id, node_id = node.node_id, "Already bootstrapped");
            return Ok(existing.clone());
        }

        let endpoint = if node.is_leader {
            // A slot left behind by an earlier run of the same job must not be joined.
            self.discovery.retract(&self.job_id).await?;
            let endpoint = self.runtime.start_leader(&self.job_id).await?;
            self.discovery.publish(&self.job_id, &endpoint).await?;
            endpoint
        } else {
            self.join(node, leader_endpoint).await?
        };

        let handle = ClusterHandle {
            job_id: self.job_id.clone(),
            node,
            endpoint,
            assignments: assignments.to_vec().into(),
            joined_at: Utc::now(),
        };

        tracing::info!(
            job_id = %self.job_id,
            node_id = node.node_id,
            leader = node.is_leader,
            endpoint = %handle.endpoint,
            roles = ?handle.assignments.iter().map(|a| a.role.as_str()).collect::<Vec<_>>(),
            "Node bootstrapped"
        );

        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Find the leader and join it. Discovery and the join itself share one
    /// wait window.
    async fn join(&self, node: NodeRank, leader_endpoint: Option<Endpoint>) -> Result<Endpoint> {
        tracing::info!(
            job_id = %self.job_id,
            node_id = node.node_id,
            wait_ms = self.config.wait_window_ms,
            "Joining leader"
        );

        let join = async {
            let endpoint = match leader_endpoint {
                Some(endpoint) => endpoint,
                None => self.poll_leader().await,
            };
            self.runtime.join_follower(&self.job_id, &endpoint).await?;
            Ok::<_, LaunchError>(endpoint)
        };

        tokio::time::timeout(self.config.wait_window(), join)
            .await
            .map_err(|_| LaunchError::BootstrapTimeout {
                job_id: self.job_id.clone(),
                waited_ms: self.config.wait_window_ms,
            })?
    }

    async fn poll_leader(&self) -> Endpoint {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        loop {
            interval.tick().await;
            match self.discovery.lookup(&self.job_id).await {
                Ok(Some(endpoint)) => return endpoint,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Discovery lookup failed");
                }
            }
        }
    }

    /// Leave the cluster runtime. The leader also retracts its endpoint.
    pub async fn teardown(&self) -> Result<()> {
        let mut slot = self.handle.lock().await;
        let Some(handle) = slot.take() else {
            return Ok(());
        };

        let retracted = if handle.node.is_leader {
            self.discovery.retract(&self.job_id).await
        } else {
            Ok(())
        };
        // The runtime is stopped even when the endpoint could not be retracted.
        let terminated = self.runtime.terminate_all().await;
        tracing::info!(job_id = %self.job_id, node_id = handle.node.node_id, "Left cluster runtime");
        retracted.and(terminated)
    }
}
