//! Shared helpers for launcher integration tests.
//!
//! Provides an instrumented cluster runtime and utilities for running every
//! node of a job inside one test process.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rl_launcher::allocation::{ClusterSpec, RoleRequest};
use rl_launcher::cluster::{
    ClusterRuntime, Endpoint, MemoryControlChannel, MemoryDiscovery,
};
use rl_launcher::config::LaunchConfig;
use rl_launcher::supervisor::{JobResult, WorkloadCommand};
use rl_launcher::{LaunchRequest, NodeLauncher, Result};

/// Runtime that records how often each operation was called.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    pub starts: AtomicUsize,
    pub joins: AtomicUsize,
    pub terminations: AtomicUsize,
}

impl RecordingRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterRuntime for RecordingRuntime {
    async fn start_leader(&self, _job_id: &str) -> Result<Endpoint> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Endpoint::new("10.0.0.1:6379"))
    }

    async fn join_follower(&self, _job_id: &str, _endpoint: &Endpoint) -> Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate_all(&self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The reference scenario: two 8-device nodes running trainer, ref and
/// inference.
pub fn two_node_spec() -> ClusterSpec {
    ClusterSpec::new(2, 1, 8)
}

pub fn rl_roles() -> Vec<RoleRequest> {
    vec![
        RoleRequest::new("trainer", 8),
        RoleRequest::new("ref", 4),
        RoleRequest::new("inference", 4),
    ]
}

/// In-process cluster: every node shares the same discovery and control
/// channel and its own recording runtime.
pub struct TestCluster {
    pub discovery: MemoryDiscovery,
    pub control: MemoryControlChannel,
    pub runtime: Arc<RecordingRuntime>,
    pub shutdown: CancellationToken,
    pub config: LaunchConfig,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            discovery: MemoryDiscovery::new(),
            control: MemoryControlChannel::new(),
            runtime: RecordingRuntime::new(),
            shutdown: CancellationToken::new(),
            config: LaunchConfig::fast(),
        }
    }

    pub fn launcher(&self) -> NodeLauncher {
        NodeLauncher::new(
            self.config.clone(),
            self.runtime.clone(),
            Arc::new(self.discovery.clone()),
            Arc::new(self.control.clone()),
            self.shutdown.clone(),
        )
    }

    /// Launch `node_id` in the background.
    pub fn spawn_node(
        &self,
        job_id: &str,
        spec: ClusterSpec,
        roles: Vec<RoleRequest>,
        node_id: usize,
        command: WorkloadCommand,
    ) -> JoinHandle<Result<JobResult>> {
        let launcher = self.launcher();
        let request = LaunchRequest {
            job_id: Some(job_id.to_string()),
            spec,
            roles,
            node_id,
            leader_endpoint: None,
            command,
        };
        tokio::spawn(async move { launcher.launch(request).await })
    }

    /// Launch every node of the job and collect their results in node order.
    pub async fn run_all(
        &self,
        job_id: &str,
        spec: ClusterSpec,
        roles: Vec<RoleRequest>,
        command: WorkloadCommand,
    ) -> Vec<JobResult> {
        let handles: Vec<_> = (0..spec.node_count)
            .map(|node_id| self.spawn_node(job_id, spec, roles.clone(), node_id, command.clone()))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .expect("node task panicked")
                    .expect("launch rejected"),
            );
        }
        results
    }
}
