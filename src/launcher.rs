use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::allocation::{ClusterSpec, NodeRank, RoleRequest};
use crate::cluster::{Bootstrapper, ClusterRuntime, ControlChannel, Endpoint, EndpointDiscovery};
use crate::config::LaunchConfig;
use crate::error::{LaunchError, Result};
use crate::supervisor::{JobResult, JobRun, JobSupervisor, WorkloadCommand};

/// Everything one node needs to take part in a job. Every node of the job
/// must be given the same `job_id`, `spec` and `roles`.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub job_id: Option<String>,
    pub spec: ClusterSpec,
    pub roles: Vec<RoleRequest>,
    pub node_id: usize,
    /// Skip discovery and join this endpoint directly (followers only)
    pub leader_endpoint: Option<Endpoint>,
    pub command: WorkloadCommand,
}

/// Runs this node's share of a job from validation to final status.
pub struct NodeLauncher {
    pub config: LaunchConfig,
    pub runtime: Arc<dyn ClusterRuntime>,
    pub discovery: Arc<dyn EndpointDiscovery>,
    pub control: Arc<dyn ControlChannel>,
    pub shutdown: CancellationToken,
}

impl NodeLauncher {
    pub fn new(
        config: LaunchConfig,
        runtime: Arc<dyn ClusterRuntime>,
        discovery: Arc<dyn EndpointDiscovery>,
        control: Arc<dyn ControlChannel>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            runtime,
            discovery,
            control,
            shutdown,
        }
    }

    /// Launch this node's roles.
    ///
    /// 1. Validates and lays out the job (validation errors are returned
    ///    before anything starts)
    /// 2. Starts or joins the cluster runtime
    /// 3. Waits until every node has joined
    /// 4. Supervises the local roles until the whole job has finished
    /// 5. Leaves the cluster runtime
    ///
    /// # Errors
    ///
    /// Only validation errors are returned as `Err`. Bootstrap and workload
    /// failures are reported through the returned [`JobResult`].
    pub async fn launch(&self, request: LaunchRequest) -> Result<JobResult> {
        // Nodes find each other through the job id, so they cannot each make one up.
        if request.job_id.is_none() && request.spec.node_count > 1 {
            return Err(LaunchError::InvalidSpec(
                "a multi-node job needs a job id shared by every node".into(),
            ));
        }
        let run = JobRun::submit(request.job_id, request.spec, request.roles)?;
        let node = NodeRank::new(request.node_id, &run.spec)?;
        let assignments = run.assignments_for(node.node_id).to_vec();

        let run_id = run.id.clone();
        let bootstrapper = Bootstrapper::new(
            run_id.clone(),
            self.runtime.clone(),
            self.discovery.clone(),
            self.config.bootstrap.clone(),
        );
        let mut supervisor = JobSupervisor::new(
            run,
            self.control.clone(),
            self.config.supervisor.clone(),
            self.shutdown.clone(),
        );

        if node.is_leader {
            if let Err(e) = self.control.reset(&run_id).await {
                tracing::error!(job_id = %run_id, error = %e, "Failed to clear previous control records");
                return Ok(supervisor.fail_before_start(node.node_id, &e).await);
            }
        }

        let bootstrapped = tokio::select! {
            result = bootstrapper.bootstrap(node, &assignments, request.leader_endpoint) => result,
            _ = self.shutdown.cancelled() => {
                Err(LaunchError::Cancelled("cancelled during bootstrap".into()))
            }
        };

        let handle = match bootstrapped {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(job_id = %bootstrapper.job_id(), node_id = node.node_id, error = %e, "Bootstrap failed");
                return Ok(supervisor.fail_before_start(node.node_id, &e).await);
            }
        };

        let result = match supervisor
            .await_cluster(node.node_id, self.config.bootstrap.wait_window())
            .await
        {
            Ok(()) => supervisor.run(&handle, &request.command).await,
            Err(e) => {
                tracing::error!(job_id = %run_id, node_id = node.node_id, error = %e, "Cluster incomplete, not starting roles");
                supervisor.fail_before_start(node.node_id, &e).await
            }
        };

        if let Err(e) = bootstrapper.teardown().await {
            tracing::warn!(job_id = %result.job_id, node_id = node.node_id, error = %e, "Cluster runtime teardown failed");
        }

        Ok(result)
    }
}
