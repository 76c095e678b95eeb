use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::cluster::discovery::Endpoint;
use crate::config::RuntimeCommands;
use crate::error::{LaunchError, Result};

/// The externally managed cluster runtime the job is handed to.
///
/// The launcher only needs to start it on the leader, attach followers to the
/// leader's endpoint, and tear it down afterwards.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Start the runtime on the leader node and return the endpoint followers
    /// should join.
    async fn start_leader(&self, job_id: &str) -> Result<Endpoint>;

    async fn join_follower(&self, job_id: &str, endpoint: &Endpoint) -> Result<()>;

    /// Stop the runtime on this node.
    async fn terminate_all(&self) -> Result<()>;
}

/// Runtime that is already up (or not needed). Reports a fixed endpoint and
/// does nothing else.
#[derive(Debug, Clone)]
pub struct NoopRuntime {
    endpoint: Endpoint,
}

impl NoopRuntime {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl ClusterRuntime for NoopRuntime {
    async fn start_leader(&self, job_id: &str) -> Result<Endpoint> {
        tracing::debug!(job_id, endpoint = %self.endpoint, "Using externally managed runtime");
        Ok(self.endpoint.clone())
    }

    async fn join_follower(&self, job_id: &str, endpoint: &Endpoint) -> Result<()> {
        tracing::debug!(job_id, endpoint = %endpoint, "Follower attached to external runtime");
        Ok(())
    }

    async fn terminate_all(&self) -> Result<()> {
        Ok(())
    }
}

/// Drives a runtime through its own CLI (`ray start --head`, `ray start
/// --address=...`, `ray stop`). Each command is expected to return once the
/// runtime daemon is up, and is killed once it exceeds
/// `RuntimeCommands::timeout_ms`.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    commands: RuntimeCommands,
}

impl ProcessRuntime {
    pub fn new(commands: RuntimeCommands) -> Self {
        Self { commands }
    }

    fn advertised(&self) -> Endpoint {
        Endpoint::from_host_port(&self.commands.advertise_host, self.commands.port)
    }

    /// Substitute `{endpoint}`, `{host}` and `{port}` in every argument.
    pub fn render(template: &[String], endpoint: &Endpoint) -> Vec<String> {
        let port = endpoint.port().map(|p| p.to_string()).unwrap_or_default();
        template
            .iter()
            .map(|arg| {
                arg.replace("{endpoint}", endpoint.as_str())
                    .replace("{host}", endpoint.host())
                    .replace("{port}", &port)
            })
            .collect()
    }

    async fn run(&self, what: &str, argv: Vec<String>) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LaunchError::Runtime(format!("{} command is empty", what)))?;

        tracing::info!(program = %program, args = ?args, "Running cluster runtime {} command", what);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.commands.timeout(), output)
            .await
            .map_err(|_| {
                LaunchError::Runtime(format!(
                    "{} command did not finish within {}ms",
                    what, self.commands.timeout_ms
                ))
            })?
            .map_err(|e| LaunchError::Runtime(format!("failed to run {}: {}", program, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(LaunchError::Runtime(format!(
                "{} command exited with {:?}: {}",
                what,
                output.status.code(),
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl ClusterRuntime for ProcessRuntime {
    async fn start_leader(&self, job_id: &str) -> Result<Endpoint> {
        let endpoint = self.advertised();
        self.run("head", Self::render(&self.commands.head, &endpoint))
            .await?;
        tracing::info!(job_id, endpoint = %endpoint, "Cluster runtime started on leader");
        Ok(endpoint)
    }

    async fn join_follower(&self, job_id: &str, endpoint: &Endpoint) -> Result<()> {
        self.run("join", Self::render(&self.commands.join, endpoint))
            .await?;
        tracing::info!(job_id, endpoint = %endpoint, "Joined cluster runtime");
        Ok(())
    }

    async fn terminate_all(&self) -> Result<()> {
        match &self.commands.stop {
            Some(stop) => self.run("stop", Self::render(stop, &self.advertised())).await,
            None => Ok(()),
        }
    }
}
