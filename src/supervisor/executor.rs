use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::allocation::{ClusterSpec, DeviceAssignment};
use crate::cluster::ClusterHandle;
use crate::config::SupervisorConfig;
use crate::error::{LaunchError, Result};

/// The workload every role runs. Roles tell themselves apart through the
/// `RL_LAUNCH_ROLE` environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkloadCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Run `command` through `sh -c`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), command.into()])
    }

    /// Build from an argv vector (`program arg...`).
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LaunchError::InvalidSpec("workload command is empty".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

/// How a role's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleOutcome {
    /// Exited on its own with status 0
    Succeeded,
    /// Exited on its own with a non-zero status or a signal
    Failed,
    /// Stopped by SIGTERM during an abort
    Terminated,
    /// Still alive after the grace period and killed
    Killed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleExit {
    pub role: String,
    pub node_id: usize,
    pub outcome: RoleOutcome,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl RoleExit {
    fn from_status(role: String, node_id: usize, status: ExitStatus, aborted: bool) -> Self {
        let outcome = match (aborted, status.success()) {
            (true, _) => RoleOutcome::Terminated,
            (false, true) => RoleOutcome::Succeeded,
            (false, false) => RoleOutcome::Failed,
        };
        Self {
            role,
            node_id,
            outcome,
            exit_code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RoleOutcome::Succeeded
    }

    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

/// A spawned role process.
#[derive(Debug)]
pub struct RunningRole {
    pub role: String,
    pub node_id: usize,
    pub pid: Option<u32>,
    child: Child,
}

/// Environment handed to a role process before it initialises its devices.
pub fn workload_env(
    handle: &ClusterHandle,
    spec: &ClusterSpec,
    assignment: &DeviceAssignment,
    device_env_var: &str,
) -> Vec<(String, String)> {
    let devices = assignment.device_list();
    vec![
        ("RL_LAUNCH_JOB_ID".to_string(), handle.job_id.clone()),
        ("RL_LAUNCH_ROLE".to_string(), assignment.role.clone()),
        ("RL_LAUNCH_DEVICES".to_string(), devices.clone()),
        (device_env_var.to_string(), devices),
        (
            "RL_LAUNCH_NODE_RANK".to_string(),
            assignment.node_id.to_string(),
        ),
        (
            "RL_LAUNCH_NUM_NODES".to_string(),
            spec.node_count.to_string(),
        ),
        (
            "RL_LAUNCH_WORLD_SIZE".to_string(),
            spec.world_size().to_string(),
        ),
        (
            "RL_LAUNCH_TASKS_PER_NODE".to_string(),
            spec.tasks_per_node.to_string(),
        ),
        (
            "RL_LAUNCH_ROLE_DEVICE_OFFSET".to_string(),
            assignment.role_device_offset.to_string(),
        ),
        (
            "RL_LAUNCH_CLUSTER_ENDPOINT".to_string(),
            handle.endpoint.to_string(),
        ),
    ]
}

/// Spawns role processes bound to their devices and tears them down on abort.
#[derive(Debug, Clone)]
pub struct WorkloadExecutor {
    config: SupervisorConfig,
}

impl WorkloadExecutor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Output streams for a role: the node's append-only log file when a log
    /// directory is configured, otherwise the launcher's own stdout/stderr.
    fn stdio(&self, node_id: usize) -> std::io::Result<(Stdio, Stdio)> {
        let Some(dir) = &self.config.log_dir else {
            return Ok((Stdio::inherit(), Stdio::inherit()));
        };
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("node-{}.log", node_id)))?;
        Ok((file.try_clone()?.into(), file.into()))
    }

    pub fn spawn(
        &self,
        handle: &ClusterHandle,
        spec: &ClusterSpec,
        assignment: &DeviceAssignment,
        command: &WorkloadCommand,
    ) -> Result<RunningRole> {
        let spawn_failed = |e: std::io::Error| LaunchError::WorkloadFailure {
            role: assignment.role.clone(),
            node_id: assignment.node_id,
            exit_code: None,
            reason: format!("failed to spawn {}: {}", command.program, e),
        };

        let (stdout, stderr) = self.stdio(assignment.node_id).map_err(spawn_failed)?;

        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(workload_env(handle, spec, assignment, &self.config.device_env_var))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        let pid = child.id();
        tracing::info!(
            job_id = %handle.job_id,
            node_id = assignment.node_id,
            role = %assignment.role,
            devices = %assignment.device_list(),
            pid = ?pid,
            "Role started"
        );

        Ok(RunningRole {
            role: assignment.role.clone(),
            node_id: assignment.node_id,
            pid,
            child,
        })
    }
}

/// Wait for a role to exit. When `abort` fires first the role gets SIGTERM,
/// and SIGKILL if it is still running after `grace`.
pub async fn watch(running: RunningRole, abort: CancellationToken, grace: Duration) -> RoleExit {
    let RunningRole {
        role,
        node_id,
        pid,
        mut child,
    } = running;

    tokio::select! {
        status = child.wait() => {
            return match status {
                Ok(status) => {
                    let exit = RoleExit::from_status(role, node_id, status, false);
                    tracing::info!(node_id, role = %exit.role, outcome = ?exit.outcome, status = %exit.describe(), "Role exited");
                    exit
                }
                Err(e) => {
                    tracing::error!(node_id, role = %role, error = %e, "Failed to wait for role");
                    RoleExit { role, node_id, outcome: RoleOutcome::Failed, exit_code: None, signal: None }
                }
            };
        }
        _ = abort.cancelled() => {}
    }

    if let Some(pid) = pid {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(node_id, role = %role, pid, error = %e, "SIGTERM not delivered");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(node_id, role = %role, "Role terminated");
            RoleExit::from_status(role, node_id, status, true)
        }
        Ok(Err(e)) => {
            tracing::error!(node_id, role = %role, error = %e, "Failed to wait for role");
            RoleExit {
                role,
                node_id,
                outcome: RoleOutcome::Terminated,
                exit_code: None,
                signal: None,
            }
        }
        Err(_) => {
            tracing::warn!(
                node_id,
                role = %role,
                grace_ms = grace.as_millis() as u64,
                "Role ignored SIGTERM, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::error!(node_id, role = %role, error = %e, "Failed to kill role");
            }
            RoleExit {
                role,
                node_id,
                outcome: RoleOutcome::Killed,
                exit_code: None,
                signal: Some(Signal::SIGKILL as i32),
            }
        }
    }
}
