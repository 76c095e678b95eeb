use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cluster::{AbortNotice, ClusterHandle, ControlChannel};
use crate::config::SupervisorConfig;
use crate::error::LaunchError;
use crate::supervisor::executor::{watch, RoleExit, RoleOutcome, WorkloadCommand, WorkloadExecutor};
use crate::supervisor::job::{JobRun, JobStatus};

/// Process exit code used when no role exit code is available.
pub const GENERIC_FAILURE_CODE: i32 = 1;

/// Outcome of a job as observed by one node.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub node_id: usize,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    pub roles: Vec<RoleExit>,
    exit_code: Option<i32>,
}

impl JobResult {
    fn from_run(run: &JobRun, node_id: usize, roles: Vec<RoleExit>) -> Self {
        Self {
            job_id: run.id.clone(),
            node_id,
            status: run.status,
            failure_reason: run.failure_reason.clone(),
            roles,
            exit_code: run.exit_code,
        }
    }

    /// 0 on success, the first failing role's exit code where known,
    /// [`GENERIC_FAILURE_CODE`] otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            JobStatus::Succeeded => 0,
            _ => match self.exit_code {
                Some(code) if code != 0 => code,
                _ => GENERIC_FAILURE_CODE,
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Owns a node's view of a [`JobRun`] for its whole life.
///
/// ## Fail-fast
/// The first role to exit non-zero, on any node, fails the job. The node that
/// sees it publishes an [`AbortNotice`]; every supervisor (including the
/// originator) then sends SIGTERM to its local roles and SIGKILLs whatever
/// outlives the grace period.
///
/// ## Completion
/// A node whose roles all exit cleanly reports in and waits until every node
/// has. Only then is the job Succeeded.
pub struct JobSupervisor {
    run: JobRun,
    control: Arc<dyn ControlChannel>,
    executor: WorkloadExecutor,
    config: SupervisorConfig,
    shutdown: CancellationToken,
}

impl JobSupervisor {
    pub fn new(
        run: JobRun,
        control: Arc<dyn ControlChannel>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            run,
            control,
            executor: WorkloadExecutor::new(config.clone()),
            config,
            shutdown,
        }
    }

    pub fn job(&self) -> &JobRun {
        &self.run
    }

    pub fn into_job(self) -> JobRun {
        self.run
    }

    /// Report this node as joined and wait until every node of the job has,
    /// so no role starts while part of the cluster is missing.
    ///
    /// # Errors
    ///
    /// [`LaunchError::JoinTimeout`] when the nodes have not all joined within
    /// `wait`, [`LaunchError::PeerAborted`] when another node gave up first,
    /// [`LaunchError::Cancelled`] on shutdown.
    pub async fn await_cluster(&self, node_id: usize, wait: Duration) -> Result<(), LaunchError> {
        let job_id = self.run.id.as_str();
        let node_count = self.run.spec.node_count;

        let barrier = async {
            let mut poll = tokio::time::interval(self.config.poll_interval());
            loop {
                poll.tick().await;
                // Repeated on every tick: the leader clears old records when it starts.
                if let Err(e) = self.control.report_joined(job_id, node_id).await {
                    tracing::warn!(job_id, node_id, error = %e, "Failed to report join");
                    continue;
                }
                let snapshot = match self.control.snapshot(job_id).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::warn!(job_id, node_id, error = %e, "Control channel read failed");
                        continue;
                    }
                };
                if let Some(notice) = snapshot.abort {
                    return Err(LaunchError::PeerAborted {
                        origin_node: notice.origin_node,
                        reason: notice.reason,
                    });
                }
                if snapshot.all_joined(node_count) {
                    return Ok(());
                }
                tracing::trace!(job_id, node_id, joined = snapshot.joined.len(), node_count, "Waiting for nodes to join");
            }
        };

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(wait, barrier) => outcome,
            _ = self.shutdown.cancelled() => {
                return Err(LaunchError::Cancelled("cancelled while waiting for nodes to join".into()));
            }
        };

        match outcome {
            Ok(result) => {
                if result.is_ok() {
                    tracing::info!(job_id, node_id, node_count, "All nodes joined");
                }
                result
            }
            Err(_) => {
                let joined = self
                    .control
                    .snapshot(job_id)
                    .await
                    .map(|s| s.joined.len())
                    .unwrap_or(0);
                Err(LaunchError::JoinTimeout {
                    job_id: job_id.to_string(),
                    joined,
                    expected: node_count,
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Record a failure that happened before the workload could start (e.g.
    /// bootstrap timeout) and tell the other nodes to stop.
    pub async fn fail_before_start(&mut self, node_id: usize, error: &LaunchError) -> JobResult {
        let notice = AbortNotice::new(node_id, error.to_string());
        self.publish_abort(notice).await;
        self.finish(node_id, Some(error.to_string()), None, Vec::new())
    }

    pub async fn run(&mut self, handle: &ClusterHandle, command: &WorkloadCommand) -> JobResult {
        let node_id = handle.node.node_id;

        if let Err(e) = self.run.mark_running() {
            tracing::error!(job_id = %self.run.id, error = %e, "Job cannot start");
            return JobResult::from_run(&self.run, node_id, Vec::new());
        }

        tracing::info!(
            job_id = %self.run.id,
            node_id,
            roles = handle.assignments.len(),
            "Job running"
        );

        let abort = CancellationToken::new();
        let grace = self.config.grace_period();
        let mut failure: Option<Failure> = None;
        let mut tasks = JoinSet::new();

        for assignment in handle.assignments.iter() {
            match self
                .executor
                .spawn(handle, &self.run.spec, assignment, command)
            {
                Ok(running) => {
                    tasks.spawn(watch(running, abort.clone(), grace));
                }
                Err(e) => {
                    let notice =
                        AbortNotice::new(node_id, e.to_string()).for_role(&assignment.role, None);
                    failure = Some(Failure::local(&e, None));
                    self.publish_abort(notice).await;
                    abort.cancel();
                    break;
                }
            }
        }

        let mut exits = Vec::with_capacity(handle.assignments.len());
        let mut poll = tokio::time::interval(self.config.poll_interval());

        loop {
            let aborting = abort.is_cancelled();
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let exit = match joined {
                        Ok(exit) => exit,
                        Err(e) => {
                            tracing::error!(job_id = %self.run.id, node_id, error = %e, "Role watcher panicked");
                            if !aborting {
                                failure = Some(Failure::Local(format!("role watcher failed: {}", e), None));
                                self.publish_abort(AbortNotice::new(node_id, e.to_string())).await;
                                abort.cancel();
                            }
                            continue;
                        }
                    };

                    if exit.outcome == RoleOutcome::Failed && !aborting {
                        let error = LaunchError::WorkloadFailure {
                            role: exit.role.clone(),
                            node_id,
                            exit_code: exit.exit_code,
                            reason: exit.describe(),
                        };
                        tracing::error!(job_id = %self.run.id, node_id, role = %exit.role, "Role failed, aborting job");
                        let notice = AbortNotice::new(node_id, error.to_string())
                            .for_role(&exit.role, exit.exit_code);
                        let recorded = self.publish_abort(notice).await;
                        failure = Some(match recorded {
                            Some(first) if first.origin_node != node_id => Failure::Peer(first),
                            _ => Failure::local(&error, exit.exit_code),
                        });
                        abort.cancel();
                    }
                    exits.push(exit);
                }
                _ = poll.tick(), if !aborting => {
                    if let Some(notice) = self.peer_abort(node_id).await {
                        tracing::warn!(
                            job_id = %self.run.id,
                            node_id,
                            origin_node = notice.origin_node,
                            reason = %notice.reason,
                            "Peer aborted job, stopping local roles"
                        );
                        failure = Some(Failure::Peer(notice));
                        abort.cancel();
                    }
                }
                _ = self.shutdown.cancelled(), if !aborting => {
                    tracing::warn!(job_id = %self.run.id, node_id, "Cancellation requested, stopping job");
                    failure = Some(Failure::Cancelled);
                    self.publish_abort(AbortNotice::new(node_id, "cancelled by operator")).await;
                    abort.cancel();
                }
            }
        }

        if failure.is_none() {
            failure = self.await_peers(node_id).await;
        } else if let Err(e) = self.control.report_finished(&self.run.id, node_id, false).await {
            tracing::warn!(job_id = %self.run.id, node_id, error = %e, "Failed to report completion");
        }

        let killed: Vec<String> = exits
            .iter()
            .filter(|e| e.outcome == RoleOutcome::Killed)
            .map(|e| e.role.clone())
            .collect();

        let (reason, exit_code) = match failure {
            None => (None, None),
            Some(Failure::Cancelled) if !killed.is_empty() => (
                Some(LaunchError::ForcedTermination { roles: killed }.to_string()),
                None,
            ),
            Some(failure) => {
                let (mut reason, code) = failure.describe();
                if !killed.is_empty() {
                    reason = format!(
                        "{}; {}",
                        reason,
                        LaunchError::ForcedTermination { roles: killed }
                    );
                }
                (Some(reason), code)
            }
        };

        self.finish(node_id, reason, exit_code, exits)
    }

    /// Report local success and wait for every other node to finish.
    async fn await_peers(&self, node_id: usize) -> Option<Failure> {
        if let Err(e) = self.control.report_finished(&self.run.id, node_id, true).await {
            tracing::error!(job_id = %self.run.id, node_id, error = %e, "Failed to report completion");
            return Some(Failure::Local(format!("failed to report completion: {}", e), None));
        }

        let node_count = self.run.spec.node_count;
        let mut poll = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let snapshot = match self.control.snapshot(&self.run.id).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            tracing::warn!(job_id = %self.run.id, node_id, error = %e, "Control channel read failed");
                            continue;
                        }
                    };
                    if let Some(notice) = snapshot.abort {
                        return Some(Failure::Peer(notice));
                    }
                    if snapshot.all_succeeded(node_count) {
                        return None;
                    }
                    if let Some((peer, _)) = snapshot.finished.iter().find(|(_, ok)| !**ok) {
                        return Some(Failure::Local(format!("node {} reported failure", peer), None));
                    }
                    tracing::trace!(job_id = %self.run.id, node_id, finished = snapshot.finished.len(), node_count, "Waiting for peers");
                }
                _ = self.shutdown.cancelled() => {
                    self.publish_abort(AbortNotice::new(node_id, "cancelled by operator")).await;
                    return Some(Failure::Cancelled);
                }
            }
        }
    }

    async fn peer_abort(&self, node_id: usize) -> Option<AbortNotice> {
        match self.control.snapshot(&self.run.id).await {
            Ok(snapshot) => snapshot.abort.filter(|n| n.origin_node != node_id),
            Err(e) => {
                tracing::warn!(job_id = %self.run.id, node_id, error = %e, "Control channel read failed");
                None
            }
        }
    }

    /// Publish an abort, returning the notice that is actually on record.
    async fn publish_abort(&self, notice: AbortNotice) -> Option<AbortNotice> {
        match self.control.abort(&self.run.id, notice).await {
            Ok(recorded) => Some(recorded),
            Err(e) => {
                tracing::error!(job_id = %self.run.id, error = %e, "Failed to publish abort");
                None
            }
        }
    }

    fn finish(
        &mut self,
        node_id: usize,
        reason: Option<String>,
        exit_code: Option<i32>,
        roles: Vec<RoleExit>,
    ) -> JobResult {
        let transition = match reason {
            None => self.run.mark_succeeded(),
            Some(reason) => self.run.mark_failed(reason, exit_code),
        };
        if let Err(e) = transition {
            tracing::error!(job_id = %self.run.id, error = %e, "Job already finished");
        }

        match self.run.status {
            JobStatus::Succeeded => {
                tracing::info!(job_id = %self.run.id, node_id, "Job succeeded")
            }
            status => tracing::error!(
                job_id = %self.run.id,
                node_id,
                status = %status,
                reason = ?self.run.failure_reason,
                exit_code = ?self.run.exit_code,
                "Job finished"
            ),
        }

        JobResult::from_run(&self.run, node_id, roles)
    }
}

enum Failure {
    Local(String, Option<i32>),
    Peer(AbortNotice),
    Cancelled,
}

impl Failure {
    fn local(error: &LaunchError, exit_code: Option<i32>) -> Self {
        Failure::Local(error.to_string(), exit_code)
    }

    fn describe(self) -> (String, Option<i32>) {
        match self {
            Failure::Local(reason, code) => (reason, code),
            Failure::Peer(notice) => (
                format!("aborted by node {}: {}", notice.origin_node, notice.reason),
                notice.exit_code,
            ),
            Failure::Cancelled => (
                LaunchError::Cancelled("cancelled by operator".into()).to_string(),
                None,
            ),
        }
    }
}
