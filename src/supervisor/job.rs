use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocation::{partition, resolve, ClusterSpec, DeviceAssignment, RoleRequest};
use crate::error::{LaunchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One submission of a multi-role job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub spec: ClusterSpec,
    pub roles: Vec<RoleRequest>,
    pub assignments: BTreeMap<usize, Vec<DeviceAssignment>>,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// Validate and lay out a job. Fails before anything is started if the
    /// roles do not fit the cluster.
    pub fn submit(id: Option<String>, spec: ClusterSpec, roles: Vec<RoleRequest>) -> Result<Self> {
        let partition = partition(&spec, &roles)?;
        let layout = resolve(&spec, &partition)?;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        tracing::info!(
            job_id = %id,
            nodes = spec.node_count,
            devices_per_node = spec.devices_per_node,
            requested = partition.allocated(),
            idle = partition.unallocated(),
            "Job submitted"
        );

        Ok(Self {
            id,
            spec,
            roles,
            assignments: layout.into_nodes(),
            status: JobStatus::Pending,
            failure_reason: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        })
    }

    pub fn assignments_for(&self, node_id: usize) -> &[DeviceAssignment] {
        self.assignments
            .get(&node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_succeeded(&mut self) -> Result<()> {
        self.transition(JobStatus::Succeeded)?;
        self.exit_code = Some(0);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: String, exit_code: Option<i32>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.failure_reason = Some(reason);
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        );
        if !allowed {
            return Err(self.invalid(to));
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %to, "Job status changed");
        self.status = to;
        Ok(())
    }

    fn invalid(&self, to: JobStatus) -> LaunchError {
        LaunchError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}
