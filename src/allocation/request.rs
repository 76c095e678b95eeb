use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};

/// Largest allocation accepted. Every node gets its own layout entry.
pub const MAX_NODE_COUNT: usize = 65_536;

/// Shape of the allocation: how many nodes, how many supervising tasks per
/// node and how many devices each node contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub node_count: usize,
    pub tasks_per_node: usize,
    pub devices_per_node: usize,
}

impl ClusterSpec {
    pub fn new(node_count: usize, tasks_per_node: usize, devices_per_node: usize) -> Self {
        Self {
            node_count,
            tasks_per_node,
            devices_per_node,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(LaunchError::InvalidSpec("node_count must be positive".into()));
        }
        if self.tasks_per_node == 0 {
            return Err(LaunchError::InvalidSpec(
                "tasks_per_node must be positive".into(),
            ));
        }
        if self.devices_per_node == 0 {
            return Err(LaunchError::InvalidSpec(
                "devices_per_node must be positive".into(),
            ));
        }
        if self.node_count > MAX_NODE_COUNT {
            return Err(LaunchError::InvalidSpec(format!(
                "node_count {} exceeds the limit of {}",
                self.node_count, MAX_NODE_COUNT
            )));
        }
        if self.node_count.checked_mul(self.devices_per_node).is_none() {
            return Err(LaunchError::InvalidSpec(format!(
                "{} nodes x {} devices overflows the device count",
                self.node_count, self.devices_per_node
            )));
        }
        if self.node_count.checked_mul(self.tasks_per_node).is_none() {
            return Err(LaunchError::InvalidSpec(format!(
                "{} nodes x {} tasks overflows the world size",
                self.node_count, self.tasks_per_node
            )));
        }
        Ok(())
    }

    /// Total devices across every node. Exact once [`validate`](Self::validate)
    /// has passed.
    pub fn device_budget(&self) -> usize {
        self.node_count.saturating_mul(self.devices_per_node)
    }

    pub fn world_size(&self) -> usize {
        self.node_count.saturating_mul(self.tasks_per_node)
    }
}

/// A named participant in the job and the number of devices it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequest {
    pub name: String,
    pub device_count: usize,
}

impl RoleRequest {
    pub fn new(name: impl Into<String>, device_count: usize) -> Self {
        Self {
            name: name.into(),
            device_count,
        }
    }
}

impl FromStr for RoleRequest {
    type Err = LaunchError;

    /// Parses `name:count`.
    fn from_str(s: &str) -> Result<Self> {
        let (name, count) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| LaunchError::InvalidSpec(format!("expected name:count, got {s:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(LaunchError::InvalidSpec(format!("empty role name in {s:?}")));
        }
        let device_count = count
            .trim()
            .parse()
            .map_err(|_| LaunchError::InvalidSpec(format!("invalid device count in {s:?}")))?;
        Ok(Self::new(name, device_count))
    }
}

/// Parses a comma separated role list, e.g. `trainer:8,ref:4,inference:4`.
/// Order is preserved.
pub fn parse_roles(roles: &str) -> Result<Vec<RoleRequest>> {
    roles
        .split(',')
        .filter(|r| !r.trim().is_empty())
        .map(str::parse)
        .collect()
}
