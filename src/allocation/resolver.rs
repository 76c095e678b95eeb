use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::allocation::partitioner::Partition;
use crate::allocation::request::ClusterSpec;
use crate::error::{LaunchError, Result};

/// Position of a node in the job. Node 0 is the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRank {
    pub node_id: usize,
    pub is_leader: bool,
}

impl NodeRank {
    pub fn new(node_id: usize, spec: &ClusterSpec) -> Result<Self> {
        if node_id >= spec.node_count {
            return Err(LaunchError::InvalidSpec(format!(
                "node id {} outside [0, {})",
                node_id, spec.node_count
            )));
        }
        Ok(Self {
            node_id,
            is_leader: node_id == 0,
        })
    }

    /// Global rank of the first task launched on this node.
    pub fn first_task_rank(&self, spec: &ClusterSpec) -> usize {
        self.node_id * spec.tasks_per_node
    }
}

/// Devices a role owns on one node. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub role: String,
    pub node_id: usize,
    /// Node-local device indices, contiguous and ascending
    pub device_indices: Vec<usize>,
    /// Index of this node among the nodes hosting the role
    pub role_node_index: usize,
    /// Number of the role's devices placed on earlier nodes
    pub role_device_offset: usize,
}

impl DeviceAssignment {
    /// Comma separated device list, e.g. `"4,5,6,7"`.
    pub fn device_list(&self) -> String {
        self.device_indices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Per-node placement of every role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLayout {
    spec: ClusterSpec,
    nodes: BTreeMap<usize, Vec<DeviceAssignment>>,
}

impl NodeLayout {
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Assignments hosted on `node_id`, in role request order.
    pub fn for_node(&self, node_id: usize) -> &[DeviceAssignment] {
        self.nodes.get(&node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> &BTreeMap<usize, Vec<DeviceAssignment>> {
        &self.nodes
    }

    /// Nodes hosting `role`, ascending.
    pub fn hosting_nodes(&self, role: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|(_, assignments)| assignments.iter().any(|a| a.role == role))
            .map(|(node_id, _)| *node_id)
            .collect()
    }

    pub fn into_nodes(self) -> BTreeMap<usize, Vec<DeviceAssignment>> {
        self.nodes
    }
}

/// Maps each role's global device range onto nodes.
///
/// A role that fits inside one node stays on that node. A role spanning
/// several nodes must start on a node boundary and fill every node it touches.
/// Roles with no devices are still placed, with an empty device set, on the
/// node where the partition cursor sits.
pub fn resolve(spec: &ClusterSpec, partition: &Partition) -> Result<NodeLayout> {
    spec.validate()?;
    if partition.budget() != spec.device_budget() {
        return Err(LaunchError::InvalidSpec(format!(
            "partition built for {} devices, cluster has {}",
            partition.budget(),
            spec.device_budget()
        )));
    }

    let per_node = spec.devices_per_node;
    let last_node = spec.node_count - 1;
    let mut nodes: BTreeMap<usize, Vec<DeviceAssignment>> =
        (0..spec.node_count).map(|n| (n, Vec::new())).collect();

    for slice in partition.slices() {
        let range = &slice.devices;

        if range.is_empty() {
            let node_id = (range.start / per_node).min(last_node);
            push(&mut nodes, node_id, slice.role.clone(), Vec::new(), 0, 0);
            continue;
        }

        let first = range.start / per_node;
        let last = (range.end - 1) / per_node;

        if first == last {
            let local = (range.start % per_node)..(range.start % per_node + range.len());
            push(&mut nodes, first, slice.role.clone(), local.collect(), 0, 0);
            continue;
        }

        if range.start % per_node != 0 || range.len() % per_node != 0 {
            return Err(LaunchError::UnsatisfiableLayout {
                role: slice.role.clone(),
                reason: format!(
                    "{} devices starting at device {} of node {} straddle nodes {}..={}; \
                     a role spanning nodes must occupy whole nodes",
                    range.len(),
                    range.start % per_node,
                    first,
                    first,
                    last
                ),
            });
        }

        for (role_node_index, node_id) in (first..=last).enumerate() {
            push(
                &mut nodes,
                node_id,
                slice.role.clone(),
                (0..per_node).collect(),
                role_node_index,
                role_node_index * per_node,
            );
        }
    }

    Ok(NodeLayout { spec: *spec, nodes })
}

fn push(
    nodes: &mut BTreeMap<usize, Vec<DeviceAssignment>>,
    node_id: usize,
    role: String,
    device_indices: Vec<usize>,
    role_node_index: usize,
    role_device_offset: usize,
) {
    nodes.entry(node_id).or_default().push(DeviceAssignment {
        role,
        node_id,
        device_indices,
        role_node_index,
        role_device_offset,
    });
}
