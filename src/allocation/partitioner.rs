use std::collections::HashSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::allocation::request::{ClusterSpec, RoleRequest};
use crate::error::{LaunchError, Result};

/// A role's slice of the global device index space `[0, device_budget)`.
///
/// Global index `g` is device `g % devices_per_node` on node
/// `g / devices_per_node`; the node is resolved later by the
/// [`resolver`](crate::allocation::resolver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSlice {
    pub role: String,
    pub devices: Range<usize>,
}

impl RoleSlice {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// Validated partition of the device budget, in role request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    slices: Vec<RoleSlice>,
    budget: usize,
}

impl Partition {
    pub fn slices(&self) -> &[RoleSlice] {
        &self.slices
    }

    pub fn get(&self, role: &str) -> Option<&RoleSlice> {
        self.slices.iter().find(|s| s.role == role)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Number of devices handed out across all roles.
    pub fn allocated(&self) -> usize {
        self.slices.iter().map(RoleSlice::device_count).sum()
    }

    pub fn unallocated(&self) -> usize {
        self.budget - self.allocated()
    }
}

/// Splits the cluster's device budget into contiguous, non-overlapping ranges
/// in request order.
///
/// Nothing is returned unless every role fits: names must be unique and
/// non-empty and the total request must not exceed `spec.device_budget()`.
pub fn partition(spec: &ClusterSpec, roles: &[RoleRequest]) -> Result<Partition> {
    spec.validate()?;

    let mut seen = HashSet::with_capacity(roles.len());
    for role in roles {
        if role.name.trim().is_empty() {
            return Err(LaunchError::InvalidSpec("role name must not be empty".into()));
        }
        if !seen.insert(role.name.as_str()) {
            return Err(LaunchError::DuplicateRole(role.name.clone()));
        }
    }

    let budget = spec.device_budget();
    let requested = roles
        .iter()
        .try_fold(0usize, |acc, r| acc.checked_add(r.device_count))
        .unwrap_or(usize::MAX);
    if requested > budget {
        return Err(LaunchError::CapacityExceeded { requested, budget });
    }

    let mut cursor = 0;
    let slices = roles
        .iter()
        .map(|role| {
            let start = cursor;
            cursor += role.device_count;
            RoleSlice {
                role: role.name.clone(),
                devices: start..cursor,
            }
        })
        .collect();

    tracing::debug!(requested, budget, roles = roles.len(), "Devices partitioned");

    Ok(Partition { slices, budget })
}
