//! Device allocation for multi-role jobs.
//!
//! Validation and placement happen here, before anything is started:
//! - **Partitioning**: [`partition`] carves the global device budget into one
//!   contiguous range per role, in request order
//! - **Resolution**: [`resolve`] maps those ranges onto nodes and node-local
//!   device indices
//!
//! Both steps are pure and deterministic, so every node can compute the same
//! layout independently from the same request.

pub mod partitioner;
pub mod request;
pub mod resolver;

pub use partitioner::{partition, Partition, RoleSlice};
pub use request::{parse_roles, ClusterSpec, RoleRequest, MAX_NODE_COUNT};
pub use resolver::{resolve, DeviceAssignment, NodeLayout, NodeRank};
