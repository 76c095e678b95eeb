//! Cross-node coordination.
//!
//! - [`ClusterRuntime`]: the external runtime the job is handed to
//! - [`EndpointDiscovery`]: where the leader publishes its endpoint
//! - [`Bootstrapper`]: leader start / follower join with a bounded wait
//! - [`ControlChannel`]: abort and completion messages between supervisors

pub mod bootstrap;
pub mod control;
pub mod discovery;
pub mod runtime;

pub use bootstrap::{Bootstrapper, ClusterHandle};
pub use control::{
    AbortNotice, ControlChannel, ControlSnapshot, FileControlChannel, MemoryControlChannel,
};
pub use discovery::{Endpoint, EndpointDiscovery, FileDiscovery, MemoryDiscovery, StaticDiscovery};
pub use runtime::{ClusterRuntime, NoopRuntime, ProcessRuntime};
