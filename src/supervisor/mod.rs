//! Workload supervision.
//!
//! Once a node has joined the cluster runtime, the supervisor:
//! 1. Marks the [`JobRun`] Running
//! 2. Spawns one process per local role with its devices in the environment
//! 3. Fails fast on the first non-zero exit anywhere in the job
//! 4. Waits for every node to report before declaring success
//!
//! # Components
//!
//! - [`JobSupervisor`]: owns the [`JobRun`] and drives the state machine
//! - [`WorkloadExecutor`]: spawns role processes and tears them down
//! - [`JobRun`]: the job record (Pending -> Running -> Succeeded | Failed)

pub mod executor;
pub mod job;
pub mod job_supervisor;

pub use executor::{RoleExit, RoleOutcome, WorkloadCommand, WorkloadExecutor};
pub use job::{JobRun, JobStatus};
pub use job_supervisor::{JobResult, JobSupervisor, GENERIC_FAILURE_CODE};
