use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("Requested {requested} devices but the cluster only has {budget}")]
    CapacityExceeded { requested: usize, budget: usize },

    #[error("Duplicate role: {0}")]
    DuplicateRole(String),

    #[error("Role {role} cannot be laid out: {reason}")]
    UnsatisfiableLayout { role: String, reason: String },

    #[error("Could not join the cluster for job {job_id} within {waited_ms}ms")]
    BootstrapTimeout { job_id: String, waited_ms: u64 },

    #[error("Only {joined} of {expected} nodes joined job {job_id} within {waited_ms}ms")]
    JoinTimeout {
        job_id: String,
        joined: usize,
        expected: usize,
        waited_ms: u64,
    },

    #[error("Aborted by node {origin_node}: {reason}")]
    PeerAborted { origin_node: usize, reason: String },

    #[error("Cluster runtime error: {0}")]
    Runtime(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Role {role} on node {node_id} failed: {reason}")]
    WorkloadFailure {
        role: String,
        node_id: usize,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("Roles {roles:?} did not exit within the grace period and were killed")]
    ForcedTermination { roles: Vec<String> },

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl LaunchError {
    /// Validation errors are raised before any process starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LaunchError::InvalidSpec(_)
                | LaunchError::CapacityExceeded { .. }
                | LaunchError::DuplicateRole(_)
                | LaunchError::UnsatisfiableLayout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;
