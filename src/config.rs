use std::path::PathBuf;
use std::time::Duration;

/// Commands used by [`ProcessRuntime`](crate::cluster::ProcessRuntime) to drive
/// an external cluster runtime.
///
/// Each command is an argv vector. The placeholders `{endpoint}`, `{host}` and
/// `{port}` are substituted before the command runs.
#[derive(Debug, Clone)]
pub struct RuntimeCommands {
    /// Started on the leader node, e.g. `ray start --head --port={port}`
    pub head: Vec<String>,
    /// Started on follower nodes, e.g. `ray start --address={endpoint}`
    pub join: Vec<String>,
    /// Run on every node after the job finishes, e.g. `ray stop`
    pub stop: Option<Vec<String>>,
    /// Address the leader advertises to followers
    pub advertise_host: String,
    pub port: u16,
    /// Upper bound on how long any one command may run
    pub timeout_ms: u64,
}

impl Default for RuntimeCommands {
    fn default() -> Self {
        Self {
            head: vec![
                "ray".to_string(),
                "start".to_string(),
                "--head".to_string(),
                "--port={port}".to_string(),
            ],
            join: vec![
                "ray".to_string(),
                "start".to_string(),
                "--address={endpoint}".to_string(),
            ],
            stop: Some(vec!["ray".to_string(), "stop".to_string()]),
            advertise_host: "127.0.0.1".to_string(),
            port: 6379,
            timeout_ms: 120_000,
        }
    }
}

impl RuntimeCommands {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Shortest polling interval accepted, so a zero setting cannot spin.
const MIN_POLL_INTERVAL_MS: u64 = 1;

/// Bootstrap timing.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// How long a follower waits for the leader endpoint before giving up
    pub wait_window_ms: u64,
    /// Interval between discovery lookups
    pub poll_interval_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            wait_window_ms: 300_000,
            poll_interval_ms: 500,
        }
    }
}

impl BootstrapConfig {
    pub fn wait_window(&self) -> Duration {
        Duration::from_millis(self.wait_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

/// Workload supervision settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL when tearing down workloads
    pub grace_period_ms: u64,
    /// Interval for checking the control channel for peer messages
    pub poll_interval_ms: u64,
    /// Environment variable that restricts device visibility for the workload
    pub device_env_var: String,
    /// Directory for per-node append-only logs. Output is inherited when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            poll_interval_ms: 200,
            device_env_var: "CUDA_VISIBLE_DEVICES".to_string(),
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub bootstrap: BootstrapConfig,
    pub supervisor: SupervisorConfig,
}

impl LaunchConfig {
    pub fn with_wait_window(mut self, wait_window_ms: u64) -> Self {
        self.bootstrap.wait_window_ms = wait_window_ms;
        self
    }

    pub fn with_grace_period(mut self, grace_period_ms: u64) -> Self {
        self.supervisor.grace_period_ms = grace_period_ms;
        self
    }

    /// Tight intervals for tests and single-host runs.
    pub fn fast() -> Self {
        Self {
            bootstrap: BootstrapConfig {
                wait_window_ms: 2_000,
                poll_interval_ms: 20,
            },
            supervisor: SupervisorConfig {
                grace_period_ms: 1_000,
                poll_interval_ms: 20,
                ..SupervisorConfig::default()
            },
        }
    }
}
