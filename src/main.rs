use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use rl_launcher::allocation::{parse_roles, ClusterSpec, DeviceAssignment, RoleRequest};
use rl_launcher::cluster::{
    ClusterRuntime, ControlChannel, Endpoint, EndpointDiscovery, FileControlChannel,
    FileDiscovery, MemoryControlChannel, MemoryDiscovery, NoopRuntime, ProcessRuntime,
    StaticDiscovery,
};
use rl_launcher::config::{LaunchConfig, RuntimeCommands, SupervisorConfig};
use rl_launcher::shutdown::install_shutdown_handler;
use rl_launcher::supervisor::{JobRun, WorkloadCommand};
use rl_launcher::{LaunchError, LaunchRequest, NodeLauncher};

/// Exit code for requests rejected before anything started.
const VALIDATION_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "rl-launcher")]
#[command(version)]
#[command(about = "Launch a multi-role training job across nodes with partitioned devices")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate a job and print its device layout without starting anything
    Plan {
        #[command(flatten)]
        job: JobArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Run this node's share of a job
    Launch(LaunchArgs),
}

// =============================================================================
// Job Arguments (shared by plan and launch)
// =============================================================================

#[derive(Parser, Debug)]
struct JobArgs {
    /// Number of nodes in the allocation
    #[arg(long, env = "SLURM_JOB_NUM_NODES", default_value = "1")]
    nodes: usize,

    /// Supervising tasks per node
    #[arg(long, env = "SLURM_NTASKS_PER_NODE", default_value = "1")]
    tasks_per_node: usize,

    /// Devices available on each node
    #[arg(long, default_value = "8")]
    devices_per_node: usize,

    /// Ordered role list (format: "name:devices,...")
    /// Example: "trainer:8,ref:4,inference:4"
    #[arg(long)]
    roles: String,

    /// Job id shared by every node; generated when omitted
    #[arg(long, env = "SLURM_JOB_ID")]
    job_id: Option<String>,
}

impl JobArgs {
    fn spec(&self) -> ClusterSpec {
        ClusterSpec::new(self.nodes, self.tasks_per_node, self.devices_per_node)
    }

    fn roles(&self) -> Result<Vec<RoleRequest>, LaunchError> {
        parse_roles(&self.roles)
    }
}

// =============================================================================
// Launch Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct LaunchArgs {
    #[command(flatten)]
    job: JobArgs,

    /// This node's rank; node 0 is the leader
    #[arg(long, env = "SLURM_NODEID", default_value = "0")]
    node_id: usize,

    /// Shared directory where the leader publishes its endpoint
    #[arg(long)]
    discovery_dir: Option<PathBuf>,

    /// Leader endpoint (host:port) known in advance; skips discovery
    #[arg(long)]
    leader_endpoint: Option<String>,

    /// Shared directory for abort/completion messages (defaults to --discovery-dir)
    #[arg(long)]
    control_dir: Option<PathBuf>,

    /// How the cluster runtime is managed
    #[arg(long, default_value = "none")]
    runtime: RuntimeKind,

    /// Head command for --runtime=process; supports {endpoint}, {host}, {port}
    #[arg(long, default_value = "ray start --head --port={port}")]
    head_cmd: String,

    /// Join command for --runtime=process
    #[arg(long, default_value = "ray start --address={endpoint}")]
    join_cmd: String,

    /// Stop command for --runtime=process; empty to skip
    #[arg(long, default_value = "ray stop")]
    stop_cmd: String,

    /// Address the leader advertises to followers
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Port of the cluster runtime on the leader
    #[arg(long, default_value = "6379")]
    port: u16,

    /// Longest any one runtime command may run
    #[arg(long, default_value = "120000")]
    runtime_timeout_ms: u64,

    /// How long followers wait for the leader endpoint
    #[arg(long, default_value = "300000")]
    wait_window_ms: u64,

    /// Time between SIGTERM and SIGKILL when aborting roles
    #[arg(long, default_value = "10000")]
    grace_period_ms: u64,

    /// Variable used to restrict device visibility for each role
    #[arg(long, default_value = "CUDA_VISIBLE_DEVICES")]
    device_env_var: String,

    /// Directory for per-node append-only workload logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Output format for the final result
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Workload command run once per role
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum RuntimeKind {
    /// Runtime is already running (or not needed)
    None,
    /// Start/join/stop the runtime with the configured commands
    Process,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PlanOutput<'a> {
    job_id: &'a str,
    spec: &'a ClusterSpec,
    nodes: Vec<NodePlanOutput<'a>>,
}

#[derive(Serialize)]
struct NodePlanOutput<'a> {
    node_id: usize,
    leader: bool,
    assignments: &'a [DeviceAssignment],
}

// =============================================================================
// Helper Functions
// =============================================================================

fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn reject(error: &LaunchError) -> ! {
    eprintln!("Error: {}", error);
    std::process::exit(VALIDATION_EXIT_CODE);
}

fn build_runtime(args: &LaunchArgs) -> Arc<dyn ClusterRuntime> {
    match args.runtime {
        RuntimeKind::None => Arc::new(NoopRuntime::new(Endpoint::from_host_port(
            &args.advertise_host,
            args.port,
        ))),
        RuntimeKind::Process => {
            let stop = split_command(&args.stop_cmd);
            Arc::new(ProcessRuntime::new(RuntimeCommands {
                head: split_command(&args.head_cmd),
                join: split_command(&args.join_cmd),
                stop: if stop.is_empty() { None } else { Some(stop) },
                advertise_host: args.advertise_host.clone(),
                port: args.port,
                timeout_ms: args.runtime_timeout_ms,
            }))
        }
    }
}

fn build_discovery(args: &LaunchArgs) -> Result<Arc<dyn EndpointDiscovery>, LaunchError> {
    if let Some(endpoint) = &args.leader_endpoint {
        return Ok(Arc::new(StaticDiscovery::new(Endpoint::new(endpoint.clone()))));
    }
    if let Some(dir) = &args.discovery_dir {
        return Ok(Arc::new(FileDiscovery::new(dir.clone())));
    }
    if args.job.nodes == 1 {
        return Ok(Arc::new(MemoryDiscovery::new()));
    }
    Err(LaunchError::InvalidSpec(
        "multi-node launch needs --discovery-dir or --leader-endpoint".into(),
    ))
}

fn build_control(args: &LaunchArgs) -> Result<Arc<dyn ControlChannel>, LaunchError> {
    match args.control_dir.as_ref().or(args.discovery_dir.as_ref()) {
        Some(dir) => Ok(Arc::new(FileControlChannel::new(dir.clone()))),
        None if args.job.nodes == 1 => Ok(Arc::new(MemoryControlChannel::new())),
        None => Err(LaunchError::InvalidSpec(
            "multi-node launch needs --control-dir or --discovery-dir".into(),
        )),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

fn handle_plan(job: JobArgs, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let roles = job.roles().unwrap_or_else(|e| reject(&e));
    let run = JobRun::submit(job.job_id.clone(), job.spec(), roles).unwrap_or_else(|e| reject(&e));

    match output {
        OutputFormat::Json => {
            let plan = PlanOutput {
                job_id: &run.id,
                spec: &run.spec,
                nodes: run
                    .assignments
                    .iter()
                    .map(|(node_id, assignments)| NodePlanOutput {
                        node_id: *node_id,
                        leader: *node_id == 0,
                        assignments,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        OutputFormat::Table => {
            println!("Job ID: {}", run.id);
            println!(
                "Nodes:  {} x {} devices ({} tasks per node)",
                run.spec.node_count, run.spec.devices_per_node, run.spec.tasks_per_node
            );
            println!();
            println!("{:<6} {:<16} {:<20} OFFSET", "NODE", "ROLE", "DEVICES");
            println!("{}", "-".repeat(52));
            for (node_id, assignments) in &run.assignments {
                if assignments.is_empty() {
                    println!("{:<6} {:<16} {:<20} -", node_id, "-", "(idle)");
                }
                for a in assignments {
                    let devices = if a.device_indices.is_empty() {
                        "(none)".to_string()
                    } else {
                        a.device_list()
                    };
                    println!(
                        "{:<6} {:<16} {:<20} {}",
                        node_id, a.role, devices, a.role_device_offset
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_launch(args: LaunchArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let roles = args.job.roles().unwrap_or_else(|e| reject(&e));
    let command = WorkloadCommand::from_argv(&args.command).unwrap_or_else(|e| reject(&e));
    let discovery = build_discovery(&args).unwrap_or_else(|e| reject(&e));
    let control = build_control(&args).unwrap_or_else(|e| reject(&e));
    let runtime = build_runtime(&args);

    let mut config = LaunchConfig::default()
        .with_wait_window(args.wait_window_ms)
        .with_grace_period(args.grace_period_ms);
    config.supervisor = SupervisorConfig {
        device_env_var: args.device_env_var.clone(),
        log_dir: args.log_dir.clone(),
        ..config.supervisor
    };

    tracing::info!(
        node_id = args.node_id,
        nodes = args.job.nodes,
        devices_per_node = args.job.devices_per_node,
        roles = %args.job.roles,
        runtime = ?args.runtime,
        "Starting rl-launcher node"
    );

    let launcher = NodeLauncher::new(config, runtime, discovery, control, install_shutdown_handler());
    let request = LaunchRequest {
        job_id: args.job.job_id.clone(),
        spec: args.job.spec(),
        roles,
        node_id: args.node_id,
        leader_endpoint: args.leader_endpoint.as_deref().map(Endpoint::new),
        command,
    };

    let result = launcher
        .launch(request)
        .await
        .unwrap_or_else(|e| reject(&e));

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Table => {
            println!("Job ID:  {}", result.job_id);
            println!("Node:    {}", result.node_id);
            println!("Status:  {}", result.status);
            if let Some(reason) = &result.failure_reason {
                println!("Reason:  {}", reason);
            }
            if !result.roles.is_empty() {
                println!();
                println!("{:<16} {:<12} STATUS", "ROLE", "OUTCOME");
                println!("{}", "-".repeat(44));
                for role in &result.roles {
                    println!(
                        "{:<16} {:<12} {}",
                        role.role,
                        format!("{:?}", role.outcome),
                        role.describe()
                    );
                }
            }
        }
    }

    Ok(result.exit_code())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Plan { job, output } => {
            handle_plan(job, &output)?;
        }
        Commands::Launch(launch_args) => {
            let code = handle_launch(launch_args).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}
