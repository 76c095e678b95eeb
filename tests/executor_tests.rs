use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use rl_launcher::allocation::{ClusterSpec, DeviceAssignment, NodeRank};
use rl_launcher::cluster::{ClusterHandle, Endpoint};
use rl_launcher::config::SupervisorConfig;
use rl_launcher::supervisor::executor::{watch, workload_env};
use rl_launcher::supervisor::{RoleOutcome, WorkloadCommand, WorkloadExecutor};
use rl_launcher::LaunchError;

fn spec() -> ClusterSpec {
    ClusterSpec::new(2, 1, 8)
}

fn assignment(role: &str, devices: std::ops::Range<usize>) -> DeviceAssignment {
    DeviceAssignment {
        role: role.to_string(),
        node_id: 1,
        device_indices: devices.collect(),
        role_node_index: 0,
        role_device_offset: 0,
    }
}

fn handle(assignments: Vec<DeviceAssignment>) -> ClusterHandle {
    ClusterHandle {
        job_id: "exec-job".to_string(),
        node: NodeRank::new(1, &spec()).unwrap(),
        endpoint: Endpoint::new("10.0.0.1:6379"),
        assignments: Arc::from(assignments),
        joined_at: Utc::now(),
    }
}

#[test]
fn test_workload_env_contents() {
    let a = assignment("inference", 4..8);
    let h = handle(vec![a.clone()]);

    let env: std::collections::HashMap<_, _> =
        workload_env(&h, &spec(), &a, "CUDA_VISIBLE_DEVICES").into_iter().collect();

    assert_eq!(env["RL_LAUNCH_ROLE"], "inference");
    assert_eq!(env["RL_LAUNCH_DEVICES"], "4,5,6,7");
    assert_eq!(env["CUDA_VISIBLE_DEVICES"], "4,5,6,7");
    assert_eq!(env["RL_LAUNCH_NODE_RANK"], "1");
    assert_eq!(env["RL_LAUNCH_NUM_NODES"], "2");
    assert_eq!(env["RL_LAUNCH_WORLD_SIZE"], "2");
    assert_eq!(env["RL_LAUNCH_JOB_ID"], "exec-job");
    assert_eq!(env["RL_LAUNCH_CLUSTER_ENDPOINT"], "10.0.0.1:6379");
}

#[test]
fn test_workload_command_from_argv() {
    let argv = vec!["python".to_string(), "train.py".to_string(), "--grpo".to_string()];
    let command = WorkloadCommand::from_argv(&argv).unwrap();
    assert_eq!(command.program, "python");
    assert_eq!(command.args, vec!["train.py", "--grpo"]);

    assert!(matches!(
        WorkloadCommand::from_argv(&[]),
        Err(LaunchError::InvalidSpec(_))
    ));
}

#[tokio::test]
async fn test_role_sees_its_devices_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.txt");
    let a = assignment("ref", 0..4);
    let h = handle(vec![a.clone()]);

    let executor = WorkloadExecutor::new(SupervisorConfig {
        device_env_var: "HIP_VISIBLE_DEVICES".to_string(),
        ..SupervisorConfig::default()
    });
    let command = WorkloadCommand::shell(format!(
        "echo \"$RL_LAUNCH_ROLE $HIP_VISIBLE_DEVICES\" > {}",
        out.display()
    ));

    let running = executor.spawn(&h, &spec(), &a, &command).unwrap();
    let exit = watch(running, CancellationToken::new(), Duration::from_secs(1)).await;

    assert_eq!(exit.outcome, RoleOutcome::Succeeded);
    assert_eq!(exit.exit_code, Some(0));
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "ref 0,1,2,3");
}

#[tokio::test]
async fn test_nonzero_exit_is_failure() {
    let a = assignment("inference", 4..8);
    let h = handle(vec![a.clone()]);
    let executor = WorkloadExecutor::new(SupervisorConfig::default());

    let running = executor
        .spawn(&h, &spec(), &a, &WorkloadCommand::shell("exit 7"))
        .unwrap();
    let exit = watch(running, CancellationToken::new(), Duration::from_secs(1)).await;

    assert_eq!(exit.outcome, RoleOutcome::Failed);
    assert_eq!(exit.exit_code, Some(7));
    assert_eq!(exit.describe(), "exited with code 7");
    assert!(!exit.succeeded());
}

#[tokio::test]
async fn test_spawn_failure_is_workload_failure() {
    let a = assignment("trainer", 0..8);
    let h = handle(vec![a.clone()]);
    let executor = WorkloadExecutor::new(SupervisorConfig::default());

    let err = executor
        .spawn(
            &h,
            &spec(),
            &a,
            &WorkloadCommand::new("/nonexistent/binary-12345", Vec::new()),
        )
        .unwrap_err();

    match err {
        LaunchError::WorkloadFailure { role, exit_code, .. } => {
            assert_eq!(role, "trainer");
            assert_eq!(exit_code, None);
        }
        other => panic!("expected WorkloadFailure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_abort_terminates_gracefully() {
    let a = assignment("trainer", 0..8);
    let h = handle(vec![a.clone()]);
    let executor = WorkloadExecutor::new(SupervisorConfig::default());
    let abort = CancellationToken::new();

    let running = executor
        .spawn(&h, &spec(), &a, &WorkloadCommand::new("sleep", vec!["30".to_string()]))
        .unwrap();
    let task = tokio::spawn(watch(running, abort.clone(), Duration::from_secs(5)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    abort.cancel();
    let exit = task.await.unwrap();

    assert_eq!(exit.outcome, RoleOutcome::Terminated);
    assert_eq!(exit.signal, Some(15));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_abort_kills_after_grace_period() {
    let a = assignment("trainer", 0..8);
    let h = handle(vec![a.clone()]);
    let executor = WorkloadExecutor::new(SupervisorConfig::default());
    let abort = CancellationToken::new();

    // Ignores SIGTERM
    let running = executor
        .spawn(
            &h,
            &spec(),
            &a,
            &WorkloadCommand::shell("trap '' TERM; while true; do sleep 0.05; done"),
        )
        .unwrap();
    let task = tokio::spawn(watch(running, abort.clone(), Duration::from_millis(200)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    abort.cancel();
    let exit = task.await.unwrap();

    assert_eq!(exit.outcome, RoleOutcome::Killed);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_output_appended_to_node_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig::default().with_log_dir(dir.path().to_path_buf());
    let executor = WorkloadExecutor::new(config);

    let a = assignment("ref", 0..4);
    let b = assignment("inference", 4..8);
    let h = handle(vec![a.clone(), b.clone()]);

    for (assignment, line) in [(&a, "from ref"), (&b, "from inference")] {
        let running = executor
            .spawn(&h, &spec(), assignment, &WorkloadCommand::shell(format!("echo '{}'", line)))
            .unwrap();
        watch(running, CancellationToken::new(), Duration::from_secs(1)).await;
    }

    let log = std::fs::read_to_string(dir.path().join("node-1.log")).unwrap();
    assert!(log.contains("from ref"));
    assert!(log.contains("from inference"));
}
