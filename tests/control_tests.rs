use rl_launcher::cluster::{
    AbortNotice, ControlChannel, ControlSnapshot, FileControlChannel, MemoryControlChannel,
};

async fn first_abort_wins(channel: &dyn ControlChannel) {
    let first = AbortNotice::new(1, "inference exited with code 3").for_role("inference", Some(3));
    let second = AbortNotice::new(0, "cancelled by operator");

    let recorded = channel.abort("job", first.clone()).await.unwrap();
    assert_eq!(recorded, first);

    let recorded = channel.abort("job", second).await.unwrap();
    assert_eq!(recorded, first, "the first abort stays on record");

    let snapshot = channel.snapshot("job").await.unwrap();
    assert_eq!(snapshot.abort, Some(first));
}

async fn completion_reports(channel: &dyn ControlChannel) {
    assert!(!channel.snapshot("job").await.unwrap().all_succeeded(2));

    channel.report_finished("job", 0, true).await.unwrap();
    let snapshot = channel.snapshot("job").await.unwrap();
    assert!(!snapshot.all_succeeded(2));
    assert_eq!(snapshot.finished.get(&0), Some(&true));

    channel.report_finished("job", 1, true).await.unwrap();
    assert!(channel.snapshot("job").await.unwrap().all_succeeded(2));

    // Jobs are isolated from each other
    assert!(channel.snapshot("other").await.unwrap().finished.is_empty());
}

async fn join_reports(channel: &dyn ControlChannel) {
    channel.report_joined("job", 1).await.unwrap();
    let snapshot = channel.snapshot("job").await.unwrap();
    assert!(!snapshot.all_joined(2));

    // Repeated reports count once
    channel.report_joined("job", 1).await.unwrap();
    channel.report_joined("job", 0).await.unwrap();
    let snapshot = channel.snapshot("job").await.unwrap();
    assert_eq!(snapshot.joined.len(), 2);
    assert!(snapshot.all_joined(2));
    assert!(snapshot.finished.is_empty());
}

async fn reset_forgets_previous_run(channel: &dyn ControlChannel) {
    channel.report_joined("job", 0).await.unwrap();
    channel.report_finished("job", 0, false).await.unwrap();
    channel
        .abort("job", AbortNotice::new(0, "trainer exited with code 3"))
        .await
        .unwrap();
    channel.report_finished("other", 0, true).await.unwrap();

    channel.reset("job").await.unwrap();
    assert_eq!(channel.snapshot("job").await.unwrap(), ControlSnapshot::default());
    // Other jobs keep their records
    assert_eq!(channel.snapshot("other").await.unwrap().finished.len(), 1);

    // A fresh abort can be recorded again
    let notice = AbortNotice::new(1, "second run");
    assert_eq!(channel.abort("job", notice.clone()).await.unwrap(), notice);

    // Resetting a job with no records is fine
    channel.reset("never-started").await.unwrap();
}

#[tokio::test]
async fn test_memory_channel_join_reports() {
    join_reports(&MemoryControlChannel::new()).await;
}

#[tokio::test]
async fn test_file_channel_join_reports() {
    let dir = tempfile::tempdir().unwrap();
    join_reports(&FileControlChannel::new(dir.path())).await;
}

#[tokio::test]
async fn test_memory_channel_reset() {
    reset_forgets_previous_run(&MemoryControlChannel::new()).await;
}

#[tokio::test]
async fn test_file_channel_reset() {
    let dir = tempfile::tempdir().unwrap();
    reset_forgets_previous_run(&FileControlChannel::new(dir.path())).await;
}

#[tokio::test]
async fn test_memory_channel_first_abort_wins() {
    first_abort_wins(&MemoryControlChannel::new()).await;
}

#[tokio::test]
async fn test_memory_channel_completion() {
    completion_reports(&MemoryControlChannel::new()).await;
}

#[tokio::test]
async fn test_file_channel_first_abort_wins() {
    let dir = tempfile::tempdir().unwrap();
    first_abort_wins(&FileControlChannel::new(dir.path())).await;
}

#[tokio::test]
async fn test_file_channel_completion() {
    let dir = tempfile::tempdir().unwrap();
    completion_reports(&FileControlChannel::new(dir.path())).await;
}

#[tokio::test]
async fn test_file_channel_shared_between_instances() {
    let dir = tempfile::tempdir().unwrap();
    let node0 = FileControlChannel::new(dir.path());
    let node1 = FileControlChannel::new(dir.path());

    node1
        .abort("job", AbortNotice::new(1, "boom"))
        .await
        .unwrap();
    node1.report_finished("job", 1, false).await.unwrap();

    let snapshot = node0.snapshot("job").await.unwrap();
    assert_eq!(snapshot.abort.as_ref().map(|n| n.origin_node), Some(1));
    assert_eq!(snapshot.finished.get(&1), Some(&false));
    assert!(!snapshot.all_succeeded(2));
}

#[tokio::test]
async fn test_file_channel_concurrent_aborts_agree() {
    let dir = tempfile::tempdir().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|node| {
            let channel = FileControlChannel::new(dir.path());
            tokio::spawn(async move {
                channel
                    .abort("job", AbortNotice::new(node, format!("node {} failed", node)))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut origins = Vec::new();
    for handle in handles {
        origins.push(handle.await.unwrap().origin_node);
    }
    origins.dedup();
    assert_eq!(origins.len(), 1, "every node must see the same abort");
}

#[tokio::test]
async fn test_file_channel_empty_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let channel = FileControlChannel::new(dir.path());
    let snapshot = channel.snapshot("never-started").await.unwrap();
    assert!(snapshot.abort.is_none());
    assert!(snapshot.finished.is_empty());
}
