mod common;

use anyhow::Result;
use pretty_assertions::assert_eq;

use clipmesh::tasks::{TaskStatus, TaskType};
use common::{connected_pair, task_finished};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_pull_file_across_nodes() -> Result<()> {
    let (a, b) = connected_pair().await?;
    // Four chunks, the last one short
    let content = pattern(200_000);
    std::fs::write(b.node.config().sync.shared_dir.join("data.bin"), &content)?;

    let mut tasks = a.node.executor().subscribe();
    let task_id = a.node.pull_file("node-b", "data.bin").await?;
    let (status, error) = task_finished(&mut tasks, &task_id).await?;
    assert_eq!(status, TaskStatus::Success, "pull failed: {:?}", error);

    let pulled = std::fs::read(a.node.config().tasks.download_dir.join("data.bin"))?;
    assert_eq!(pulled.len(), content.len());
    assert!(pulled == content);

    let task = a.node.executor().task(&task_id).await?;
    assert_eq!(task.task_type, TaskType::PullFile);
    assert_eq!(task.history.len(), 1);
    assert_eq!(task.extra["plan"]["total_size"], 200_000);

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_icon_across_nodes() -> Result<()> {
    let (a, b) = connected_pair().await?;
    std::fs::write(b.node.config().sync.icon_dir.join("app.png"), b"PNG icon")?;

    let mut tasks = a.node.executor().subscribe();
    let task_id = a.node.pull_icon("node-b", "app.png").await?;
    let (status, _) = task_finished(&mut tasks, &task_id).await?;
    assert_eq!(status, TaskStatus::Success);
    assert_eq!(
        std::fs::read(a.node.config().sync.icon_dir.join("app.png"))?,
        b"PNG icon".to_vec()
    );

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_file_fails_without_retry() -> Result<()> {
    let (a, b) = connected_pair().await?;

    let mut tasks = a.node.executor().subscribe();
    let task_id = a.node.pull_file("node-b", "absent.bin").await?;
    let (status, error) = task_finished(&mut tasks, &task_id).await?;
    assert_eq!(status, TaskStatus::Failure);
    assert!(error.is_some());
    assert_eq!(a.node.executor().task(&task_id).await?.history.len(), 1);

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_from_untracked_peer_exhausts_retries() -> Result<()> {
    let (a, b) = connected_pair().await?;

    let mut tasks = a.node.executor().subscribe();
    let task_id = a.node.pull_icon("node-z", "app.png").await?;
    let (status, _) = task_finished(&mut tasks, &task_id).await?;
    assert_eq!(status, TaskStatus::Failure);
    assert_eq!(
        a.node.executor().task(&task_id).await?.history.len(),
        a.node.config().tasks.max_attempts
    );

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}
