//! Batch sync tests against an unreachable backend: the failure path
//! must leave items queued with their retry count bumped, and an
//! unregistered device must never attempt a sync at all.

use crowdedged::agent::EdgeAgent;
use crowdedged::radio::RadioReconciler;
use crowdedge_common::{DeviceIdentity, OfflineQueue, QueueKind};
use serde_json::json;
use tempfile::TempDir;

fn agent_with_queue(credential: Option<&str>) -> (EdgeAgent, TempDir) {
    let dir = TempDir::new().unwrap();

    let mut identity = DeviceIdentity::new();
    identity.backend_url = "http://127.0.0.1:1".to_string();
    identity.credential = credential.map(|c| c.to_string());

    let queue = OfflineQueue::open_at(dir.path().join("queue.db")).unwrap();
    let radio = RadioReconciler::with_paths(dir.path().join("hostapd.conf"), vec!["true".to_string()]);
    let agent = EdgeAgent::with_radio(identity, dir.path().join("device.json"), queue, radio).unwrap();

    (agent, dir)
}

#[tokio::test]
async fn test_unregistered_device_never_syncs() {
    let (agent, _dir) = agent_with_queue(None);

    agent.queue().enqueue_analytics(&json!({"n": 1})).unwrap();
    agent.queue().enqueue_submission(&json!({"name": "visitor"})).unwrap();

    let report = agent.sync_queue().await.unwrap();
    assert_eq!(report.total_attempted(), 0);

    // Nothing was touched: no retries recorded, everything still queued.
    let batch = agent.queue().dequeue_batch(10).unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|item| item.retry_count == 0));
}

#[tokio::test]
async fn test_unreachable_backend_marks_partitions_failed() {
    let (agent, _dir) = agent_with_queue(Some("T1"));

    agent.queue().enqueue_analytics(&json!({"n": 1})).unwrap();
    agent.queue().enqueue_analytics(&json!({"n": 2})).unwrap();
    agent.queue().enqueue_submission(&json!({"name": "visitor"})).unwrap();

    let report = agent.sync_queue().await.unwrap();
    assert_eq!(report.failed_submissions, 1);
    assert_eq!(report.failed_analytics, 2);
    assert_eq!(report.total_synced(), 0);

    // Failed items stay queued for the next cycle, retry count bumped.
    let batch = agent.queue().dequeue_batch(10).unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch.iter().all(|item| item.retry_count == 1));
    assert!(batch.iter().all(|item| item.last_retry_at.is_some()));
    assert_eq!(batch[0].kind, QueueKind::Submission);
}

#[tokio::test]
async fn test_empty_queue_sync_is_a_noop() {
    let (agent, _dir) = agent_with_queue(Some("T1"));

    let report = agent.sync_queue().await.unwrap();
    assert_eq!(report.total_attempted(), 0);
}
