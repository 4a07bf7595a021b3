//! Integration tests for worker daemons.
//!
//! Each test spawns a real `crucibled` process in its own temporary daemon
//! directory, drives it through a [`WorkerClient`], and verifies the
//! controller-visible behavior: outcomes, failure classification, and what
//! happens when the worker dies mid-request.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;

use crucible::CrucibleError;
use crucible::daemon::WorkerClient;
use crucible::daemon::starter::{DaemonStartSpec, start};
use crucible::isolation::IsolationMode;
use crucible::work::WorkSpec;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn spec_for(mode: IsolationMode, dir: &TempDir) -> DaemonStartSpec {
    DaemonStartSpec::new(mode)
        .with_daemon_dir(dir.path().to_path_buf())
        .with_worker_binary(env!("CARGO_BIN_EXE_crucibled").into())
}

async fn start_flat(dir: &TempDir, kinds: &[&str]) -> WorkerClient {
    let spec = spec_for(IsolationMode::Flat, dir)
        .with_work_manifest(kinds.iter().map(|k| k.to_string()).collect());
    start(spec).await.expect("worker should start")
}

async fn start_hierarchical(dir: &TempDir) -> WorkerClient {
    start(spec_for(IsolationMode::Hierarchical, dir))
        .await
        .expect("worker should start")
}

#[tokio::test]
async fn test_flat_execute_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let mut client = start_flat(&dir, &["arith.double"]).await;

    let result = timeout(
        TEST_TIMEOUT,
        client.execute(WorkSpec::new("arith.double", json!(5))),
    )
    .await
    .expect("execute should not hang")
    .unwrap();
    assert_eq!(result, json!(10));

    // A second request on the same daemon
    let result = client
        .execute(WorkSpec::new("arith.double", json!(-4)))
        .await
        .unwrap();
    assert_eq!(result, json!(-8));

    timeout(TEST_TIMEOUT, client.shutdown())
        .await
        .expect("shutdown should not hang")
        .unwrap();
}

#[tokio::test]
async fn test_domain_error_is_work_failed_and_daemon_survives() {
    let dir = TempDir::new().unwrap();
    let mut client = start_flat(&dir, &["arith.double", "arith.fail"]).await;

    let err = client
        .execute(WorkSpec::new("arith.fail", json!("deliberate failure")))
        .await
        .unwrap_err();
    let CrucibleError::WorkFailed(failure) = err else {
        panic!("expected WorkFailed, got {err}");
    };
    assert!(failure.message.contains("deliberate failure"));

    // The daemon is still healthy after a domain failure
    let result = client
        .execute(WorkSpec::new("arith.double", json!(3)))
        .await
        .unwrap();
    assert_eq!(result, json!(6));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flat_undeclared_kind_is_infrastructure_failed() {
    let dir = TempDir::new().unwrap();
    let mut client = start_flat(&dir, &["arith.double"]).await;

    let err = client
        .execute(WorkSpec::new("arith.fail", json!("x")))
        .await
        .unwrap_err();
    let CrucibleError::InfrastructureFailed(failure) = err else {
        panic!("expected InfrastructureFailed, got {err}");
    };
    assert!(failure.message.contains("not found in work namespace"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hierarchical_requires_manifest() {
    let dir = TempDir::new().unwrap();
    let mut client = start_hierarchical(&dir).await;

    // Without a declaration the kind is unreachable
    let err = client
        .execute(WorkSpec::new("arith.double", json!(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, CrucibleError::InfrastructureFailed(_)));

    // With a declaration it runs
    let result = client
        .execute(
            WorkSpec::new("arith.double", json!(21))
                .with_manifest(vec!["arith.double".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_daemon_death_mid_request_is_daemon_lost() {
    let dir = TempDir::new().unwrap();
    let mut client = start_flat(&dir, &["proc.halt", "arith.double"]).await;

    let err = timeout(
        TEST_TIMEOUT,
        client.execute(WorkSpec::new("proc.halt", json!(1))),
    )
    .await
    .expect("a dead daemon must fail the request, not hang it")
    .unwrap_err();
    assert!(matches!(err, CrucibleError::DaemonLost(_)));

    // The client is permanently lost; further calls fail fast
    let err = client
        .execute(WorkSpec::new("arith.double", json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, CrucibleError::DaemonLost(_)));

    // Shutdown still reaps the process without error
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_execute_once_stops_worker_after_response() {
    let dir = TempDir::new().unwrap();
    let client = start_flat(&dir, &["arith.double"]).await;
    let worker_id = client.worker_id().to_string();

    let result = timeout(
        TEST_TIMEOUT,
        client.execute_once(WorkSpec::new("arith.double", json!(8))),
    )
    .await
    .expect("execute_once should not hang")
    .unwrap();
    assert_eq!(result, json!(16));

    // The worker removes its socket on the way out
    let socket = dir.path().join(format!("{worker_id}.sock"));
    for _ in 0..50 {
        if !socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!socket.exists(), "worker should clean up its socket");
}

#[tokio::test]
async fn test_worker_writes_log_file() {
    let dir = TempDir::new().unwrap();
    let mut client = start_flat(&dir, &["arith.double"]).await;
    let worker_id = client.worker_id().to_string();

    client
        .execute(WorkSpec::new("arith.double", json!(7)))
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let log_path = dir.path().join("logs").join(format!("{worker_id}.log"));
    assert!(log_path.exists(), "expected log file at {log_path:?}");
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("crucibled starting"));
    assert!(contents.contains("doubling 7"));
}
