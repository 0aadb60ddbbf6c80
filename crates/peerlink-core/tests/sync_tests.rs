//! Integration tests for folder synchronization against a live server.

mod common;

use common::{create_test_file, init_tracing, local_catalog, random_bytes, TestPeer};
use peerlink_core::config::SyncConfig;
use peerlink_core::sync::{SyncCoordinator, SyncDirection};
use peerlink_core::Error;

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

#[tokio::test]
async fn test_sync_transfers_only_missing_names() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("remote1.txt", b"r1");
    peer.add_file("docs/remote2.bin", &random_bytes(50_000));
    peer.add_file("shared.txt", b"remote version");

    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "local1.txt", b"l1");
    create_test_file(local_dir.path(), "shared.txt", b"local version");

    let coordinator = SyncCoordinator::new(local, peer.client.clone(), SyncConfig::default());
    let report = coordinator.sync().await.unwrap();

    assert_eq!(report.downloaded, vec!["remote1.txt", "remote2.bin"]);
    assert_eq!(report.uploaded, vec!["local1.txt"]);
    assert!(report.is_complete());
    assert_eq!(
        sorted(report.remote_files.unwrap()),
        vec!["local1.txt", "remote1.txt", "remote2.bin", "shared.txt"]
    );

    // Same name means identical; neither side was overwritten
    assert_eq!(
        std::fs::read(local_dir.path().join("shared.txt")).unwrap(),
        b"local version"
    );
    assert_eq!(
        std::fs::read(peer.dir.path().join("shared.txt")).unwrap(),
        b"remote version"
    );
    common::assert_files_equal(
        &peer.dir.path().join("docs/remote2.bin"),
        &local_dir.path().join("remote2.bin"),
    );
}

#[tokio::test]
async fn test_second_sync_transfers_nothing() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("a.txt", b"a");
    peer.add_file("b.txt", b"b");

    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "c.txt", b"c");

    let coordinator = SyncCoordinator::new(local, peer.client.clone(), SyncConfig::default());
    let first = coordinator.sync().await.unwrap();
    assert_eq!(first.transferred(), 3);

    let second = coordinator.sync().await.unwrap();
    assert_eq!(second.transferred(), 0);
    assert!(second.downloaded.is_empty());
    assert!(second.uploaded.is_empty());
    assert!(second.failures.is_empty());
}

#[tokio::test]
async fn test_modified_file_with_same_name_is_not_retransferred() {
    init_tracing();
    let peer = TestPeer::start().await;
    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "report.txt", b"v1");

    let coordinator = SyncCoordinator::new(local, peer.client.clone(), SyncConfig::default());
    coordinator.sync().await.unwrap();

    create_test_file(local_dir.path(), "report.txt", b"v2, edited locally");
    let report = coordinator.sync().await.unwrap();

    assert_eq!(report.transferred(), 0);
    assert_eq!(std::fs::read(peer.dir.path().join("report.txt")).unwrap(), b"v1");
}

#[cfg(unix)]
#[tokio::test]
async fn test_item_failure_does_not_abort_batch() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("good.txt", b"fine");
    // Legal on unix, but not a storable catalog name
    peer.add_file("bad\\name.txt", b"nope");

    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "up.txt", b"up");

    let coordinator = SyncCoordinator::new(local, peer.client.clone(), SyncConfig::default());
    let report = coordinator.sync().await.unwrap();

    assert_eq!(report.downloaded, vec!["good.txt"]);
    assert_eq!(report.uploaded, vec!["up.txt"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].file, "bad\\name.txt");
    assert_eq!(report.failures[0].direction, SyncDirection::Download);
    assert!(!local_dir.path().join("bad\\name.txt").exists());
    assert!(report.remote_files.is_some());
}

#[tokio::test]
async fn test_parallel_sync_matches_sequential_result() {
    init_tracing();
    let peer = TestPeer::start().await;
    for i in 0..8 {
        peer.add_file(&format!("remote-{i}.bin"), &random_bytes(10_000 + i));
    }

    let (local_dir, local) = local_catalog();
    for i in 0..5 {
        create_test_file(local_dir.path(), &format!("local-{i}.bin"), &random_bytes(5_000));
    }

    let config = SyncConfig {
        parallel_transfers: 4,
        ..SyncConfig::default()
    };
    let coordinator = SyncCoordinator::new(local.clone(), peer.client.clone(), config);
    let report = coordinator.sync().await.unwrap();

    assert_eq!(report.downloaded.len(), 8);
    assert_eq!(report.uploaded.len(), 5);
    assert!(report.is_complete());
    assert_eq!(local.list_names().await.unwrap().len(), 13);
    assert_eq!(peer.catalog.list_names().await.unwrap().len(), 13);
}

#[tokio::test]
async fn test_plan_without_transfers() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("r.txt", b"r");

    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "l.txt", b"l");

    let coordinator = SyncCoordinator::new(local, peer.client.clone(), SyncConfig::default());
    let plan = coordinator.plan().await.unwrap();

    assert_eq!(plan.downloads, vec!["r.txt"]);
    assert_eq!(plan.uploads, vec!["l.txt"]);
    assert!(!local_dir.path().join("r.txt").exists());
}

#[tokio::test]
async fn test_unreachable_peer_aborts_sync() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.server.stop().await;

    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "l.txt", b"l");

    let coordinator = SyncCoordinator::new(local, peer.client.clone(), SyncConfig::default());
    let result = coordinator.sync().await;

    assert!(matches!(result, Err(Error::ConnectFailed { .. })));
}
