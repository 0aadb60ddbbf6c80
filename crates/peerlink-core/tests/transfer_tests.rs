//! Integration tests for the transfer client and server over real sockets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    create_test_file, dir_entries, init_tracing, local_catalog, random_bytes,
    test_transfer_config, TestPeer,
};
use peerlink_core::file::FileCatalog;
use peerlink_core::history::{TransferDirection, TransferHistory};
use peerlink_core::protocol::FileHeader;
use peerlink_core::transfer::{ServerEvent, TransferClient, TransferServer};
use peerlink_core::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn raw_request(port: u16, line: &str) -> BufReader<TcpStream> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    BufReader::new(stream)
}

async fn read_reply(stream: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    line.trim_end().to_string()
}

#[tokio::test]
async fn test_list_empty_catalog() {
    init_tracing();
    let peer = TestPeer::start().await;

    let names = peer.client.list_files().await.unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn test_list_returns_every_file_recursively() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("a.txt", b"a");
    peer.add_file("b.bin", &random_bytes(64));
    peer.add_file("photos/c.jpg", b"c");
    peer.add_file("photos/2024/d.jpg", b"d");
    std::fs::create_dir_all(peer.dir.path().join("empty")).unwrap();

    let mut names = peer.client.list_files().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.bin", "c.jpg", "d.jpg"]);
}

#[tokio::test]
async fn test_upload_then_list_contains_file_once() {
    init_tracing();
    let peer = TestPeer::start().await;
    let mut events = peer.server.subscribe();

    let (local_dir, local) = local_catalog();
    let content = random_bytes(20_000);
    create_test_file(local_dir.path(), "a.txt", &content);
    let entry = local.get_file("a.txt").await.unwrap().unwrap();

    peer.client.upload(&entry, &local).await.unwrap();

    let names = peer.client.list_files().await.unwrap();
    assert_eq!(names.iter().filter(|n| *n == "a.txt").count(), 1);
    assert_eq!(std::fs::read(peer.dir.path().join("a.txt")).unwrap(), content);

    loop {
        match events.recv().await.unwrap() {
            ServerEvent::FileReceived { name, size } => {
                assert_eq!(name, "a.txt");
                assert_eq!(size, 20_000);
                break;
            }
            ServerEvent::ClientConnected { .. } => {}
        }
    }
}

#[tokio::test]
async fn test_upload_replaces_existing_file() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("notes.txt", b"old contents that are longer");

    let (local_dir, local) = local_catalog();
    create_test_file(local_dir.path(), "notes.txt", b"new");
    let entry = local.get_file("notes.txt").await.unwrap().unwrap();

    peer.client.upload(&entry, &local).await.unwrap();

    assert_eq!(std::fs::read(peer.dir.path().join("notes.txt")).unwrap(), b"new");
    assert_eq!(dir_entries(peer.dir.path()), vec!["notes.txt"]);
}

#[tokio::test]
async fn test_download_writes_exact_bytes() {
    init_tracing();
    let peer = TestPeer::start().await;
    let content = random_bytes(100_003);
    let source = peer.add_file("nested/data.bin", &content);

    let (local_dir, local) = local_catalog();
    let entry = peer.client.download("data.bin", &local).await.unwrap();

    assert_eq!(entry.name, "data.bin");
    assert_eq!(entry.size, 100_003);
    common::assert_files_equal(&source, &local_dir.path().join("data.bin"));
    assert_eq!(dir_entries(local_dir.path()), vec!["data.bin"]);
}

#[tokio::test]
async fn test_download_empty_file() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("empty.txt", b"");

    let (local_dir, local) = local_catalog();
    let entry = peer.client.download("empty.txt", &local).await.unwrap();

    assert_eq!(entry.size, 0);
    assert!(local_dir.path().join("empty.txt").exists());
}

#[tokio::test]
async fn test_download_missing_file_creates_nothing() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("present.bin", b"here");

    let (local_dir, local) = local_catalog();
    let result = peer.client.download("missing.bin", &local).await;

    assert!(matches!(result, Err(Error::FileNotFound(ref name)) if name == "missing.bin"));
    assert!(dir_entries(local_dir.path()).is_empty());

    // The connection-per-call model leaves the client usable
    peer.client.download("present.bin", &local).await.unwrap();
}

#[tokio::test]
async fn test_download_rejects_invalid_name_before_io() {
    init_tracing();
    let (_dir, local) = local_catalog();
    // Nothing listens here; validation must fail first
    let client = TransferClient::new("127.0.0.1:9".parse().unwrap(), test_transfer_config());

    let result = client.download("../etc/passwd", &local).await;
    assert!(matches!(result, Err(Error::InvalidFileName(_))));
}

#[tokio::test]
async fn test_download_closed_mid_transfer_is_failure() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "GET_FILE:big.bin");

        let inner = stream.get_mut();
        inner.write_all(b"OK\n").await.unwrap();
        FileHeader::new("big.bin", 1000).write(inner).await.unwrap();
        inner.write_all(&[7u8; 100]).await.unwrap();
        inner.shutdown().await.unwrap();
    });

    let (local_dir, local) = local_catalog();
    let client = TransferClient::new(addr, test_transfer_config());
    let result = client.download("big.bin", &local).await;

    assert!(
        matches!(
            result,
            Err(Error::IncompleteTransfer { expected: 1000, received: 100, .. })
                | Err(Error::ConnectionClosed)
                | Err(Error::Io(_))
        ),
        "unexpected result: {result:?}"
    );
    let dir = local_dir.path().to_path_buf();
    wait_until(|| dir_entries(&dir).is_empty()).await;
}

#[tokio::test]
async fn test_short_upload_is_rejected_and_discarded() {
    init_tracing();
    let peer = TestPeer::start().await;
    let port = peer.server.local_addr().await.unwrap().port();

    let mut stream = raw_request(port, "UPLOAD_FILE").await;
    assert_eq!(read_reply(&mut stream).await, "READY");

    FileHeader::new("short.bin", 100)
        .write(stream.get_mut())
        .await
        .unwrap();
    stream.get_mut().write_all(&[1u8; 10]).await.unwrap();
    stream.get_mut().shutdown().await.unwrap();

    assert_eq!(read_reply(&mut stream).await, "FAILED");

    let dir = peer.dir.path().to_path_buf();
    wait_until(|| dir_entries(&dir).is_empty()).await;
}

#[tokio::test]
async fn test_unknown_command_gets_error_and_close() {
    init_tracing();
    let peer = TestPeer::start().await;
    let port = peer.server.local_addr().await.unwrap().port();

    let mut stream = raw_request(port, "DELETE_EVERYTHING").await;
    assert_eq!(read_reply(&mut stream).await, "ERROR:Unknown command");

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_get_missing_file_raw_reply() {
    init_tracing();
    let peer = TestPeer::start().await;
    let port = peer.server.local_addr().await.unwrap().port();

    let mut stream = raw_request(port, "GET_FILE:missing.bin").await;
    assert_eq!(read_reply(&mut stream).await, "ERROR:File not found");
}

#[tokio::test]
async fn test_slow_connection_does_not_block_listing() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("a.txt", b"a");
    let port = peer.server.local_addr().await.unwrap().port();

    // Connected but silent
    let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let names = tokio::time::timeout(Duration::from_secs(2), peer.client.list_files())
        .await
        .expect("listing blocked by idle connection")
        .unwrap();
    assert_eq!(names, vec!["a.txt"]);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_restart_rebinds() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("a.txt", b"a");
    let first = peer.server.local_addr().await.unwrap();

    peer.server.stop().await;
    assert!(!peer.server.is_running().await);
    peer.server.stop().await;
    assert!(peer.server.local_addr().await.is_none());

    let second = peer.server.start().await.unwrap();
    assert_eq!(first.port(), second.port());
    assert_eq!(peer.client.list_files().await.unwrap(), vec!["a.txt"]);
}

#[tokio::test]
async fn test_start_while_running_restarts() {
    init_tracing();
    let peer = TestPeer::start().await;

    peer.server.start().await.unwrap();
    assert!(peer.server.is_running().await);
    assert!(peer.client.list_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stopped_server_refuses_connections() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.server.stop().await;

    let result = peer.client.list_files().await;
    assert!(matches!(result, Err(Error::ConnectFailed { attempts: 2, .. })));
}

#[tokio::test]
async fn test_push_reaches_ready_client() {
    init_tracing();
    let peer = TestPeer::start().await;
    let (local_dir, local) = local_catalog();

    let mut pushes = peer.client.subscribe_pushes(local.clone()).await.unwrap();
    wait_until(|| peer.server.ready_client_count() == 1).await;

    let content = random_bytes(30_000);
    peer.add_file("pushed.bin", &content);
    let served = peer.server.push_file("pushed.bin").await.unwrap();
    assert_eq!(served, 1);

    let name = pushes.next().await.unwrap().unwrap();
    assert_eq!(name, "pushed.bin");
    assert_eq!(std::fs::read(local_dir.path().join("pushed.bin")).unwrap(), content);

    pushes.close();
    drop(pushes);
    wait_until(|| peer.server.ready_client_count() == 0).await;
}

#[tokio::test]
async fn test_push_requires_running_server() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("a.txt", b"a");
    peer.server.stop().await;

    let result = peer.server.push_file("a.txt").await;
    assert!(matches!(result, Err(Error::ServerNotRunning)));
}

#[tokio::test]
async fn test_push_missing_file() {
    init_tracing();
    let peer = TestPeer::start().await;

    let result = peer.server.push_file("nope.txt").await;
    assert!(matches!(result, Err(Error::FileNotFound(_))));
}

#[tokio::test]
async fn test_cleanup_cancels_in_flight_operation() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                // First connection never gets an answer
                held.push(stream);
            } else {
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
                stream.write_all(b"[]\n").await.unwrap();
            }
        }
    });

    let client = TransferClient::new(addr, test_transfer_config());
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.list_files().await }
    });

    let counter = accepted.clone();
    wait_until(|| counter.load(Ordering::SeqCst) == 1).await;
    client.cleanup();
    client.cleanup();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("cancelled operation did not finish")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    // New operations are unaffected by the earlier cleanup
    assert!(client.list_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_address_rejected_before_io() {
    let result = TransferClient::from_host("999.1.1.1", test_transfer_config());
    assert!(matches!(result, Err(Error::InvalidAddress(_))));

    let client = TransferClient::from_host("192.168.49.1", test_transfer_config()).unwrap();
    assert_eq!(client.addr().ip().to_string(), "192.168.49.1");
}

#[tokio::test]
async fn test_transfers_recorded_in_history() {
    init_tracing();
    let (server_dir, server_catalog) = local_catalog();
    create_test_file(server_dir.path(), "from-server.txt", b"hello");
    let server_log = Arc::new(TransferHistory::with_capacity(10));
    let config = test_transfer_config();
    let server = TransferServer::new(server_catalog, config.clone()).with_log_sink(server_log.clone());
    let addr = server.start().await.unwrap();

    let client_log = Arc::new(TransferHistory::with_capacity(10));
    let client = TransferClient::new(
        format!("127.0.0.1:{}", addr.port()).parse().unwrap(),
        config,
    )
    .with_log_sink(client_log.clone());

    let (local_dir, local) = local_catalog();
    client.download("from-server.txt", &local).await.unwrap();
    create_test_file(local_dir.path(), "from-client.txt", b"hi");
    let entry = local.get_file("from-client.txt").await.unwrap().unwrap();
    client.upload(&entry, &local).await.unwrap();

    let received = client_log.filter_by_direction(TransferDirection::Received);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].file_name, "from-server.txt");
    let sent = client_log.filter_by_direction(TransferDirection::Sent);
    assert_eq!(sent[0].file_name, "from-client.txt");

    wait_until(|| server_log.len() == 2).await;
    let newest = &server_log.entries()[0];
    assert_eq!(newest.file_name, "from-client.txt");
    assert_eq!(newest.direction, TransferDirection::Received);

    server.stop().await;
}

#[tokio::test]
async fn test_log_sink_attached_to_running_server() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("late.txt", b"late");

    let server_log = Arc::new(TransferHistory::with_capacity(10));
    peer.server.set_log_sink(server_log.clone());

    let (_local_dir, local) = local_catalog();
    peer.client.download("late.txt", &local).await.unwrap();

    wait_until(|| server_log.len() == 1).await;
    let record = &server_log.entries()[0];
    assert_eq!(record.file_name, "late.txt");
    assert_eq!(record.direction, TransferDirection::Sent);
}

#[tokio::test]
async fn test_first_match_wins_for_duplicate_names() {
    init_tracing();
    let peer = TestPeer::start().await;
    peer.add_file("a/same.txt", b"first");
    peer.add_file("b/same.txt", b"second");

    let catalog = FileCatalog::local(peer.dir.path()).unwrap();
    let expected = catalog.get_file("same.txt").await.unwrap().unwrap();
    let (local_dir, local) = local_catalog();
    peer.client.download("same.txt", &local).await.unwrap();

    let got = std::fs::read(local_dir.path().join("same.txt")).unwrap();
    assert_eq!(got.len() as u64, expected.size);
    assert_eq!(got, b"first");
}
