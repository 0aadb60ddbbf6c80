//! Common test utilities for `PeerLink` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::config::TransferConfig;
use peerlink_core::connection::{
    ConnectionInfo, GroupInfo, LinkTransport, PeerId, TransportFailure, TransportResult,
};
use peerlink_core::file::FileCatalog;
use peerlink_core::transfer::{TransferClient, TransferServer};

/// Base port for tests, incremented for each test to avoid conflicts.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(52600);

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Names of the entries directly inside `dir`, sorted.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("Failed to read directory")
        .map(|e| e.expect("Bad dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Get a unique port for a test to avoid conflicts between parallel tests.
pub fn next_test_port() -> u16 {
    TEST_PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Transfer settings with short timeouts and a unique port.
pub fn test_transfer_config() -> TransferConfig {
    TransferConfig {
        port: next_test_port(),
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
        max_connect_attempts: 2,
        retry_delay: Duration::from_millis(100),
        bind_retry_delay: Duration::from_millis(100),
        ..TransferConfig::default()
    }
}

/// A running server over a fresh temp folder plus a client pointed at it.
pub struct TestPeer {
    pub dir: tempfile::TempDir,
    pub catalog: Arc<FileCatalog>,
    pub server: TransferServer,
    pub client: TransferClient,
}

impl TestPeer {
    /// Start a server on a unique port.
    pub async fn start() -> Self {
        let dir = create_temp_dir();
        let catalog = Arc::new(FileCatalog::local(dir.path()).expect("catalog"));
        let config = test_transfer_config();
        let server = TransferServer::new(catalog.clone(), config.clone());
        let addr = server.start().await.expect("server start");
        let client = TransferClient::new(
            format!("127.0.0.1:{}", addr.port()).parse().expect("addr"),
            config,
        );
        Self {
            dir,
            catalog,
            server,
            client,
        }
    }

    /// Write a file into the served folder.
    pub fn add_file(&self, name: &str, content: &[u8]) -> PathBuf {
        create_test_file(self.dir.path(), name, content)
    }
}

/// A local catalog over a fresh temp folder.
pub fn local_catalog() -> (tempfile::TempDir, Arc<FileCatalog>) {
    let dir = create_temp_dir();
    let catalog = Arc::new(FileCatalog::local(dir.path()).expect("catalog"));
    (dir, catalog)
}

#[derive(Debug, Default)]
struct MockState {
    connect_results: VecDeque<TransportResult<()>>,
    connect_delay: Duration,
    info_delay: Duration,
    group: Option<GroupInfo>,
    connection_info: ConnectionInfo,
    failing_steps: HashSet<&'static str>,
    calls: HashMap<&'static str, usize>,
    connected_peers: Vec<PeerId>,
}

/// Scripted link transport.
///
/// `connect` answers from a queue of scripted results (success once the queue
/// is empty). Group and connection info are whatever was last set.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose connects succeed and whose group forms at once.
    pub fn forming_group(peer: &PeerId, address: &str) -> Arc<Self> {
        let mock = Self::new();
        mock.set_connection_info(true, address);
        mock.set_group_members(Some(vec![peer.clone()]));
        mock
    }

    pub fn script_connect(&self, results: impl IntoIterator<Item = TransportResult<()>>) {
        self.lock().connect_results.extend(results);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Connection info queries answer with what was set when they were
    /// issued, after `delay`.
    pub fn set_info_delay(&self, delay: Duration) {
        self.lock().info_delay = delay;
    }

    pub fn set_connection_info(&self, group_formed: bool, address: &str) {
        self.lock().connection_info = ConnectionInfo {
            group_formed,
            is_group_owner: false,
            group_owner_address: Some(address.to_string()),
        };
    }

    /// `None` means no group exists.
    pub fn set_group_members(&self, clients: Option<Vec<PeerId>>) {
        self.lock().group = clients.map(|clients| GroupInfo {
            owner: None,
            clients,
        });
    }

    pub fn fail_step(&self, step: &'static str) {
        self.lock().failing_steps.insert(step);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.lock().connected_peers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn step(&self, name: &'static str) -> TransportResult<()> {
        let mut state = self.lock();
        *state.calls.entry(name).or_default() += 1;
        if state.failing_steps.contains(name) {
            Err(TransportFailure::Internal)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LinkTransport for MockTransport {
    async fn discover_peers(&self) -> TransportResult<()> {
        self.step("discover_peers")
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        self.step("stop_discovery")
    }

    async fn connect(&self, peer: &PeerId) -> TransportResult<()> {
        let (delay, result) = {
            let mut state = self.lock();
            *state.calls.entry("connect").or_default() += 1;
            state.connected_peers.push(peer.clone());
            (
                state.connect_delay,
                state.connect_results.pop_front().unwrap_or(Ok(())),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn cancel_connect(&self) -> TransportResult<()> {
        self.step("cancel_connect")
    }

    async fn remove_group(&self) -> TransportResult<()> {
        self.step("remove_group")
    }

    async fn request_group_info(&self) -> TransportResult<Option<GroupInfo>> {
        self.step("request_group_info")?;
        Ok(self.lock().group.clone())
    }

    async fn request_connection_info(&self) -> TransportResult<ConnectionInfo> {
        self.step("request_connection_info")?;
        let (delay, info) = {
            let state = self.lock();
            (state.info_delay, state.connection_info.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(info)
    }
}
