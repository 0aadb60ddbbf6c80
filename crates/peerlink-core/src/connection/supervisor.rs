//! Connection supervisor: the state machine for the link to one peer.
//!
//! The supervisor runs as a single task that owns all connection state.
//! Requests from the handle, transport notifications, results of transport
//! calls and timers all arrive at that task and are handled one at a time, so
//! transitions never race each other.
//!
//! ## States
//!
//! ```text
//!            connect              group formed + address
//!   Idle ─────────────▶ Connecting ───────────────────────▶ Connected
//!    ▲                   │  │  ▲ retry (busy)                  │
//!    │                   │  └──┘                               │ keep-alive loss
//!    │      timeout /    ▼                                     ▼
//!    └──────────────── Failed                               Disconnected
//! ```
//!
//! Transport calls run as spawned tasks and report back tagged with the
//! generation of the attempt that issued them. Every new attempt and every
//! teardown bumps the generation, so late results of superseded attempts are
//! ignored.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::transport::{
    ConnectionInfo, GroupInfo, LinkTransport, PeerDevice, PeerId, TransportEvent,
    TransportResult,
};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Observable connection state.
///
/// `connecting` and `connected` are never both true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// A connect attempt is in progress
    pub connecting: bool,
    /// The link is up
    pub connected: bool,
    /// The last connect attempt failed
    pub failed: bool,
    /// Reason of the last failure or loss
    pub error_message: Option<String>,
    /// Peer of the current attempt or link
    pub peer: Option<PeerId>,
}

impl ConnectionState {
    fn connecting(peer: &PeerId) -> Self {
        Self {
            connecting: true,
            peer: Some(peer.clone()),
            ..Self::default()
        }
    }

    fn connected(peer: &PeerId) -> Self {
        Self {
            connected: true,
            peer: Some(peer.clone()),
            ..Self::default()
        }
    }

    fn failed(reason: &str) -> Self {
        Self {
            failed: true,
            error_message: Some(reason.to_string()),
            ..Self::default()
        }
    }

    fn lost(reason: &str) -> Self {
        Self {
            error_message: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

/// Where the peer's transfer server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Whether this device owns the group
    pub is_group_owner: bool,
    /// Group owner address
    pub address: String,
}

/// What a `connect` request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new attempt was started
    Started,
    /// The same peer is already connecting or connected
    AlreadyActive,
    /// Ignored; too soon after the previous request
    Debounced,
}

/// One notification per state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A connect attempt started
    Connecting {
        /// Target peer
        peer: PeerId,
    },
    /// The transport accepted the connect request
    Invited {
        /// Target peer
        peer: PeerId,
    },
    /// The link is up
    Connected {
        /// Connected peer
        peer: PeerId,
        /// Resolved endpoint
        endpoint: PeerEndpoint,
    },
    /// The connect attempt failed
    Failed {
        /// Target peer
        peer: PeerId,
        /// Failure reason
        reason: String,
    },
    /// The link ended
    Disconnected {
        /// Peer that was connected or connecting, if any
        peer: Option<PeerId>,
        /// Why the link ended
        reason: String,
    },
}

#[derive(Debug)]
enum Request {
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<ConnectOutcome>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    CancelInvitation {
        reply: oneshot::Sender<bool>,
    },
    DiscoverPeers {
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
enum Completion {
    Connect {
        generation: u64,
        result: TransportResult<()>,
    },
    ConnectionInfo {
        generation: u64,
        result: TransportResult<ConnectionInfo>,
    },
    KeepAlive {
        generation: u64,
        result: TransportResult<Option<GroupInfo>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Connecting,
    Connected,
}

/// State of the single peer link. Dropped on failure, loss and disconnect.
#[derive(Debug)]
struct PeerConnection {
    peer: PeerId,
    phase: LinkPhase,
    invited: bool,
    retry_count: u32,
    keep_alive_failures: u32,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
    next_keep_alive: Option<Instant>,
    last_keep_alive: Option<Instant>,
    keep_alive_in_flight: bool,
    info_in_flight: bool,
    /// Another info query was asked for while one was in flight
    requery_info: bool,
}

impl PeerConnection {
    fn new(peer: PeerId, deadline: Instant) -> Self {
        Self {
            peer,
            phase: LinkPhase::Connecting,
            invited: false,
            retry_count: 0,
            keep_alive_failures: 0,
            deadline: Some(deadline),
            retry_at: None,
            next_keep_alive: None,
            last_keep_alive: None,
            keep_alive_in_flight: false,
            info_in_flight: false,
            requery_info: false,
        }
    }
}

/// Handle to a running connection supervisor.
///
/// Dropping the handle stops the supervisor task.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    endpoint: watch::Receiver<Option<PeerEndpoint>>,
    peers: watch::Receiver<Vec<PeerDevice>>,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Start a supervisor driving `transport`.
    ///
    /// `notifications` carries the transport's unsolicited events.
    pub fn spawn(
        transport: Arc<dyn LinkTransport>,
        notifications: mpsc::Receiver<TransportEvent>,
        config: ConnectionConfig,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(32);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(64);
        let shutdown = CancellationToken::new();

        let actor = Supervisor {
            transport,
            config,
            conn: None,
            generation: 0,
            last_action: None,
            discovery_restart_at: None,
            state_tx,
            endpoint_tx,
            peers_tx,
            events: events.clone(),
            completions: completions_tx,
        };
        let task = tokio::spawn(actor.run(
            requests_rx,
            notifications,
            completions_rx,
            shutdown.clone(),
        ));

        Self {
            requests: requests_tx,
            state: state_rx,
            endpoint: endpoint_rx,
            peers: peers_rx,
            events,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a connection to `peer`.
    pub async fn connect(&self, peer: PeerId) -> Result<ConnectOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Connect { peer, reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Tear the link down and return to idle.
    ///
    /// Every teardown step is attempted even if an earlier one fails.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Disconnect { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Withdraw a connect request the transport already accepted.
    ///
    /// Returns `false` if no attempt is waiting in the invited state.
    pub async fn cancel_invitation(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::CancelInvitation { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Start peer discovery.
    pub async fn discover_peers(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::DiscoverPeers { reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Wait until the link is up and return the peer endpoint.
    ///
    /// Fails with [`Error::LinkFailed`] if the attempt fails, the link is lost,
    /// or the supervisor returns to idle through a disconnect or a cancelled
    /// invitation. Fails with [`Error::ConnectionTimeout`] if nothing happens
    /// within `limit`.
    pub async fn wait_for_endpoint(&self, limit: Duration) -> Result<PeerEndpoint> {
        let mut endpoint = self.endpoint.clone();
        let mut state = self.state.clone();

        let wait = async {
            let mut seen_active = false;
            loop {
                if let Some(resolved) = endpoint.borrow_and_update().clone() {
                    return Ok(resolved);
                }
                {
                    let current = state.borrow_and_update();
                    let active = current.connecting || current.connected;
                    seen_active |= active;
                    let ended =
                        !active && (seen_active || current.error_message.is_some());
                    if current.failed || ended {
                        let reason = current
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "Disconnected".to_string());
                        return Err(Error::LinkFailed(reason));
                    }
                }
                let closed = tokio::select! {
                    changed = endpoint.changed() => changed.is_err(),
                    changed = state.changed() => changed.is_err(),
                };
                if closed {
                    return Err(stopped());
                }
            }
        };

        timeout(limit, wait)
            .await
            .map_err(|_| Error::ConnectionTimeout(limit.as_secs()))?
    }

    /// Connection state stream.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Snapshot of the connection state.
    pub fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Resolved peer endpoint stream; `None` while not connected.
    pub fn endpoint(&self) -> watch::Receiver<Option<PeerEndpoint>> {
        self.endpoint.clone()
    }

    /// Discovered peers stream.
    pub fn peers(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.peers.clone()
    }

    /// Transition events.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Stop the supervisor task. Further requests fail.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Connection supervisor task ended abnormally: {}", e);
            }
        }
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| stopped())
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn stopped() -> Error {
    Error::Internal("connection supervisor is not running".to_string())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Supervisor {
    transport: Arc<dyn LinkTransport>,
    config: ConnectionConfig,
    conn: Option<PeerConnection>,
    generation: u64,
    last_action: Option<Instant>,
    discovery_restart_at: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    endpoint_tx: watch::Sender<Option<PeerEndpoint>>,
    peers_tx: watch::Sender<Vec<PeerDevice>>,
    events: broadcast::Sender<SupervisorEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut notifications: mpsc::Receiver<TransportEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        shutdown: CancellationToken,
    ) {
        let mut notifications_open = true;
        tracing::debug!("Connection supervisor started");

        loop {
            let deadline = self.conn.as_ref().and_then(|c| c.deadline);
            let retry_at = self.conn.as_ref().and_then(|c| c.retry_at);
            let keep_alive_at = self.conn.as_ref().and_then(|c| c.next_keep_alive);
            let discovery_at = self.discovery_restart_at;

            tokio::select! {
                () = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = notifications.recv(), if notifications_open => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        tracing::debug!("Transport notification channel closed");
                        notifications_open = false;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                () = sleep_until_opt(deadline) => self.on_connect_timeout(),
                () = sleep_until_opt(retry_at) => self.on_retry_due(),
                () = sleep_until_opt(keep_alive_at) => self.on_keep_alive_due(),
                () = sleep_until_opt(discovery_at) => self.restart_discovery().await,
            }
        }

        tracing::debug!("Connection supervisor stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { peer, reply } => {
                let outcome = self.handle_connect(peer);
                let _ = reply.send(outcome);
            }
            Request::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Request::CancelInvitation { reply } => {
                let cancelled = self.cancel_invitation().await;
                let _ = reply.send(cancelled);
            }
            Request::DiscoverPeers { reply } => {
                let result = self
                    .bounded_step("discover peers", self.transport.discover_peers())
                    .await;
                let _ = reply.send(result);
            }
        }
    }

    fn handle_connect(&mut self, peer: PeerId) -> ConnectOutcome {
        if let Some(conn) = &self.conn {
            if conn.peer == peer {
                tracing::debug!(peer = %peer, "Connect ignored, already {:?}", conn.phase);
                return ConnectOutcome::AlreadyActive;
            }
        }

        let now = Instant::now();
        if let Some(last) = self.last_action {
            if now.duration_since(last) < self.config.min_action_interval {
                tracing::debug!(peer = %peer, "Connect ignored, too soon after previous request");
                return ConnectOutcome::Debounced;
            }
        }

        self.last_action = Some(now);
        self.start_attempt(peer);
        ConnectOutcome::Started
    }

    fn start_attempt(&mut self, peer: PeerId) {
        if let Some(previous) = self.conn.take() {
            tracing::info!(
                "Superseding {:?} link to {} with new attempt",
                previous.phase,
                previous.peer
            );
        }

        self.generation += 1;
        let deadline = Instant::now() + self.config.connect_timeout;
        self.conn = Some(PeerConnection::new(peer.clone(), deadline));
        self.discovery_restart_at = None;

        tracing::info!(peer = %peer, generation = self.generation, "Connecting");
        self.state_tx.send_replace(ConnectionState::connecting(&peer));
        self.endpoint_tx.send_replace(None);
        let _ = self.events.send(SupervisorEvent::Connecting { peer });

        self.issue_connect();
    }

    fn issue_connect(&self) {
        let Some(conn) = &self.conn else {
            return;
        };

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let generation = self.generation;
        let peer = conn.peer.clone();
        tokio::spawn(async move {
            let result = transport.connect(&peer).await;
            let _ = completions.send(Completion::Connect { generation, result });
        });
    }

    fn request_connection_info(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.info_in_flight {
            // The answer in flight may predate the change that prompted this
            conn.requery_info = true;
            return;
        }
        conn.info_in_flight = true;

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = transport.request_connection_info().await;
            let _ = completions.send(Completion::ConnectionInfo { generation, result });
        });
    }

    /// The current attempt in `phase`, if `generation` still identifies it.
    fn current(&mut self, generation: u64, phase: LinkPhase) -> Option<&mut PeerConnection> {
        if generation != self.generation {
            tracing::debug!(
                stale = generation,
                current = self.generation,
                "Ignoring result of superseded attempt"
            );
            return None;
        }
        self.conn.as_mut().filter(|c| c.phase == phase)
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connect { generation, result } => {
                self.on_connect_result(generation, result);
            }
            Completion::ConnectionInfo { generation, result } => {
                self.on_connection_info(generation, result);
            }
            Completion::KeepAlive { generation, result } => {
                self.on_keep_alive_result(generation, result);
            }
        }
    }

    fn on_connect_result(&mut self, generation: u64, result: TransportResult<()>) {
        let max_retries = self.config.max_connect_retries;
        let base_delay = self.config.retry_base_delay;
        let Some(conn) = self.current(generation, LinkPhase::Connecting) else {
            return;
        };

        match result {
            Ok(()) => {
                conn.invited = true;
                let peer = conn.peer.clone();
                tracing::info!(peer = %peer, "Connect request accepted, waiting for group");
                let _ = self.events.send(SupervisorEvent::Invited { peer });
                // The group may already be up if the notification raced the result
                self.request_connection_info();
            }
            Err(failure) if failure.is_transient() && conn.retry_count < max_retries => {
                conn.retry_count += 1;
                let delay = base_delay * conn.retry_count;
                conn.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    peer = %conn.peer,
                    "Connect failed ({}), retry {}/{} in {:?}",
                    failure,
                    conn.retry_count,
                    max_retries,
                    delay
                );
            }
            Err(failure) => {
                let reason = if failure.is_transient() {
                    format!("{failure} (gave up after {max_retries} retries)")
                } else {
                    failure.to_string()
                };
                self.fail(&reason);
            }
        }
    }

    fn on_retry_due(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.retry_at = None;
            tracing::debug!(peer = %conn.peer, attempt = conn.retry_count, "Retrying connect");
        }
        self.issue_connect();
    }

    fn on_connection_info(&mut self, generation: u64, result: TransportResult<ConnectionInfo>) {
        let keep_alive_interval = self.config.keep_alive_interval;
        let Some(conn) = self.current(generation, LinkPhase::Connecting) else {
            return;
        };
        conn.info_in_flight = false;
        let requery = std::mem::take(&mut conn.requery_info);

        let info = match result {
            Ok(info) => info,
            Err(failure) => {
                tracing::warn!(peer = %conn.peer, "Connection info unavailable: {}", failure);
                if requery {
                    self.request_connection_info();
                }
                return;
            }
        };

        let address = match info.group_owner_address {
            Some(address) if info.group_formed && !address.is_empty() => address,
            _ => {
                tracing::debug!(peer = %conn.peer, requery, "Group not ready yet");
                if requery {
                    self.request_connection_info();
                }
                return;
            }
        };

        let endpoint = PeerEndpoint {
            is_group_owner: info.is_group_owner,
            address,
        };

        conn.phase = LinkPhase::Connected;
        conn.deadline = None;
        conn.retry_at = None;
        conn.retry_count = 0;
        conn.keep_alive_failures = 0;
        conn.invited = false;
        conn.next_keep_alive = Some(Instant::now() + keep_alive_interval);
        let peer = conn.peer.clone();

        tracing::info!(
            peer = %peer,
            address = %endpoint.address,
            group_owner = endpoint.is_group_owner,
            "Connected"
        );
        self.state_tx.send_replace(ConnectionState::connected(&peer));
        self.endpoint_tx.send_replace(Some(endpoint.clone()));
        let _ = self.events.send(SupervisorEvent::Connected { peer, endpoint });
    }

    fn on_connect_timeout(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.deadline = None;
        if conn.phase != LinkPhase::Connecting {
            return;
        }

        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.cancel_connect().await {
                tracing::debug!("Cancel after timeout failed: {}", e);
            }
        });

        let reason = format!(
            "Connection timed out after {} seconds",
            self.config.connect_timeout.as_secs()
        );
        self.fail(&reason);
    }

    fn on_keep_alive_due(&mut self) {
        let now = Instant::now();
        let min_interval = self.config.min_keep_alive_check_interval;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.next_keep_alive = None;
        if conn.phase != LinkPhase::Connected || conn.keep_alive_in_flight {
            return;
        }

        if let Some(last) = conn.last_keep_alive {
            if now.duration_since(last) < min_interval {
                conn.next_keep_alive = Some(last + min_interval);
                return;
            }
        }

        conn.last_keep_alive = Some(now);
        conn.keep_alive_in_flight = true;

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = transport.request_group_info().await;
            let _ = completions.send(Completion::KeepAlive { generation, result });
        });
    }

    fn on_keep_alive_result(&mut self, generation: u64, result: TransportResult<Option<GroupInfo>>) {
        let threshold = self.config.keep_alive_failure_threshold;
        let interval = self.config.keep_alive_interval;
        let Some(conn) = self.current(generation, LinkPhase::Connected) else {
            return;
        };
        conn.keep_alive_in_flight = false;

        let alive = match &result {
            Ok(Some(group)) => group.contains(&conn.peer),
            Ok(None) | Err(_) => false,
        };

        if alive {
            if conn.keep_alive_failures > 0 {
                tracing::debug!(peer = %conn.peer, "Keep-alive recovered");
            }
            conn.keep_alive_failures = 0;
        } else {
            conn.keep_alive_failures += 1;
            tracing::warn!(
                peer = %conn.peer,
                "Keep-alive check failed ({}/{})",
                conn.keep_alive_failures,
                threshold
            );
        }

        if conn.keep_alive_failures >= threshold {
            self.link_lost("Connection lost");
        } else {
            conn.next_keep_alive = Some(Instant::now() + interval);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionChanged { group_formed } => {
                let phase = self.conn.as_ref().map(|c| c.phase);
                match (phase, group_formed) {
                    (Some(LinkPhase::Connecting), true) => self.request_connection_info(),
                    (Some(LinkPhase::Connected), false) => self.link_lost("Connection lost"),
                    _ => tracing::debug!(group_formed, "Connection change ignored"),
                }
            }
            TransportEvent::PeersChanged(peers) => {
                tracing::debug!(count = peers.len(), "Peer list updated");
                self.peers_tx.send_replace(peers);
            }
            TransportEvent::DiscoveryChanged { active } => {
                tracing::debug!(active, "Discovery state changed");
            }
        }
    }

    /// Record a failed attempt and clear the peer state.
    fn fail(&mut self, reason: &str) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.generation += 1;

        tracing::warn!(peer = %conn.peer, "Connection failed: {}", reason);
        self.state_tx.send_replace(ConnectionState::failed(reason));
        self.endpoint_tx.send_replace(None);
        let _ = self.events.send(SupervisorEvent::Failed {
            peer: conn.peer,
            reason: reason.to_string(),
        });
    }

    /// An established link went away.
    fn link_lost(&mut self, reason: &str) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.generation += 1;

        tracing::warn!(peer = %conn.peer, "Disconnected: {}", reason);
        self.state_tx.send_replace(ConnectionState::lost(reason));
        self.endpoint_tx.send_replace(None);
        let _ = self.events.send(SupervisorEvent::Disconnected {
            peer: Some(conn.peer.clone()),
            reason: reason.to_string(),
        });

        if self.config.auto_reconnect {
            tracing::info!(peer = %conn.peer, "Reconnecting after link loss");
            self.last_action = Some(Instant::now());
            self.start_attempt(conn.peer);
        }
    }

    async fn disconnect(&mut self) {
        let peer = self.conn.take().map(|c| c.peer);
        self.generation += 1;
        tracing::info!(peer = ?peer, "Disconnecting");

        let steps: [(&str, TransportStep<'_>); 3] = [
            ("stop discovery", self.transport.stop_discovery()),
            ("cancel connect", self.transport.cancel_connect()),
            ("remove group", self.transport.remove_group()),
        ];
        for (name, step) in steps {
            if let Err(e) = self.bounded_step(name, step).await {
                tracing::warn!("Teardown step '{}' failed: {}", name, e);
            }
        }

        self.state_tx.send_replace(ConnectionState::default());
        self.endpoint_tx.send_replace(None);
        if peer.is_some() {
            let _ = self.events.send(SupervisorEvent::Disconnected {
                peer,
                reason: "Disconnected by request".to_string(),
            });
        }

        self.discovery_restart_at = Some(Instant::now() + self.config.discovery_restart_delay);
    }

    async fn cancel_invitation(&mut self) -> bool {
        let invited = self
            .conn
            .as_ref()
            .is_some_and(|c| c.phase == LinkPhase::Connecting && c.invited);
        if !invited {
            return false;
        }

        let peer = self.conn.take().map(|c| c.peer);
        self.generation += 1;

        if let Err(e) = self
            .bounded_step("cancel connect", self.transport.cancel_connect())
            .await
        {
            tracing::warn!("Cancelling invitation failed: {}", e);
        }

        tracing::info!(peer = ?peer, "Invitation cancelled");
        self.state_tx.send_replace(ConnectionState::default());
        self.endpoint_tx.send_replace(None);
        let _ = self.events.send(SupervisorEvent::Disconnected {
            peer,
            reason: "Invitation cancelled".to_string(),
        });
        true
    }

    async fn restart_discovery(&mut self) {
        self.discovery_restart_at = None;
        if self.conn.is_some() {
            return;
        }
        if let Err(e) = self
            .bounded_step("discover peers", self.transport.discover_peers())
            .await
        {
            tracing::warn!("Restarting discovery failed: {}", e);
        }
    }

    async fn bounded_step(&self, name: &str, step: TransportStep<'_>) -> Result<()> {
        let limit = self.config.teardown_step_timeout;
        match timeout(limit, step).await {
            Ok(Ok(())) => {
                tracing::debug!("{} done", name);
                Ok(())
            }
            Ok(Err(failure)) => Err(Error::Transport(failure)),
            Err(_) => Err(Error::Timeout(limit.as_secs())),
        }
    }
}

type TransportStep<'a> = futures::future::BoxFuture<'a, TransportResult<()>>;
