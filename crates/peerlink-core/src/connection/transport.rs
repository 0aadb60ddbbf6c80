//! Boundary to the platform's peer-to-peer link stack.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identifier of a peer device (for example its MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a transport-level device identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Status of a discovered device as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Discoverable and free to connect
    Available,
    /// A connection invitation is pending
    Invited,
    /// Part of our group
    Connected,
    /// The last connection attempt failed
    Failed,
    /// Out of range or busy
    Unavailable,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "Available"),
            Self::Invited => write!(f, "Invited"),
            Self::Connected => write!(f, "Connected"),
            Self::Failed => write!(f, "Failed"),
            Self::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// A discovered peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    /// Device identifier
    pub id: PeerId,
    /// Human readable device name
    pub name: String,
    /// Current status
    pub status: DeviceStatus,
}

/// Why a transport call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    /// The device has no peer-to-peer support
    #[error("peer-to-peer links are not supported on this device")]
    Unsupported,
    /// The link stack is busy with another request
    #[error("system is busy")]
    Busy,
    /// The link stack reported an internal error
    #[error("connection failed due to an internal error")]
    Internal,
    /// Any other failure
    #[error("{0}")]
    Other(String),
}

impl TransportFailure {
    /// Whether retrying the same call later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Result of a transport call.
pub type TransportResult<T> = std::result::Result<T, TransportFailure>;

/// Members of the currently formed group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group owner
    pub owner: Option<PeerId>,
    /// Group clients
    pub clients: Vec<PeerId>,
}

impl GroupInfo {
    /// Whether `peer` is the owner or a client of this group.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.owner.as_ref() == Some(peer) || self.clients.contains(peer)
    }
}

/// Connection details once a group exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Whether a group is formed
    pub group_formed: bool,
    /// Whether this device owns the group
    pub is_group_owner: bool,
    /// Address of the group owner, once resolvable
    pub group_owner_address: Option<String>,
}

/// Asynchronous notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Group membership changed
    ConnectionChanged {
        /// Whether a group is currently formed
        group_formed: bool,
    },
    /// The list of discovered peers changed
    PeersChanged(Vec<PeerDevice>),
    /// Discovery started or stopped
    DiscoveryChanged {
        /// Whether discovery is running
        active: bool,
    },
}

/// The narrow surface of the platform link stack the supervisor drives.
///
/// Each call resolves once the platform reports the outcome; implementations
/// translate platform callbacks into these futures. Unsolicited changes are
/// delivered separately as [`TransportEvent`]s.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Start discovering nearby peers.
    async fn discover_peers(&self) -> TransportResult<()>;

    /// Stop peer discovery.
    async fn stop_discovery(&self) -> TransportResult<()>;

    /// Ask the platform to connect to `peer`.
    ///
    /// Success means the request was accepted, not that the link is up.
    async fn connect(&self, peer: &PeerId) -> TransportResult<()>;

    /// Cancel a pending connect request.
    async fn cancel_connect(&self) -> TransportResult<()>;

    /// Dissolve the current group.
    async fn remove_group(&self) -> TransportResult<()>;

    /// Current group membership, if a group exists.
    async fn request_group_info(&self) -> TransportResult<Option<GroupInfo>>;

    /// Current connection details.
    async fn request_connection_info(&self) -> TransportResult<ConnectionInfo>;
}
