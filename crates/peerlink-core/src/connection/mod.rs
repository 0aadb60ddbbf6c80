//! Peer link management.
//!
//! This module owns the lifecycle of the logical link to one peer:
//!
//! - [`LinkTransport`] is the narrow boundary to the platform's peer-to-peer
//!   stack (discovery, group formation, group and connection info)
//! - [`ConnectionSupervisor`] is the state machine that drives it: connect
//!   with timeout and bounded retry, keep-alive checks while connected, and
//!   orderly teardown on disconnect
//!
//! Once connected, the supervisor publishes a [`PeerEndpoint`] whose address
//! the transfer client connects to.

mod supervisor;
mod transport;

pub use supervisor::{
    ConnectOutcome, ConnectionState, ConnectionSupervisor, PeerEndpoint, SupervisorEvent,
};
pub use transport::{
    ConnectionInfo, DeviceStatus, GroupInfo, LinkTransport, PeerDevice, PeerId, TransportEvent,
    TransportFailure, TransportResult,
};

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.49.1`) - uses `default_port`
/// - `IP:PORT` (e.g., `192.168.49.1:9000`) - uses specified port
/// - `[IPv6]` (e.g., `[::1]`) - uses `default_port`
/// - `[IPv6]:PORT` (e.g., `[::1]:9000`) - uses specified port
///
/// # Examples
///
/// ```
/// use peerlink_core::connection::parse_host_address;
///
/// let addr = parse_host_address("192.168.49.1", 8988).unwrap();
/// assert_eq!(addr.port(), 8988);
///
/// let addr = parse_host_address("192.168.49.1:9000", 8988).unwrap();
/// assert_eq!(addr.port(), 9000);
/// ```
///
/// # Errors
///
/// Returns `Error::InvalidAddress` if the host string cannot be parsed.
pub fn parse_host_address(host: &str, default_port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidAddress(format!(
            "'{host}'. Use IP or IP:PORT (e.g., 192.168.49.1 or 192.168.49.1:{default_port})"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if host.starts_with('[') && host.ends_with(']') {
        let ip: IpAddr = host[1..host.len() - 1].parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Some((ip_part, port_part)) = host.rsplit_once(':') {
        if !ip_part.contains(':') {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidAddress(format!(
                    "port '{port_part}' must be a number between 1 and 65535"
                ))
            })?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(invalid())
}
