//! File transfer engine for PeerLink.
//!
//! This module runs both ends of the wire protocol described in
//! [`crate::protocol`]:
//!
//! - [`TransferServer`] accepts connections and answers listings, downloads,
//!   uploads and push registrations, one task per connection
//! - [`TransferClient`] opens one connection per operation with its own
//!   connect retry policy
//! - [`TransferSession`] tracks one operation and reports its progress
//!
//! ## Timeouts
//!
//! Every connect, line read and chunk read or write carries a deadline taken
//! from [`TransferConfig`](crate::config::TransferConfig). An operation that
//! misses a deadline fails with [`Error::Timeout`](crate::Error::Timeout) and
//! its socket is closed.

mod client;
mod server;
mod session;

pub use client::{PushSubscription, TransferClient};
pub use server::{ServerEvent, TransferServer};
pub use session::{SessionDirection, SessionState, TransferProgress, TransferSession};

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::Result;

/// Configure TCP keep-alive on a client socket.
///
/// Keeps idle push channels alive across NAT and group-owner routing:
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref.set_tcp_keepalive(&keepalive)?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Disable Nagle on a transfer socket; command lines are tiny.
fn configure_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }
}
