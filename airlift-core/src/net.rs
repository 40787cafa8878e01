use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use anyhow::{Context, Result};
use tracing::debug;

/// Allocates an ephemeral port that is currently free on this host.
///
/// Binds a throwaway listener on port 0 and reads back the OS-assigned
/// port. The listener is dropped before returning, so the caller should
/// re-bind promptly.
///
/// # Errors
///
/// Returns an error if no ephemeral port can be bound.
pub fn allocate_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0))
        .context("failed to allocate an ephemeral port")?;
    let port = listener
        .local_addr()
        .context("failed to read back allocated port")?
        .port();
    debug!(port = port, "Allocated free port");
    Ok(port)
}

/// Resolves the address this host is reachable on for inbound connections.
///
/// Uses the routing table via a connected UDP socket (no packets are
/// sent). Falls back to loopback when the host has no default route,
/// which keeps single-machine setups working.
///
/// # Errors
///
/// Returns an error if no local socket can be created at all; without a
/// reachable address no transfer is possible.
pub fn resolve_local_address() -> Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).context("failed to create probe socket")?;

    // Any routable address works here; connect() only selects a source.
    let addr = match socket.connect(("10.254.254.254", 1)) {
        Ok(()) => socket
            .local_addr()
            .context("failed to read probe socket address")?
            .ip(),
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    debug!(addr = %addr, "Resolved local address");
    Ok(addr)
}
