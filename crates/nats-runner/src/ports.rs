//! Free loopback TCP ports.
//!
//! A port is found by binding to port 0 and reading what the OS assigned,
//! then releasing the listener. Another process may claim the port between
//! the release and the moment the server binds it; callers accept that race.

use nats_runner_core::RunnerError;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Ask the OS for a free port on 127.0.0.1
pub fn allocate_ephemeral_port() -> Result<u16, RunnerError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    debug!(port, "Allocated ephemeral port");
    Ok(port)
}

/// Allocate a client port and a monitoring port that are guaranteed distinct.
///
/// Both listeners are held until both ports are known.
pub fn allocate_port_pair() -> Result<(u16, u16), RunnerError> {
    let client = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let monitoring = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let ports = (client.local_addr()?.port(), monitoring.local_addr()?.port());
    debug!(port = ports.0, monitoring_port = ports.1, "Allocated port pair");
    Ok(ports)
}
