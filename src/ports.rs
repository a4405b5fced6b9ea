// Port allocation for managed services
// Hands out TCP ports that nothing is currently bound to

use crate::errors::{HarnessError, Result};
use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for a free port on the loopback interface.
///
/// The port is released again before returning, so another process could
/// grab it in the meantime. That window is accepted for test services.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|e| {
        HarnessError::PortAllocation(format!("Failed to bind an ephemeral port: {}", e))
    })?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
