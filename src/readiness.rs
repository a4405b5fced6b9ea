//! Readiness detection for managed services.
//!
//! A spawned service gives no portable "I'm ready" signal, so readiness is
//! detected by polling: the probe keeps opening TCP connections to the
//! service port until one is accepted or the deadline passes. Failed
//! connection attempts are the expected steady state while the service boots.

use crate::clock::{Clock, SystemClock};
use crate::errors::{HarnessError, Result};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for a single connect attempt
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(1);

/// Wait until `port` on `host` starts accepting TCP connections.
///
/// Uses the default poll interval and the system clock.
pub fn wait_for_port(port: u16, host: &str, timeout: Duration) -> Result<()> {
    ReadinessProbe::new().with_host(host).wait(port, timeout)
}

/// Polls a TCP port until it accepts a connection
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    host: String,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl ReadinessProbe {
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Block until the port accepts a connection or `timeout` elapses.
    ///
    /// The accepted connection is closed immediately. Fails with
    /// [`HarnessError::ReadinessTimeout`] once at least `timeout` has passed
    /// since the first attempt.
    pub fn wait(&self, port: u16, timeout: Duration) -> Result<()> {
        self.wait_while(port, timeout, || Ok(()))
    }

    /// Like [`ReadinessProbe::wait`], but `check` runs before every attempt
    /// and once more after a successful connect; its first error aborts the
    /// wait and is returned as is.
    pub fn wait_while<F>(&self, port: u16, timeout: Duration, mut check: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let start = self.clock.now();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            check()?;
            let elapsed = self.clock.now().duration_since(start);
            let remaining = timeout.saturating_sub(elapsed);

            match self.try_connect(port, remaining) {
                Ok(addr) => {
                    check()?;
                    tracing::debug!(
                        host = %self.host,
                        port,
                        %addr,
                        attempts,
                        "port is accepting connections"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::trace!(host = %self.host, port, error = %e, "port not ready yet");
                }
            }

            self.clock.sleep(self.poll_interval);

            if self.clock.now().duration_since(start) >= timeout {
                tracing::debug!(host = %self.host, port, attempts, "gave up waiting for port");
                return Err(HarnessError::ReadinessTimeout {
                    host: self.host.clone(),
                    port,
                    timeout,
                });
            }
        }
    }

    /// One connection attempt against every address the host resolves to
    fn try_connect(&self, port: u16, remaining: Duration) -> std::io::Result<SocketAddr> {
        let connect_timeout = remaining.clamp(MIN_CONNECT_TIMEOUT, MAX_CONNECT_TIMEOUT);
        let mut last_error = None;

        for addr in (self.host.as_str(), port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                // Dropping the stream closes the connection right away
                Ok(_stream) => return Ok(addr),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", self.host),
            )
        }))
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new()
    }
}
