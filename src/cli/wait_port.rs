use crate::config::HarnessConfig;
use crate::readiness::ReadinessProbe;
use anyhow::Result;
use colored::Colorize;
use std::env;
use std::time::Duration;

/// Block until `port` accepts TCP connections
pub fn run(port: u16, host: Option<String>, timeout: Option<Duration>) -> Result<()> {
    let config = HarnessConfig::discover(&env::current_dir()?)?;
    let host = host.unwrap_or_else(|| config.host.clone());
    let timeout = timeout.unwrap_or_else(|| config.start_timeout());

    let probe = ReadinessProbe::new()
        .with_host(host.clone())
        .with_poll_interval(config.poll_interval());
    probe.wait(port, timeout)?;

    eprintln!("{} {}:{} is accepting connections", "✓".green(), host, port);
    Ok(())
}
