use crate::command::{EnvMode, ServiceCommand};
use crate::config::HarnessConfig;
use crate::errors::HarnessError;
use crate::process::ManagedProcess;
use anyhow::{Context, Result};
use colored::Colorize;
use std::env;
use std::io::{self, BufRead};
use std::time::Duration;

pub struct RunOptions {
    pub command: Vec<String>,
    pub port: Option<u16>,
    pub env: Vec<(String, String)>,
    pub inherit_env: bool,
    pub timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
}

/// Start a service, print its URL and keep it up until stdin says stop
pub fn run(options: RunOptions) -> Result<()> {
    let config = HarnessConfig::discover(&env::current_dir()?)?;
    let start_timeout = options.timeout.unwrap_or_else(|| config.start_timeout());
    let stop_timeout = options.stop_timeout.unwrap_or_else(|| config.stop_timeout());
    let mode = if options.inherit_env {
        EnvMode::Inherit
    } else {
        EnvMode::ReplaceOnly
    };

    let mut service = ManagedProcess::new(ServiceCommand::tokens(options.command), options.port)?
        .with_config(&config)
        .with_stop_timeout(stop_timeout)
        .with_env(options.env, mode);

    service
        .start(start_timeout)
        .with_context(|| format!("Failed to start '{}'", service.command()))?;

    println!("{}", service.url());
    eprintln!(
        "{} Service running (pid {}). Press Enter or close stdin to stop.",
        "✓".green(),
        service.pid().map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
    );

    wait_for_release()?;
    shut_down(&mut service, stop_timeout)
}

/// Returns on the first line or at end of input
fn wait_for_release() -> Result<()> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

fn shut_down(service: &mut ManagedProcess, stop_timeout: Duration) -> Result<()> {
    match service.stop(Some(stop_timeout)) {
        Ok(()) => {
            eprintln!("{} Service stopped", "✓".green());
            Ok(())
        }
        Err(e @ HarnessError::ProcessStopTimeout { .. }) => {
            eprintln!("{}", format!("⚠ {}, killing it", e).yellow());
            service.kill()?;
            eprintln!("{} Service killed", "✓".green());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
