use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use std::time::Duration;
use svcharness::cli;

#[derive(Parser)]
#[command(name = "svch")]
#[command(about = "Start, probe and stop local services for integration tests", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait until a TCP port accepts connections
    WaitPort {
        /// Port to probe
        port: u16,
        /// Host to connect to (default: localhost or the config file's host)
        #[arg(long)]
        host: Option<String>,
        /// Seconds to wait before giving up
        #[arg(long, value_parser = cli::parse_seconds)]
        timeout: Option<Duration>,
    },
    /// Run a service until stdin is closed or a line is entered
    Run {
        /// Port for the service; a free one is picked when omitted
        #[arg(long)]
        port: Option<u16>,
        /// Extra environment variable, `{port}` is substituted in the value
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = cli::parse_env_pair)]
        env: Vec<(String, String)>,
        /// Give the service only the --env variables
        #[arg(long)]
        no_inherit_env: bool,
        /// Seconds to wait for the port to open
        #[arg(long, value_parser = cli::parse_seconds)]
        timeout: Option<Duration>,
        /// Seconds to wait for exit after the interrupt before killing
        #[arg(long, value_parser = cli::parse_seconds)]
        stop_timeout: Option<Duration>,
        /// Command and arguments; `{port}` is substituted in each one
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::WaitPort {
            port,
            host,
            timeout,
        } => cli::wait_port::run(port, host, timeout),
        Commands::Run {
            port,
            env,
            no_inherit_env,
            timeout,
            stop_timeout,
            command,
        } => cli::run::run(cli::run::RunOptions {
            command,
            port,
            env,
            inherit_env: !no_inherit_env,
            timeout,
            stop_timeout,
        }),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
