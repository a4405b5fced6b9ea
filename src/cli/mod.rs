pub mod run;
pub mod wait_port;

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber; `RUST_LOG` wins over `--verbose`
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse a `KEY=VALUE` pair from the command line
pub fn parse_env_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", raw))?;

    if key.is_empty() {
        return Err(anyhow!("environment variable name is empty in '{}'", raw));
    }

    Ok((key.to_string(), value.to_string()))
}

/// Seconds from the command line, fractional values allowed
pub fn parse_seconds(raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .parse()
        .with_context(|| format!("'{}' is not a number of seconds", raw))?;

    Duration::try_from_secs_f64(secs).with_context(|| format!("'{}' is not a valid timeout", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("TEST_APP_PORT={port}").unwrap(),
            ("TEST_APP_PORT".to_string(), "{port}".to_string())
        );
        // Only the first '=' separates
        assert_eq!(
            parse_env_pair("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_env_pair("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
    }

    #[test]
    fn test_parse_env_pair_rejects_malformed() {
        assert!(parse_env_pair("NO_EQUALS").is_err());
        assert!(parse_env_pair("=value").is_err());
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_seconds("0.25").unwrap(), Duration::from_millis(250));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }
}
