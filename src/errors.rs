use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Waited too long for port {port} on host {host} to start accepting connections ({timeout:?})")]
    ReadinessTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Process {pid} ('{command}') did not exit within {timeout:?} after being interrupted")]
    ProcessStopTimeout {
        command: String,
        pid: u32,
        timeout: Duration,
    },

    #[error("Not all services {operation} in time ({} still pending){}", .pending.len(), FailureList(.failures))]
    GroupTimeout {
        operation: GroupOperation,
        pending: Vec<usize>,
        failures: Vec<MemberFailure>,
    },

    #[error("{} of the services failed to {}{}", .failures.len(), .operation.verb(), FailureList(.failures))]
    GroupMemberFailures {
        operation: GroupOperation,
        failures: Vec<MemberFailure>,
    },

    #[error("Service panicked while being {operation}")]
    Panicked { operation: GroupOperation },

    #[error("Process '{command}' exited with {status} before its port accepted connections")]
    ExitedBeforeReady { command: String, status: String },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Port allocation error: {0}")]
    PortAllocation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// True for any of the deadline-driven errors.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HarnessError::ReadinessTimeout { .. }
                | HarnessError::ProcessStopTimeout { .. }
                | HarnessError::GroupTimeout { .. }
        )
    }
}

/// Which fan-out a group error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperation {
    Start,
    Stop,
}

impl GroupOperation {
    pub fn verb(&self) -> &'static str {
        match self {
            GroupOperation::Start => "start",
            GroupOperation::Stop => "stop",
        }
    }
}

impl fmt::Display for GroupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupOperation::Start => write!(f, "started"),
            GroupOperation::Stop => write!(f, "stopped"),
        }
    }
}

/// Error raised by a single member of a service group.
#[derive(Debug)]
pub struct MemberFailure {
    pub index: usize,
    pub name: String,
    pub error: HarnessError,
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.name, self.error)
    }
}

struct FailureList<'a>(&'a [MemberFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in self.0 {
            write!(f, "\n  {}", failure)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
