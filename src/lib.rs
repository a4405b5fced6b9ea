// Library interface for svcharness
// Supervises local service processes for integration tests

pub mod cli;
pub mod clock;
pub mod command;
pub mod config;
pub mod errors;
pub mod exit_guard;
pub mod group;
pub mod lifecycle;
pub mod pool;
pub mod ports;
pub mod process;
pub mod readiness;

pub use command::{EnvMode, ServiceCommand};
pub use config::HarnessConfig;
pub use errors::{HarnessError, Result};
pub use exit_guard::ExitGuard;
pub use group::ServiceGroup;
pub use lifecycle::{Lifecycle, Scoped};
pub use process::{ManagedProcess, OutputMode, ProcessState};
pub use readiness::{wait_for_port, ReadinessProbe};
