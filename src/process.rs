//! A single supervised service process.
//!
//! [`ManagedProcess`] resolves its port, command and environment up front,
//! then moves through `Created → Starting → Running → Stopped`. A started
//! process is registered with an [`ExitGuard`] until it is stopped, and
//! dropping a still-running instance stops it as well, so a failing test
//! cannot leave an orphan listener behind.

use crate::clock::{Clock, SystemClock};
use crate::command::{EnvMode, ServiceCommand, ServiceEnv};
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, Result};
use crate::exit_guard::{ExitGuard, GuardKey};
use crate::lifecycle::Lifecycle;
use crate::ports::allocate_port;
use crate::readiness::{ReadinessProbe, DEFAULT_HOST};
use std::fmt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Starting,
    Running,
    Stopped,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "created",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the service's stdout and stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Inherit,
    Discard,
}

impl OutputMode {
    fn stdio(&self) -> Stdio {
        match self {
            OutputMode::Inherit => Stdio::inherit(),
            OutputMode::Discard => Stdio::null(),
        }
    }
}

type ChildSlot = Arc<Mutex<Option<Child>>>;

/// Manages one service process listening on a local port
pub struct ManagedProcess {
    command: ServiceCommand,
    port: u16,
    url: String,
    env: ServiceEnv,
    output: OutputMode,
    state: ProcessState,
    child: ChildSlot,
    exit_guard: Arc<ExitGuard>,
    guard_key: Option<GuardKey>,
    probe: ReadinessProbe,
    clock: Arc<dyn Clock>,
    stop_timeout: Duration,
}

impl ManagedProcess {
    /// Create a service without starting it.
    ///
    /// Without a `port` a free one is allocated. Token commands get `{port}`
    /// substituted now; literal commands are kept verbatim. The service
    /// inherits the supervisor's environment until [`with_env`] says
    /// otherwise.
    ///
    /// [`with_env`]: ManagedProcess::with_env
    pub fn new(command: impl Into<ServiceCommand>, port: Option<u16>) -> Result<Self> {
        let port = match port {
            Some(port) => port,
            None => allocate_port()?,
        };

        let command: ServiceCommand = command.into();

        Ok(Self {
            command: command.resolve(port),
            port,
            url: base_url(DEFAULT_HOST, port),
            env: ServiceEnv::resolve(Vec::<(String, String)>::new(), EnvMode::Inherit, port),
            output: OutputMode::default(),
            state: ProcessState::Created,
            child: Arc::new(Mutex::new(None)),
            exit_guard: ExitGuard::global(),
            guard_key: None,
            probe: ReadinessProbe::new(),
            clock: Arc::new(SystemClock),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        })
    }

    /// Set the service environment; values may contain `{port}`
    pub fn with_env<I, K, V>(mut self, vars: I, mode: EnvMode) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        self.env = ServiceEnv::resolve(vars, mode, self.port);
        self
    }

    /// Apply host, poll interval and stop timeout defaults
    pub fn with_config(mut self, config: &HarnessConfig) -> Self {
        self.url = base_url(&config.host, self.port);
        // Taken, not moved: ManagedProcess implements Drop
        self.probe = std::mem::take(&mut self.probe)
            .with_host(config.host.clone())
            .with_poll_interval(config.poll_interval());
        self.stop_timeout = config.stop_timeout();
        self
    }

    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.url = base_url(probe.host(), self.port);
        self.probe = probe;
        self
    }

    pub fn with_exit_guard(mut self, exit_guard: Arc<ExitGuard>) -> Self {
        self.exit_guard = exit_guard;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Deadline used when the exit guard or `Drop` stops the process
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn command(&self) -> &ServiceCommand {
        &self.command
    }

    pub fn env(&self) -> &ServiceEnv {
        &self.env
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS process id while a child is held
    pub fn pid(&self) -> Option<u32> {
        lock_slot(&self.child).as_ref().map(Child::id)
    }

    /// Spawn the process and block until its port accepts connections.
    ///
    /// On any failure the spawned process is stopped (or killed, if it
    /// ignores the interrupt) before the original error is returned.
    pub fn start(&mut self, timeout: Duration) -> Result<()> {
        if self.state != ProcessState::Created {
            return Err(HarnessError::InvalidState {
                expected: ProcessState::Created.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = ProcessState::Starting;

        let child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command = %self.command, error = %e, "service didn't start");
                self.state = ProcessState::Stopped;
                return Err(e);
            }
        };
        tracing::debug!(command = %self.command, pid = child.id(), port = self.port, "spawned service");
        *lock_slot(&self.child) = Some(child);
        self.register_exit_cleanup();

        let slot = self.child.clone();
        let command = self.command.to_string();
        let ready = self
            .probe
            .wait_while(self.port, timeout, || ensure_still_running(&slot, &command));

        match ready {
            Ok(()) => {
                self.state = ProcessState::Running;
                tracing::debug!(command = %self.command, url = %self.url, "service is running");
                Ok(())
            }
            Err(e) => {
                tracing::error!(command = %self.command, port = self.port, error = %e, "service didn't start");
                if let Err(stop_err) = self.stop(Some(self.stop_timeout)) {
                    tracing::warn!(command = %self.command, error = %stop_err, "cleanup stop failed, killing");
                    if let Err(kill_err) = self.kill() {
                        tracing::warn!(command = %self.command, error = %kill_err, "cleanup kill failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Interrupt the process and wait for it to exit.
    ///
    /// `None` waits as long as it takes. If the deadline passes the process
    /// keeps running, stays registered with the exit guard, and
    /// [`HarnessError::ProcessStopTimeout`] is returned; escalate with
    /// [`ManagedProcess::kill`]. Stopping a process that was never started or
    /// is already stopped does nothing.
    pub fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        if matches!(self.state, ProcessState::Created | ProcessState::Stopped) {
            return Ok(());
        }

        if let Some(key) = self.guard_key.take() {
            self.exit_guard.unregister(key);
        }

        let slot = self.child.clone();
        let mut child_slot = lock_slot(&slot);
        let Some(child) = child_slot.as_mut() else {
            // Already reaped by the exit guard
            self.state = ProcessState::Stopped;
            return Ok(());
        };

        let command = self.command.to_string();
        match interrupt_and_wait(child, &command, timeout, self.clock.as_ref()) {
            Ok(status) => {
                tracing::debug!(command = %command, %status, "service stopped");
                *child_slot = None;
                drop(child_slot);
                self.state = ProcessState::Stopped;
                Ok(())
            }
            Err(e) => {
                drop(child_slot);
                self.register_exit_cleanup();
                Err(e)
            }
        }
    }

    /// Forcefully kill the process and reap it.
    ///
    /// This is the explicit escalation for services that ignore the
    /// interrupt sent by [`ManagedProcess::stop`].
    pub fn kill(&mut self) -> Result<()> {
        if let Some(key) = self.guard_key.take() {
            self.exit_guard.unregister(key);
        }

        let mut child_slot = lock_slot(&self.child);
        if let Some(child) = child_slot.as_mut() {
            match child.kill() {
                Ok(()) => {}
                // Already exited
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => {
                    drop(child_slot);
                    self.register_exit_cleanup();
                    return Err(e.into());
                }
            }
            let status = child.wait()?;
            tracing::debug!(command = %self.command, %status, "service killed");
            *child_slot = None;
        }
        drop(child_slot);

        if self.state != ProcessState::Created {
            self.state = ProcessState::Stopped;
        }
        Ok(())
    }

    fn spawn(&self) -> Result<Child> {
        let program = self.command.program().ok_or_else(|| HarnessError::Spawn {
            command: self.command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut command = Command::new(program);
        command
            .args(self.command.args())
            .env_clear()
            .envs(self.env.vars())
            .stdin(Stdio::null())
            .stdout(self.output.stdio())
            .stderr(self.output.stdio());

        command.spawn().map_err(|source| HarnessError::Spawn {
            command: self.command.to_string(),
            source,
        })
    }

    /// Let the exit guard stop this child if nobody else does
    fn register_exit_cleanup(&mut self) {
        if let Some(key) = self.guard_key.take() {
            self.exit_guard.unregister(key);
        }

        let slot = self.child.clone();
        let command = self.command.to_string();
        let clock = self.clock.clone();
        let stop_timeout = self.stop_timeout;

        let key = self.exit_guard.register(move || {
            let mut child_slot = lock_slot(&slot);
            if let Some(mut child) = child_slot.take() {
                tracing::warn!(command = %command, pid = child.id(), "stopping leftover service");
                if interrupt_and_wait(&mut child, &command, Some(stop_timeout), clock.as_ref()).is_err() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        });
        self.guard_key = Some(key);
    }
}

impl Lifecycle for ManagedProcess {
    fn start(&mut self, timeout: Duration) -> Result<()> {
        ManagedProcess::start(self, timeout)
    }

    fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        ManagedProcess::stop(self, timeout)
    }

    fn name(&self) -> String {
        format!("{} (port {})", self.command, self.port)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if lock_slot(&self.child).is_none() {
            if let Some(key) = self.guard_key.take() {
                self.exit_guard.unregister(key);
            }
            return;
        }

        tracing::warn!(command = %self.command, state = %self.state, "dropping live service, stopping it");
        if self.stop(Some(self.stop_timeout)).is_err() {
            if let Err(e) = self.kill() {
                tracing::warn!(command = %self.command, error = %e, "failed to kill service on drop");
            }
        }
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("command", &self.command)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

fn lock_slot(slot: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fail the readiness wait early if the child has already exited
fn ensure_still_running(slot: &Mutex<Option<Child>>, command: &str) -> Result<()> {
    let mut child_slot = lock_slot(slot);
    if let Some(child) = child_slot.as_mut() {
        if let Some(status) = child.try_wait()? {
            return Err(HarnessError::ExitedBeforeReady {
                command: command.to_string(),
                status: status.to_string(),
            });
        }
    }
    Ok(())
}

/// Send the interrupt unless the child already exited, then wait for it
fn interrupt_and_wait(
    child: &mut Child,
    command: &str,
    timeout: Option<Duration>,
    clock: &dyn Clock,
) -> Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    send_interrupt(child)?;

    match timeout {
        None => Ok(child.wait()?),
        Some(timeout) => match wait_with_timeout(child, timeout, clock)? {
            Some(status) => Ok(status),
            None => Err(HarnessError::ProcessStopTimeout {
                command: command.to_string(),
                pid: child.id(),
                timeout,
            }),
        },
    }
}

/// SIGINT, the same signal Ctrl-C delivers
#[cfg(unix)]
fn send_interrupt(child: &mut Child) -> Result<()> {
    let pid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions. The child has not
    // been reaped yet, so the pid still refers to it.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(HarnessError::Signal(format!(
            "Failed to interrupt process {}: {}",
            pid, err
        )));
    }
    Ok(())
}

/// No interrupt signal to send here, so terminate directly
#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(HarnessError::Signal(format!(
            "Failed to terminate process {}: {}",
            child.id(),
            e
        ))),
    }
}

/// Poll `try_wait` until the child exits or `timeout` passes
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    clock: &dyn Clock,
) -> Result<Option<ExitStatus>> {
    let start = clock.now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        if clock.now().duration_since(start) >= timeout {
            return Ok(None);
        }

        clock.sleep(EXIT_POLL_INTERVAL);
    }
}
