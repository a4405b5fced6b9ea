/// Common test utilities for svcharness integration tests
///
/// Real services are played by the test binary itself: a test file declares
/// a `fake_service_entry` test that calls [`run_fake_service_if_requested`],
/// and [`fake_service`] re-executes the binary filtered to that one test with
/// the behaviour passed through the environment.
use std::env;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use svcharness::{EnvMode, ManagedProcess, OutputMode, ServiceCommand};

pub const ENTRY_TEST_NAME: &str = "fake_service_entry";
const BEHAVIOUR_VAR: &str = "SVCH_FAKE_SERVICE";
const DELAY_VAR: &str = "SVCH_FAKE_DELAY_MS";
const ENV_DUMP_VAR: &str = "SVCH_FAKE_ENV_DUMP";
pub const PORT_VAR: &str = "TEST_APP_PORT";

#[allow(dead_code)]
pub const START_TIMEOUT: Duration = Duration::from_secs(10);
#[allow(dead_code)]
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// What the fake service does once launched
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Listen on `TEST_APP_PORT` until interrupted
    Listen,
    /// Listen, but ignore SIGINT
    Unstoppable,
    /// Wait this long before listening
    SlowStart(Duration),
}

#[allow(dead_code)]
impl Behaviour {
    fn env(&self) -> Vec<(String, String)> {
        let mut vars = vec![(PORT_VAR.to_string(), "{port}".to_string())];
        match self {
            Behaviour::Listen => vars.push((BEHAVIOUR_VAR.to_string(), "listen".to_string())),
            Behaviour::Unstoppable => {
                vars.push((BEHAVIOUR_VAR.to_string(), "unstoppable".to_string()))
            }
            Behaviour::SlowStart(delay) => {
                vars.push((BEHAVIOUR_VAR.to_string(), "listen".to_string()));
                vars.push((DELAY_VAR.to_string(), delay.as_millis().to_string()));
            }
        }
        vars
    }
}

/// Command line that re-runs this test binary as a fake service
#[allow(dead_code)]
pub fn fake_service_tokens() -> Vec<String> {
    let exe = env::current_exe().expect("Failed to locate test executable");
    vec![
        exe.to_string_lossy().to_string(),
        "--exact".to_string(),
        ENTRY_TEST_NAME.to_string(),
        "--test-threads=1".to_string(),
        "-q".to_string(),
    ]
}

/// A not yet started service with the given behaviour
#[allow(dead_code)]
pub fn fake_service(behaviour: Behaviour) -> ManagedProcess {
    fake_service_with_env(behaviour, Vec::new(), EnvMode::Inherit)
}

/// Like [`fake_service`] with extra environment variables
#[allow(dead_code)]
pub fn fake_service_with_env(
    behaviour: Behaviour,
    extra: Vec<(String, String)>,
    mode: EnvMode,
) -> ManagedProcess {
    let mut vars = behaviour.env();
    vars.extend(extra);

    ManagedProcess::new(ServiceCommand::tokens(fake_service_tokens()), None)
        .expect("Failed to create service")
        .with_env(vars, mode)
        .with_output(OutputMode::Discard)
}

/// Environment variable that makes the fake service write its environment
/// to `path` before it starts listening
#[allow(dead_code)]
pub fn env_dump_var(path: &Path) -> (String, String) {
    (
        ENV_DUMP_VAR.to_string(),
        path.to_string_lossy().to_string(),
    )
}

/// Body of the `fake_service_entry` test; returns at once unless launched
/// by [`fake_service`]
pub fn run_fake_service_if_requested() {
    let Ok(behaviour) = env::var(BEHAVIOUR_VAR) else {
        return;
    };

    if let Some(path) = env::var_os(ENV_DUMP_VAR) {
        std::fs::write(path, env_dump()).expect("Failed to write environment dump");
    }

    if behaviour == "unstoppable" {
        ignore_interrupt();
    }

    if let Ok(delay) = env::var(DELAY_VAR) {
        let millis: u64 = delay.parse().expect("Invalid delay");
        std::thread::sleep(Duration::from_millis(millis));
    }

    let port: u16 = env::var(PORT_VAR)
        .expect("TEST_APP_PORT not set")
        .parse()
        .expect("Invalid TEST_APP_PORT");
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("Fake service failed to bind");

    for stream in listener.incoming() {
        drop(stream);
    }
}

/// `KEY=VALUE` lines with the raw bytes of every variable
#[cfg(unix)]
fn env_dump() -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;

    let mut dump = Vec::new();
    for (key, value) in env::vars_os() {
        dump.extend_from_slice(key.as_bytes());
        dump.push(b'=');
        dump.extend_from_slice(value.as_bytes());
        dump.push(b'\n');
    }
    dump
}

#[cfg(not(unix))]
fn env_dump() -> Vec<u8> {
    env::vars_os()
        .map(|(k, v)| format!("{}={}\n", k.to_string_lossy(), v.to_string_lossy()))
        .collect::<String>()
        .into_bytes()
}

/// Read back a dump written by the fake service
#[allow(dead_code)]
pub fn read_env_dump(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("Failed to read environment dump")
}

/// True if the dump holds exactly this `KEY=VALUE` line
#[allow(dead_code)]
pub fn dump_has_line(dump: &[u8], line: &[u8]) -> bool {
    dump.split(|b| *b == b'\n').any(|l| l == line)
}

/// True if the dump defines `key` at all
#[allow(dead_code)]
pub fn dump_has_key(dump: &[u8], key: &[u8]) -> bool {
    dump.split(|b| *b == b'\n')
        .any(|l| l.len() > key.len() && l.starts_with(key) && l[key.len()] == b'=')
}

#[cfg(unix)]
fn ignore_interrupt() {
    // SAFETY: installs the ignore disposition; no handler code runs
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_interrupt() {}

/// True if something accepts TCP connections on the local port
#[allow(dead_code)]
pub fn is_accepting(port: u16) -> bool {
    TcpStream::connect_timeout(&([127, 0, 0, 1], port).into(), Duration::from_secs(1)).is_ok()
}

/// Run svch in `dir`
#[allow(dead_code)]
pub fn svch(dir: &Path, args: &[&str]) -> CommandResult {
    let output = Command::new(env!("CARGO_BIN_EXE_svch"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute svch command");

    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        exit_code: output.status.code(),
    }
}

/// Result of running a command
#[allow(dead_code)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

#[allow(dead_code)]
impl CommandResult {
    /// Assert the command succeeded
    pub fn assert_success(&self) {
        if !self.success {
            panic!(
                "Command failed:\nstdout: {}\nstderr: {}\nexit code: {:?}",
                self.stdout, self.stderr, self.exit_code
            );
        }
    }

    /// Assert the command failed
    pub fn assert_failure(&self) {
        if self.success {
            panic!(
                "Command succeeded when it should have failed:\nstdout: {}\nstderr: {}",
                self.stdout, self.stderr
            );
        }
    }

    /// Assert stderr contains text
    pub fn assert_stderr_contains(&self, text: &str) {
        assert!(
            self.stderr.contains(text),
            "stderr does not contain '{}'\nstderr: {}",
            text,
            self.stderr
        );
    }
}
