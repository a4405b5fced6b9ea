// Command and environment templating for managed services
// `{port}` in argument tokens and environment values becomes the service port

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;

/// Placeholder replaced with the decimal port number
pub const PORT_PLACEHOLDER: &str = "{port}";

/// How a service process is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    /// A single program name, passed through verbatim and never templated
    Literal(String),
    /// Program followed by its arguments; every token is templated
    Tokens(Vec<String>),
}

impl ServiceCommand {
    pub fn literal(program: impl Into<String>) -> Self {
        ServiceCommand::Literal(program.into())
    }

    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ServiceCommand::Tokens(tokens.into_iter().map(Into::into).collect())
    }

    /// Substitute the port into every token. Literal commands are left alone.
    pub fn resolve(self, port: u16) -> Self {
        match self {
            ServiceCommand::Literal(program) => ServiceCommand::Literal(program),
            ServiceCommand::Tokens(tokens) => ServiceCommand::Tokens(
                tokens
                    .into_iter()
                    .map(|token| substitute_port(&token, port))
                    .collect(),
            ),
        }
    }

    /// Program to execute, if any
    pub fn program(&self) -> Option<&str> {
        match self {
            ServiceCommand::Literal(program) => Some(program.as_str()),
            ServiceCommand::Tokens(tokens) => tokens.first().map(String::as_str),
        }
    }

    /// Arguments passed after the program
    pub fn args(&self) -> &[String] {
        match self {
            ServiceCommand::Literal(_) => &[],
            ServiceCommand::Tokens(tokens) => tokens.get(1..).unwrap_or(&[]),
        }
    }
}

impl fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceCommand::Literal(program) => f.write_str(program),
            ServiceCommand::Tokens(tokens) => f.write_str(&tokens.join(" ")),
        }
    }
}

impl From<&str> for ServiceCommand {
    fn from(program: &str) -> Self {
        ServiceCommand::Literal(program.to_string())
    }
}

impl From<String> for ServiceCommand {
    fn from(program: String) -> Self {
        ServiceCommand::Literal(program)
    }
}

impl From<Vec<String>> for ServiceCommand {
    fn from(tokens: Vec<String>) -> Self {
        ServiceCommand::Tokens(tokens)
    }
}

impl From<Vec<&str>> for ServiceCommand {
    fn from(tokens: Vec<&str>) -> Self {
        ServiceCommand::tokens(tokens)
    }
}

impl<const N: usize> From<[&str; N]> for ServiceCommand {
    fn from(tokens: [&str; N]) -> Self {
        ServiceCommand::tokens(tokens)
    }
}

/// Whether the service sees the supervisor's environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvMode {
    /// Supervisor environment with the service variables added or overridden
    #[default]
    Inherit,
    /// Only the service variables
    ReplaceOnly,
}

/// Environment a service process is spawned with, already templated.
///
/// Inherited variables are kept as raw OS strings, so names and values that
/// are not valid UTF-8 reach the service unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEnv {
    vars: BTreeMap<OsString, OsString>,
    mode: EnvMode,
}

impl ServiceEnv {
    /// Template `overlay` with the port and merge it according to `mode`.
    ///
    /// For [`EnvMode::Inherit`] the supervisor's environment is captured now,
    /// so later changes to it are not seen by the service.
    pub fn resolve<I, K, V>(overlay: I, mode: EnvMode, port: u16) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let parent = match mode {
            EnvMode::Inherit => std::env::vars_os().collect(),
            EnvMode::ReplaceOnly => BTreeMap::new(),
        };
        Self::resolve_onto(parent, overlay, mode, port)
    }

    /// Same as [`ServiceEnv::resolve`] but with an explicit parent environment
    pub fn resolve_onto<I, K, V>(
        parent: BTreeMap<OsString, OsString>,
        overlay: I,
        mode: EnvMode,
        port: u16,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut vars = match mode {
            EnvMode::Inherit => parent,
            EnvMode::ReplaceOnly => BTreeMap::new(),
        };

        for (key, value) in overlay {
            let key: String = key.into();
            vars.insert(
                OsString::from(key),
                OsString::from(substitute_port(value.as_ref(), port)),
            );
        }

        Self { vars, mode }
    }

    pub fn mode(&self) -> EnvMode {
        self.mode
    }

    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub fn vars(&self) -> &BTreeMap<OsString, OsString> {
        &self.vars
    }
}

fn substitute_port(value: &str, port: u16) -> String {
    if value.contains(PORT_PLACEHOLDER) {
        value.replace(PORT_PLACEHOLDER, &port.to_string())
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_templated() {
        let command = ServiceCommand::tokens(["run", "--port", "{port}"]).resolve(12345);
        assert_eq!(command, ServiceCommand::tokens(["run", "--port", "12345"]));
        assert_eq!(command.program(), Some("run"));
        assert_eq!(command.args(), &["--port".to_string(), "12345".to_string()]);
    }

    #[test]
    fn test_placeholder_inside_token() {
        let command = ServiceCommand::tokens(["serve", "--bind=127.0.0.1:{port}"]).resolve(8080);
        assert_eq!(command.args(), &["--bind=127.0.0.1:8080".to_string()]);
    }

    #[test]
    fn test_literal_is_never_templated() {
        let command = ServiceCommand::literal("mb").resolve(12345);
        assert_eq!(command, ServiceCommand::Literal("mb".to_string()));

        let command = ServiceCommand::literal("serve --port {port}").resolve(12345);
        assert_eq!(command.to_string(), "serve --port {port}");
        assert!(command.args().is_empty());
    }

    #[test]
    fn test_empty_tokens_have_no_program() {
        let command = ServiceCommand::Tokens(Vec::new()).resolve(1);
        assert_eq!(command.program(), None);
        assert!(command.args().is_empty());
    }

    fn os_env(pairs: &[(&str, &str)]) -> BTreeMap<OsString, OsString> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(*k), OsString::from(*v)))
            .collect()
    }

    #[test]
    fn test_env_overlay_is_templated() {
        let env = ServiceEnv::resolve_onto(BTreeMap::new(), [("X", "{port}")], EnvMode::Inherit, 8080);
        assert_eq!(env.get("X"), Some(OsStr::new("8080")));
    }

    #[test]
    fn test_env_inherit_overrides_parent() {
        let parent = os_env(&[("something", "123"), ("bla", "bbb")]);
        let env = ServiceEnv::resolve_onto(parent, [("bla", "aaa")], EnvMode::Inherit, 1);

        assert_eq!(env.get("something"), Some(OsStr::new("123")));
        assert_eq!(env.get("bla"), Some(OsStr::new("aaa")));
        assert_eq!(env.vars().len(), 2);
    }

    #[test]
    fn test_env_replace_only_drops_parent() {
        let parent = os_env(&[("something", "123")]);
        let env = ServiceEnv::resolve_onto(parent, [("bla", "aaa")], EnvMode::ReplaceOnly, 1);

        assert_eq!(env.get("something"), None);
        assert_eq!(env.get("bla"), Some(OsStr::new("aaa")));
        assert_eq!(env.mode(), EnvMode::ReplaceOnly);
    }

    #[test]
    fn test_env_without_overlay_is_parent() {
        let parent = os_env(&[("asd", "qwe")]);
        let env = ServiceEnv::resolve_onto(
            parent.clone(),
            Vec::<(String, String)>::new(),
            EnvMode::Inherit,
            1,
        );
        assert_eq!(env.vars(), &parent);
    }

    #[cfg(unix)]
    #[test]
    fn test_env_inherit_keeps_non_utf8_parent_vars() {
        use std::os::unix::ffi::OsStrExt;

        let key = OsStr::from_bytes(b"LATIN1_\xe9").to_os_string();
        let value = OsStr::from_bytes(b"caf\xe9").to_os_string();
        let mut parent = os_env(&[("PLAIN", "ok")]);
        parent.insert(OsString::from("BYTES"), value.clone());
        parent.insert(key.clone(), OsString::from("x"));

        let env = ServiceEnv::resolve_onto(parent, [("TEST_APP_PORT", "{port}")], EnvMode::Inherit, 8080);

        assert_eq!(env.get("BYTES"), Some(value.as_os_str()));
        assert_eq!(env.get(&key), Some(OsStr::new("x")));
        assert_eq!(env.get("PLAIN"), Some(OsStr::new("ok")));
        assert_eq!(env.get("TEST_APP_PORT"), Some(OsStr::new("8080")));
    }
}
