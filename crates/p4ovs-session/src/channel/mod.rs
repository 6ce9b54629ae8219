//! Command channels: one send/receive contract over every transport.
//!
//! A channel carries one interactive conversation: a command is sent, its
//! output is read back, and the next command follows. Exclusive access is
//! expressed through `&mut self`, so a channel is never driven from two
//! places at once.
//!
//! Every transport echoes the sent command into its output stream. A remote
//! tty does this natively; process-backed channels emulate it so echo
//! markers can be watched for the same way everywhere.

mod process;
mod scripted;
mod telnet;

use std::fmt;
use std::time::Duration;

pub use process::{Launcher, ProcessChannel};
pub use scripted::{ScriptedChannel, StreamEvent};
pub use telnet::TelnetChannel;

use crate::error::Result;

/// Default per-operation timeout for sessions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shell prompt suffix that marks the end of a command on telnet consoles.
pub const DEFAULT_PROMPT: &str = "# ";

/// Uniform interactive command/response contract.
pub trait CommandChannel {
    /// Peer name used in logs and errors.
    fn peer(&self) -> &str;

    /// Issue a command. Never blocks past the session timeout.
    fn send(&mut self, command: &str) -> Result<()>;

    /// Text accumulated since the last read, up to the end of the current
    /// command or until `timeout` elapses.
    fn read_result(&mut self, timeout: Duration) -> Result<String>;

    /// Text up to and including `marker`. On timeout returns whatever
    /// arrived, possibly nothing.
    fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<String>;

    /// Whether the command(s) consumed by the last `read_result` completed
    /// successfully, as far as the transport can tell.
    fn last_command_succeeded(&self) -> bool;

    fn close(&mut self) -> Result<()>;

    /// Send a command and collect its result.
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        self.send(command)?;
        let output = self.read_result(timeout)?;
        Ok(CommandResult::new(
            command,
            output,
            self.last_command_succeeded(),
        ))
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Raw output of one command paired with its success flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    command: String,
    output: String,
    success: bool,
}

impl CommandResult {
    pub fn new(command: impl Into<String>, output: impl Into<String>, success: bool) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            success,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Output with the echoed command line removed.
    pub fn body(&self) -> &str {
        match self.output.split_once('\n') {
            Some((first, rest)) if first.trim_end().ends_with(self.command.trim()) => rest,
            _ => &self.output,
        }
    }
}

// ── Sessions ────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where a session's commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local,
    Ssh { host: String, port: u16 },
    Telnet { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local => write!(f, "localhost"),
            Endpoint::Ssh { host, port } => write!(f, "ssh://{host}:{port}"),
            Endpoint::Telnet { host, port } => write!(f, "telnet://{host}:{port}"),
        }
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub prompt: String,
}

impl SessionConfig {
    pub fn local() -> Self {
        Self {
            endpoint: Endpoint::Local,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            prompt: DEFAULT_PROMPT.into(),
        }
    }

    pub fn ssh(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: Endpoint::Ssh {
                host: host.into(),
                port: 22,
            },
            credentials: Some(credentials),
            ..Self::local()
        }
    }

    pub fn telnet(host: impl Into<String>, port: u16, credentials: Option<Credentials>) -> Self {
        Self {
            endpoint: Endpoint::Telnet {
                host: host.into(),
                port,
            },
            credentials,
            ..Self::local()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// An open connection: configuration plus the transport it owns.
///
/// Opened on demand and torn down explicitly with [`Session::close`] (or
/// on drop, best effort).
pub struct Session {
    config: SessionConfig,
    channel: Box<dyn CommandChannel + Send>,
}

impl Session {
    pub fn open(config: SessionConfig) -> Result<Self> {
        tracing::debug!(endpoint = %config.endpoint, "opening session");
        let channel: Box<dyn CommandChannel + Send> = match &config.endpoint {
            Endpoint::Local => Box::new(ProcessChannel::new(Launcher::Shell)),
            Endpoint::Ssh { host, port } => Box::new(ProcessChannel::new(Launcher::Ssh {
                host: host.clone(),
                port: *port,
                credentials: config.credentials.clone(),
                connect_timeout: config.timeout,
            })),
            Endpoint::Telnet { host, port } => Box::new(TelnetChannel::connect(
                host,
                *port,
                config.credentials.as_ref(),
                &config.prompt,
                config.timeout,
            )?),
        };
        Ok(Self { config, channel })
    }

    /// Wrap an already-built channel, e.g. a [`ScriptedChannel`].
    pub fn from_channel(config: SessionConfig, channel: Box<dyn CommandChannel + Send>) -> Self {
        Self { config, channel }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run a command with the session's own timeout.
    pub fn run(&mut self, command: &str) -> Result<CommandResult> {
        let timeout = self.config.timeout;
        self.channel.execute(command, timeout)
    }
}

impl CommandChannel for Session {
    fn peer(&self) -> &str {
        self.channel.peer()
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.channel.send(command)
    }

    fn read_result(&mut self, timeout: Duration) -> Result<String> {
        self.channel.read_result(timeout)
    }

    fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<String> {
        self.channel.read_until(marker, timeout)
    }

    fn last_command_succeeded(&self) -> bool {
        self.channel.last_command_succeeded()
    }

    fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        self.channel.execute(command, timeout)
    }

    fn close(&mut self) -> Result<()> {
        tracing::debug!(endpoint = %self.config.endpoint, "closing session");
        self.channel.close()
    }
}

/// Split `buf` after the first occurrence of `marker`, returning the head.
pub(crate) fn take_through(buf: &mut Vec<u8>, marker: &[u8]) -> Option<Vec<u8>> {
    if marker.is_empty() {
        return Some(std::mem::take(buf));
    }
    let pos = buf.windows(marker.len()).position(|w| w == marker)?;
    let rest = buf.split_off(pos + marker.len());
    Some(std::mem::replace(buf, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_through_keeps_remainder() {
        let mut buf = b"64 bytes time=1 ms\n64 bytes".to_vec();
        let head = take_through(&mut buf, b"ms").unwrap();
        assert_eq!(head, b"64 bytes time=1 ms");
        assert_eq!(buf, b"\n64 bytes");
        assert!(take_through(&mut buf, b"ms").is_none());
    }

    #[test]
    fn body_strips_echoed_command() {
        let res = CommandResult::new("netperf -V", "netperf -V\nNetperf version 2.7.0\n", true);
        assert_eq!(res.body(), "Netperf version 2.7.0\n");

        let res = CommandResult::new("ls", "no echo here\n", true);
        assert_eq!(res.body(), "no echo here\n");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("root", "secret");
        let shown = format!("{creds:?}");
        assert!(shown.contains("root"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn session_delegates_to_channel() {
        let channel = ScriptedChannel::new("vm0").respond("ip a\n1: lo\n");
        let mut session = Session::from_channel(SessionConfig::local(), Box::new(channel));
        let res = session.run("ip a").unwrap();
        assert!(res.success());
        assert_eq!(res.body(), "1: lo\n");
        assert_eq!(session.peer(), "vm0");
    }

    /// Channel whose own `execute` knows better than its transport flag.
    struct ExitCodeChannel;

    impl CommandChannel for ExitCodeChannel {
        fn peer(&self) -> &str {
            "console"
        }
        fn send(&mut self, _command: &str) -> Result<()> {
            Ok(())
        }
        fn read_result(&mut self, _timeout: Duration) -> Result<String> {
            Ok(String::new())
        }
        fn read_until(&mut self, _marker: &str, _timeout: Duration) -> Result<String> {
            Ok(String::new())
        }
        fn last_command_succeeded(&self) -> bool {
            true
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn execute(&mut self, command: &str, _timeout: Duration) -> Result<CommandResult> {
            Ok(CommandResult::new(command, "RTNETLINK answers: File exists\n", false))
        }
    }

    #[test]
    fn session_uses_channel_execute() {
        let mut session = Session::from_channel(SessionConfig::local(), Box::new(ExitCodeChannel));
        let res = session.execute("ip addr add 1.1.1.1/24 dev ens3", DEFAULT_TIMEOUT).unwrap();
        assert!(!res.success());
        assert!(!session.run("ip link set ens3 up").unwrap().success());
    }
}
