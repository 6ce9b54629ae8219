//! Command execution on the local or a remote host.
//!
//! Every collaborator call (`ip`, `ovs-vsctl`, `gnmi-cli`, `p4c`, ...) goes
//! through [`Host::exec`] and comes back as one [`Outcome`].

use std::time::Duration;

use p4ovs_session::{
    CommandChannel, CommandResult, Credentials, Session, SessionConfig, SessionError,
};
use thiserror::Error;

/// Result of one collaborator call: success flag, output, diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub payload: String,
    pub detail: String,
}

/// A collaborator call that did not succeed.
#[derive(Debug, Error)]
#[error("{what} on {host} failed: {detail}")]
pub struct StepFailed {
    pub host: String,
    pub what: String,
    pub detail: String,
}

impl Outcome {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: payload.into(),
            detail: String::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: String::new(),
            detail: detail.into(),
        }
    }

    fn from_command(result: &CommandResult) -> Self {
        let payload = result.body().to_string();
        if result.success() {
            Self::ok(payload)
        } else {
            let detail = format!("`{}` exited unsuccessfully: {}", result.command(), payload.trim());
            Self {
                success: false,
                payload,
                detail,
            }
        }
    }

    /// Turn a failed outcome into an error naming the step.
    pub fn check(self, host: &str, what: impl Into<String>) -> Result<String, StepFailed> {
        if self.success {
            Ok(self.payload)
        } else {
            Err(StepFailed {
                host: host.to_string(),
                what: what.into(),
                detail: self.detail,
            })
        }
    }
}

/// A machine the harness drives: the switch host itself, or the remote
/// traffic host over SSH.
pub struct Host {
    name: String,
    session: Session,
    history: Vec<String>,
}

impl Host {
    pub fn local(timeout: Duration) -> Result<Self, SessionError> {
        let session = Session::open(SessionConfig::local().with_timeout(timeout))?;
        Ok(Self::from_session("localhost", session))
    }

    pub fn remote(
        hostname: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let session = Session::open(SessionConfig::ssh(hostname, credentials).with_timeout(timeout))?;
        Ok(Self::from_session(hostname, session))
    }

    pub fn from_session(name: impl Into<String>, session: Session) -> Self {
        Self {
            name: name.into(),
            session,
            history: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commands executed so far, oldest first.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Direct access to the underlying session, e.g. for retry loops.
    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn exec(&mut self, command: &str) -> Outcome {
        let timeout = self.session.config().timeout;
        self.exec_timeout(command, timeout)
    }

    pub fn exec_timeout(&mut self, command: &str, timeout: Duration) -> Outcome {
        tracing::debug!(host = %self.name, %command, "exec");
        self.history.push(command.to_string());
        match self.session.execute(command, timeout) {
            Ok(result) => {
                let outcome = Outcome::from_command(&result);
                if !outcome.success {
                    tracing::debug!(host = %self.name, detail = %outcome.detail, "command failed");
                }
                outcome
            }
            Err(err) => {
                tracing::warn!(host = %self.name, %command, error = %err, "exec error");
                Outcome::failed(err.to_string())
            }
        }
    }

    /// Execute and fail unless the command succeeds.
    pub fn run(&mut self, command: &str) -> Result<String, StepFailed> {
        let name = self.name.clone();
        self.exec(command).check(&name, command)
    }

    pub fn close(&mut self) {
        if let Err(err) = self.session.close() {
            tracing::debug!(host = %self.name, error = %err, "closing host session");
        }
    }
}
