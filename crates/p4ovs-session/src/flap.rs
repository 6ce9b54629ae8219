//! Streaming port-flap detector.
//!
//! Watches a live traffic stream (normally `ping`) on one channel, takes a
//! port down once traffic is seen, brings it back up once the down command
//! shows up in the echoed stream, and succeeds when traffic resumes.
//!
//! ```text
//! WaitingTraffic --marker--> LinkDownIssued --down echo--> WaitingRecovery --marker--> Success
//!        \___________________________\______________________________\__________> Failure
//!                                timeout / read error / send error
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use crate::channel::CommandChannel;
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlapState {
    WaitingTraffic,
    LinkDownIssued,
    WaitingRecovery,
    Success,
    Failure,
}

impl FlapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlapState::Success | FlapState::Failure)
    }
}

impl fmt::Display for FlapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlapState::WaitingTraffic => "waiting-traffic",
            FlapState::LinkDownIssued => "link-down-issued",
            FlapState::WaitingRecovery => "waiting-recovery",
            FlapState::Success => "success",
            FlapState::Failure => "failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFlapConfig {
    /// Started before watching; `None` when traffic is already running.
    pub traffic_command: Option<String>,
    /// Text that proves traffic is flowing.
    pub traffic_marker: String,
    pub down_command: String,
    pub up_command: String,
    /// Each read returns text up to and including this.
    pub chunk_terminator: String,
    pub read_timeout: Duration,
    pub overall_timeout: Duration,
}

impl PortFlapConfig {
    /// Ping `remote_ip` for 30 seconds while flapping `interface`.
    pub fn ping(remote_ip: &str, interface: &str) -> Self {
        Self {
            traffic_command: Some(format!("ping -w 30 {remote_ip}")),
            traffic_marker: format!("64 bytes from {remote_ip}"),
            down_command: format!("ip link set {interface} down"),
            up_command: format!("ip link set {interface} up"),
            chunk_terminator: "ms".into(),
            read_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(45),
        }
    }
}

/// One run of the flap state machine. Use a fresh detector per run.
#[derive(Debug)]
pub struct PortFlapDetector {
    config: PortFlapConfig,
    state: FlapState,
    history: Vec<FlapState>,
    downs_sent: u32,
    ups_sent: u32,
    chunks_read: u32,
}

impl PortFlapDetector {
    pub fn new(config: PortFlapConfig) -> Self {
        Self {
            config,
            state: FlapState::WaitingTraffic,
            history: vec![FlapState::WaitingTraffic],
            downs_sent: 0,
            ups_sent: 0,
            chunks_read: 0,
        }
    }

    pub fn state(&self) -> FlapState {
        self.state
    }

    /// Every state entered so far, starting with `WaitingTraffic`.
    pub fn history(&self) -> &[FlapState] {
        &self.history
    }

    pub fn downs_sent(&self) -> u32 {
        self.downs_sent
    }

    pub fn ups_sent(&self) -> u32 {
        self.ups_sent
    }

    pub fn chunks_read(&self) -> u32 {
        self.chunks_read
    }

    /// Drive the flap to completion. `Ok` means traffic recovered; any
    /// error leaves the detector in [`FlapState::Failure`].
    pub fn run<C>(&mut self, channel: &mut C) -> Result<()>
    where
        C: CommandChannel + ?Sized,
    {
        if self.state.is_terminal() {
            return match self.state {
                FlapState::Success => Ok(()),
                _ => Err(SessionError::lost(channel.peer(), "flap detector already failed")),
            };
        }

        let started = Instant::now();
        let deadline = started + self.config.overall_timeout;

        if let Some(cmd) = self.config.traffic_command.clone() {
            tracing::info!(peer = %channel.peer(), command = %cmd, "starting traffic");
            self.send(channel, &cmd)?;
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(state = %self.state, elapsed = ?started.elapsed(), "port flap timed out");
                return self.fail(SessionError::Timeout(self.config.overall_timeout));
            }
            let wait = self.config.read_timeout.min(deadline - now);
            let chunk = match channel.read_until(&self.config.chunk_terminator, wait) {
                Ok(chunk) => chunk,
                Err(err) => return self.fail(err),
            };
            self.chunks_read += 1;
            if chunk.is_empty() {
                continue;
            }
            tracing::trace!(state = %self.state, %chunk, "stream chunk");

            match self.state {
                FlapState::WaitingTraffic if chunk.contains(&self.config.traffic_marker) => {
                    tracing::info!("traffic running, bringing port down");
                    let cmd = self.config.down_command.clone();
                    self.send(channel, &cmd)?;
                    self.downs_sent += 1;
                    self.enter(FlapState::LinkDownIssued);
                }
                FlapState::LinkDownIssued if chunk.contains(&self.config.down_command) => {
                    tracing::info!("port down, bringing port up");
                    let cmd = self.config.up_command.clone();
                    self.send(channel, &cmd)?;
                    self.ups_sent += 1;
                    self.enter(FlapState::WaitingRecovery);
                }
                FlapState::WaitingRecovery if chunk.contains(&self.config.traffic_marker) => {
                    tracing::info!(elapsed = ?started.elapsed(), "traffic recovered after port flap");
                    self.enter(FlapState::Success);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn send<C>(&mut self, channel: &mut C, command: &str) -> Result<()>
    where
        C: CommandChannel + ?Sized,
    {
        match channel.send(command) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(%command, error = %err, "port flap command failed");
                self.fail(err)
            }
        }
    }

    fn fail(&mut self, err: SessionError) -> Result<()> {
        self.enter(FlapState::Failure);
        Err(err)
    }

    fn enter(&mut self, state: FlapState) {
        tracing::debug!(from = %self.state, to = %state, "flap transition");
        self.state = state;
        self.history.push(state);
    }
}
