use std::collections::VecDeque;
use std::time::Duration;

use super::CommandChannel;
use crate::error::{Result, SessionError};

/// One step of a scripted output stream read through `read_until`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text delivered by one read.
    Chunk(String),
    /// A read that times out with nothing to show.
    Silence,
    /// The transport drops.
    Drop,
}

#[derive(Debug, Clone)]
struct Response {
    text: String,
    success: bool,
}

/// Deterministic channel that replays canned output.
///
/// `read_result` consumes the queued responses in order and `read_until`
/// consumes the queued stream events, so tests can drive retry loops and
/// the port-flap detector without a real transport. Every sent command is
/// recorded. Running out of script is reported as a lost connection so an
/// over-eager caller shows up as a failure rather than a hang.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    peer: String,
    responses: VecDeque<Response>,
    stream: VecDeque<StreamEvent>,
    sent: Vec<String>,
    fail_sends_after: Option<usize>,
    last_ok: bool,
    closed: bool,
}

impl ScriptedChannel {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            last_ok: true,
            ..Default::default()
        }
    }

    /// Queue output for the next `read_result`.
    pub fn respond(mut self, text: impl Into<String>) -> Self {
        self.responses.push_back(Response {
            text: text.into(),
            success: true,
        });
        self
    }

    /// Queue output for a command that exits unsuccessfully.
    pub fn respond_failure(mut self, text: impl Into<String>) -> Self {
        self.responses.push_back(Response {
            text: text.into(),
            success: false,
        });
        self
    }

    pub fn chunk(mut self, text: impl Into<String>) -> Self {
        self.stream.push_back(StreamEvent::Chunk(text.into()));
        self
    }

    pub fn silence(mut self) -> Self {
        self.stream.push_back(StreamEvent::Silence);
        self
    }

    pub fn drop_connection(mut self) -> Self {
        self.stream.push_back(StreamEvent::Drop);
        self
    }

    /// Let the first `n` sends succeed and fail every later one.
    pub fn fail_sends_after(mut self, n: usize) -> Self {
        self.fail_sends_after = Some(n);
        self
    }

    /// Commands sent so far, in order.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn remaining_responses(&self) -> usize {
        self.responses.len()
    }

    fn exhausted(&self, what: &str) -> SessionError {
        SessionError::lost(&self.peer, format!("script exhausted ({what})"))
    }
}

impl CommandChannel for ScriptedChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn send(&mut self, command: &str) -> Result<()> {
        if self.closed {
            return Err(SessionError::lost(&self.peer, "channel closed"));
        }
        if let Some(limit) = self.fail_sends_after {
            if self.sent.len() >= limit {
                return Err(SessionError::lost(&self.peer, "send refused by script"));
            }
        }
        self.sent.push(command.to_string());
        Ok(())
    }

    fn read_result(&mut self, _timeout: Duration) -> Result<String> {
        let response = self
            .responses
            .pop_front()
            .ok_or_else(|| self.exhausted("responses"))?;
        self.last_ok = response.success;
        Ok(response.text)
    }

    fn read_until(&mut self, _marker: &str, _timeout: Duration) -> Result<String> {
        match self.stream.pop_front() {
            Some(StreamEvent::Chunk(text)) => Ok(text),
            Some(StreamEvent::Silence) => Ok(String::new()),
            Some(StreamEvent::Drop) => Err(SessionError::lost(&self.peer, "dropped by script")),
            None => Err(self.exhausted("stream")),
        }
    }

    fn last_command_succeeded(&self) -> bool {
        self.last_ok
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
