use std::time::Duration;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

/// Failures surfaced by channels, parsers and the retry engine.
///
/// None of these are coerced into a pass/fail boolean inside this crate;
/// the scenario layer decides what a failure means for the test verdict.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport-level failure during send or read.
    #[error("connection to {peer} lost: {reason}")]
    ConnectionLost { peer: String, reason: String },

    /// Text does not have the structure the parser expects.
    #[error("malformed output, expected {expected}: {line:?}")]
    MalformedOutput { expected: &'static str, line: String },

    /// A specific field is missing from otherwise readable output.
    #[error("no {field} found in output")]
    Unparsed { field: &'static str },

    /// Bounded retry used every attempt without an acceptable result.
    #[error("gave up after {attempts} attempts, last output: {last_output:?}")]
    RetryExhausted { attempts: u32, last_output: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Two counter snapshots cannot be compared.
    #[error("counter mismatch on {port}: {detail}")]
    CounterMismatch { port: String, detail: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn lost(peer: impl Into<String>, reason: impl ToString) -> Self {
        SessionError::ConnectionLost {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed(expected: &'static str, line: impl Into<String>) -> Self {
        SessionError::MalformedOutput {
            expected,
            line: line.into(),
        }
    }

    /// Whether the failure came from the transport rather than the content.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionLost { .. } | SessionError::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
