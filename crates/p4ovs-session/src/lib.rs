//! Interactive session core for the P4OVS test harness.
//!
//! Provides the pieces every test scenario leans on:
//! - **Command channels**: local shell, SSH and telnet transports behind one
//!   send/receive contract, plus a scripted double for tests
//! - **Output parsing**: packet loss, OVS port counters, netperf rows,
//!   ethtool and `ip` listings, all fail-closed
//! - **Retry/poll**: the bounded retry combinator and the port-flap
//!   line-scan state machine

pub mod channel;
pub mod error;
pub mod flap;
pub mod parser;
pub mod retry;

pub use channel::{CommandChannel, CommandResult, Credentials, Endpoint, Session, SessionConfig};
pub use error::{Result, SessionError};
