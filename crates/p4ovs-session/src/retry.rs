//! Bounded retry and polling.
//!
//! Every loop here has a fixed ceiling: an attempt count for
//! [`bounded_retry`], a deadline for [`poll`]. Nothing retries forever.

use std::thread;
use std::time::{Duration, Instant};

use crate::channel::CommandChannel;
use crate::error::{Result, SessionError};
use crate::parser::{parse_throughput_row, TestKind, ThroughputRow};

/// Retries allowed after the first attempt unless configured otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How often and how long to retry. Pure configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_retries,
            attempt_timeout,
        }
    }

    /// First attempt plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// A value together with the attempt (1-based) that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `run` until `accept` takes its output, at most
/// `policy.max_attempts()` times.
///
/// Errors from `run` are transport failures and propagate at once; so does
/// a transport error from `accept`. Any other rejection triggers another
/// attempt. When attempts run out the last output is kept in
/// [`SessionError::RetryExhausted`].
pub fn bounded_retry<T, R, A>(policy: &RetryPolicy, mut run: R, mut accept: A) -> Result<Attempted<T>>
where
    R: FnMut(u32) -> Result<String>,
    A: FnMut(&str) -> Result<T>,
{
    let max_attempts = policy.max_attempts();
    let mut last_output = String::new();

    for attempt in 1..=max_attempts {
        let output = run(attempt)?;
        match accept(&output) {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "accepted after retry");
                }
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if err.is_transport() => return Err(err),
            Err(err) => {
                tracing::warn!(attempt, max_attempts, error = %err, "attempt rejected");
                last_output = output;
            }
        }
    }

    Err(SessionError::RetryExhausted {
        attempts: max_attempts,
        last_output,
    })
}

/// Call `check` every `interval` until it yields a value or `timeout`
/// elapses. Errors from `check` propagate.
pub fn poll<T, P>(timeout: Duration, interval: Duration, mut check: P) -> Result<T>
where
    P: FnMut() -> Result<Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check()? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(SessionError::Timeout(timeout));
        }
        thread::sleep(interval.min(deadline - now));
    }
}

// ── Netperf ─────────────────────────────────────────────────────────

/// A netperf client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetperfRequest {
    pub host: String,
    pub kind: TestKind,
    pub duration_secs: u32,
    /// Test-specific options, e.g. `-- -m 64`.
    pub options: String,
    /// Run inside this network namespace.
    pub namespace: Option<String>,
}

impl NetperfRequest {
    pub fn new(host: impl Into<String>, kind: TestKind, duration_secs: u32) -> Self {
        Self {
            host: host.into(),
            kind,
            duration_secs,
            options: String::new(),
            namespace: None,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn command(&self) -> String {
        let mut cmd = format!(
            "netperf -H {} -l {} -t {}",
            self.host, self.duration_secs, self.kind
        );
        let options = self.options.trim();
        if !options.is_empty() {
            cmd.push(' ');
            cmd.push_str(options);
        }
        match &self.namespace {
            Some(ns) => format!("ip netns exec {ns} {cmd}"),
            None => cmd,
        }
    }
}

/// Run a netperf client until it prints a well-formed result row.
pub fn run_netperf<C>(
    channel: &mut C,
    request: &NetperfRequest,
    policy: &RetryPolicy,
) -> Result<Attempted<ThroughputRow>>
where
    C: CommandChannel + ?Sized,
{
    let command = request.command();
    let peer = channel.peer().to_string();
    let result = bounded_retry(
        policy,
        |attempt| {
            tracing::debug!(%peer, attempt, %command, "running netperf");
            Ok(channel
                .execute(&command, policy.attempt_timeout)?
                .output()
                .to_string())
        },
        |output| parse_throughput_row(output, request.kind),
    )?;
    tracing::info!(
        %peer,
        test = %request.kind,
        throughput_mbps = result.value.throughput_mbps(),
        attempts = result.attempts,
        "netperf completed"
    );
    Ok(result)
}
