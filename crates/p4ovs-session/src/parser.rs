//! Fail-closed parsers for the text the test tools print.
//!
//! Every parser either returns a value it actually read or an explicit
//! error / `None`. Absence of a pattern is never read as a passing value:
//! no packet-loss line is not "0% loss", and a row with the wrong shape is
//! not a throughput sample.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SessionError};

/// Printed by `netperf -V` when netperf is installed.
pub const NETPERF_VERSION_MARKER: &str = "Netperf version";
/// Printed by `netserver` on a successful start.
pub const NETSERVER_STARTED_MARKER: &str = "Starting netserver";
/// Printed by a netperf client that cannot reach its netserver.
pub const NETSERVER_UNREACHABLE_MARKER: &str = "are you sure there is a netserver listening";

static PACKET_LOSS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)% packet loss").expect("packet loss regex"));

static PING_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\d+) packets transmitted, (\d+) (?:packets )?received,(?: \+\d+ \w+,)* (\d+(?:\.\d+)?)% packet loss",
    )
    .expect("ping summary regex")
});

// ── Ping ────────────────────────────────────────────────────────────

/// Packet-loss percentage from `ping` output, or `None` when no
/// `<N>% packet loss` appears.
///
/// Fractional percentages round up so a lossy run never reads as 0%.
pub fn parse_packet_loss(text: &str) -> Option<u8> {
    let caps = PACKET_LOSS.captures(text)?;
    percent(&caps[1])
}

fn percent(raw: &str) -> Option<u8> {
    let value: f64 = raw.parse().ok()?;
    if !(0.0..=100.0).contains(&value) {
        return None;
    }
    Some(value.ceil() as u8)
}

/// The `ping` statistics line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSummary {
    pub transmitted: u32,
    pub received: u32,
    pub loss_percent: u8,
}

/// Parse `<t> packets transmitted, <r> received, <N>% packet loss`.
pub fn parse_ping_summary(text: &str) -> Result<PingSummary> {
    let caps = PING_SUMMARY.captures(text).ok_or(SessionError::Unparsed {
        field: "ping summary",
    })?;
    let number = |idx: usize| -> Result<u32> {
        caps[idx]
            .parse()
            .map_err(|_| SessionError::malformed("packet count", &caps[0]))
    };
    Ok(PingSummary {
        transmitted: number(1)?,
        received: number(2)?,
        loss_percent: percent(&caps[3])
            .ok_or_else(|| SessionError::malformed("loss percentage 0..100", &caps[0]))?,
    })
}

/// What a ping step expects to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossExpectation {
    /// Every packet answered.
    NoLoss,
    /// At least one packet answered.
    Partial,
    /// Nothing answered.
    Total,
}

/// Outcome of checking ping output against a [`LossExpectation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossVerdict {
    pub expectation: LossExpectation,
    pub loss_percent: Option<u8>,
    pub passed: bool,
}

impl fmt::Display for LossVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        match self.loss_percent {
            Some(loss) => write!(f, "{verdict}: {loss}% loss, expected {:?}", self.expectation),
            None => write!(f, "{verdict}: no packet-loss line, expected {:?}", self.expectation),
        }
    }
}

impl LossExpectation {
    pub fn is_met(self, loss_percent: Option<u8>) -> bool {
        match (self, loss_percent) {
            (_, None) => false,
            (LossExpectation::NoLoss, Some(loss)) => loss == 0,
            (LossExpectation::Partial, Some(loss)) => loss < 100,
            (LossExpectation::Total, Some(loss)) => loss == 100,
        }
    }

    /// Check ping output. For `NoLoss` the summary must also show all
    /// `count` packets received.
    pub fn check(self, text: &str, count: u32) -> LossVerdict {
        let loss_percent = parse_packet_loss(text);
        let mut passed = self.is_met(loss_percent);
        if passed && self == LossExpectation::NoLoss {
            passed = matches!(
                parse_ping_summary(text),
                Ok(summary) if summary.received == count && summary.loss_percent == 0
            );
        }
        LossVerdict {
            expectation: self,
            loss_percent,
            passed,
        }
    }
}

// ── Counters ────────────────────────────────────────────────────────

/// Counter name → value, tagged with the port it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    source: String,
    values: BTreeMap<String, u64>,
}

/// Per-counter difference between two snapshots of the same port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    source: String,
    values: BTreeMap<String, i64>,
}

impl CounterSnapshot {
    pub fn new(source: impl Into<String>, values: BTreeMap<String, u64>) -> Self {
        Self {
            source: source.into(),
            values,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, u64> {
        &self.values
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// `self[k] - before[k]` for every counter. Both snapshots must come
    /// from the same port and carry the same counter names.
    pub fn delta(&self, before: &CounterSnapshot) -> Result<CounterDelta> {
        if self.source != before.source {
            return Err(SessionError::CounterMismatch {
                port: self.source.clone(),
                detail: format!("compared against {}", before.source),
            });
        }
        if self.values.len() != before.values.len()
            || self.values.keys().any(|k| !before.values.contains_key(k))
        {
            let ours: HashSet<_> = self.values.keys().collect();
            let theirs: HashSet<_> = before.values.keys().collect();
            let mut differing: Vec<_> = ours.symmetric_difference(&theirs).collect();
            differing.sort();
            return Err(SessionError::CounterMismatch {
                port: self.source.clone(),
                detail: format!("counter sets differ on {differing:?}"),
            });
        }
        let values = self
            .values
            .iter()
            .map(|(name, &after)| {
                let before = before.values[name];
                let change = i64::try_from(i128::from(after) - i128::from(before)).map_err(|_| {
                    SessionError::CounterMismatch {
                        port: self.source.clone(),
                        detail: format!("{name} moved from {before} to {after}, out of range"),
                    }
                })?;
                Ok((name.clone(), change))
            })
            .collect::<Result<_>>()?;
        Ok(CounterDelta {
            source: self.source.clone(),
            values,
        })
    }
}

impl CounterDelta {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, i64> {
        &self.values
    }
}

/// Receive and transmit counters of one OVS port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCounters {
    pub rx: CounterSnapshot,
    pub tx: CounterSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDelta {
    pub rx: CounterDelta,
    pub tx: CounterDelta,
}

impl PortCounters {
    pub fn delta(&self, before: &PortCounters) -> Result<PortDelta> {
        Ok(PortDelta {
            rx: self.rx.delta(&before.rx)?,
            tx: self.tx.delta(&before.tx)?,
        })
    }
}

/// Port name → counters, as read from one `ovs-ofctl dump-ports`.
pub type PortDump = BTreeMap<String, PortCounters>;

/// Parse `ovs-ofctl dump-ports` output.
///
/// ```text
/// OFPST_PORT reply (xid=0x2): 2 ports
///   port LOCAL: rx pkts=22, bytes=1860, drop=0, errs=0, frame=0, over=0, crc=0
///            tx pkts=8, bytes=656, drop=0, errs=0, coll=0
///   port  1: rx pkts=0, bytes=0, drop=0, errs=0, frame=0, over=0, crc=0
///            tx pkts=14, bytes=1204, drop=0, errs=0, coll=0
/// ```
///
/// Port id `N` maps to `port_names[N - 1]`. The `LOCAL` port, the reply
/// header and `duration=` lines are skipped; counters OVS reports as `?`
/// are unavailable and left out.
pub fn parse_counter_dump<S: AsRef<str>>(text: &str, port_names: &[S]) -> Result<PortDump> {
    let mut dump = PortDump::new();
    let mut pending: Option<(String, CounterSnapshot)> = None;
    let mut in_local = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.contains("OFPST_PORT reply") || line.starts_with("duration=") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("port ") {
            if pending.is_some() {
                return Err(SessionError::malformed("tx line before next port", line));
            }
            let (id, counters) = rest
                .split_once(':')
                .ok_or_else(|| SessionError::malformed("port <id>: rx ...", line))?;
            let id = id.trim();
            if id == "LOCAL" {
                in_local = true;
                continue;
            }
            in_local = false;
            let name = id
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| port_names.get(idx))
                .ok_or_else(|| SessionError::malformed("port id within the port name list", line))?
                .as_ref()
                .to_string();
            let counters = counters
                .trim()
                .strip_prefix("rx")
                .ok_or_else(|| SessionError::malformed("rx counters", line))?;
            let rx = CounterSnapshot::new(name.clone(), parse_counter_tokens(counters, line)?);
            pending = Some((name, rx));
        } else if let Some(counters) = line.strip_prefix("tx") {
            if in_local {
                in_local = false;
                continue;
            }
            let (name, rx) = pending
                .take()
                .ok_or_else(|| SessionError::malformed("port line before tx line", line))?;
            let tx = CounterSnapshot::new(name.clone(), parse_counter_tokens(counters, line)?);
            if dump.insert(name, PortCounters { rx, tx }).is_some() {
                return Err(SessionError::malformed("each port once", line));
            }
        } else {
            return Err(SessionError::malformed("port or tx counter line", line));
        }
    }

    if let Some((name, _)) = pending {
        return Err(SessionError::malformed("tx line", format!("port {name}")));
    }
    Ok(dump)
}

fn parse_counter_tokens(counters: &str, line: &str) -> Result<BTreeMap<String, u64>> {
    let mut values = BTreeMap::new();
    for token in counters.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| SessionError::malformed("key=value counter", line))?;
        if value == "?" {
            continue;
        }
        let value = value
            .parse()
            .map_err(|_| SessionError::malformed("integer counter value", line))?;
        values.insert(name.trim().to_string(), value);
    }
    if values.is_empty() {
        return Err(SessionError::malformed("at least one counter", line));
    }
    Ok(values)
}

/// Parse `name: value` lines (`ethtool -S`, gnmi-cli counter dumps) into a
/// snapshot. Lines whose value is not an integer are ignored.
pub fn parse_key_value_counters(text: &str, source: &str) -> Result<CounterSnapshot> {
    let values: BTreeMap<String, u64> = text
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let value = value.trim().parse().ok()?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value))
        })
        .collect();
    if values.is_empty() {
        return Err(SessionError::Unparsed { field: "counters" });
    }
    Ok(CounterSnapshot::new(source, values))
}

/// `Link detected:` from `ethtool <iface>`.
pub fn parse_link_detected(text: &str) -> Option<bool> {
    text.lines().find_map(|line| {
        let value = line.trim().strip_prefix("Link detected:")?.trim();
        match value {
            "yes" => Some(true),
            "no" => Some(false),
            _ => None,
        }
    })
}

// ── Throughput ──────────────────────────────────────────────────────

/// Netperf test kinds the suite runs and the shape of their result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    /// `socket-bytes elapsed-secs messages throughput`
    UdpStream,
    /// `recv-socket send-socket message-bytes elapsed-secs throughput`
    TcpStream,
}

impl TestKind {
    pub fn columns(self) -> usize {
        match self {
            TestKind::UdpStream => 4,
            TestKind::TcpStream => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::UdpStream => "UDP_STREAM",
            TestKind::TcpStream => "TCP_STREAM",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "UDP_STREAM" => Ok(TestKind::UdpStream),
            "TCP_STREAM" => Ok(TestKind::TcpStream),
            other => Err(format!("unsupported netperf test {other}")),
        }
    }
}

/// One netperf result row.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputRow {
    kind: TestKind,
    values: Vec<f64>,
}

impl ThroughputRow {
    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Throughput in 10^6 bits/sec, always the last column.
    pub fn throughput_mbps(&self) -> f64 {
        self.values[self.values.len() - 1]
    }

    pub fn elapsed_secs(&self) -> f64 {
        match self.kind {
            TestKind::UdpStream => self.values[1],
            TestKind::TcpStream => self.values[3],
        }
    }
}

/// Extract the result row from netperf output.
///
/// The last two non-blank lines are candidates, latest first; on
/// interactive transports the final line is usually the shell prompt. The
/// first candidate with exactly `kind.columns()` all-numeric fields is the
/// row; anything else is rejected.
pub fn parse_throughput_row(text: &str, kind: TestKind) -> Result<ThroughputRow> {
    let candidates: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .rev()
        .take(2)
        .collect();

    for line in &candidates {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != kind.columns() {
            continue;
        }
        let values: Option<Vec<f64>> = fields.iter().map(|f| f.parse::<f64>().ok()).collect();
        if let Some(values) = values.filter(|v| v.iter().all(|x| x.is_finite())) {
            return Ok(ThroughputRow { kind, values });
        }
    }

    Err(SessionError::malformed(
        match kind {
            TestKind::UdpStream => "4 numeric netperf columns",
            TestKind::TcpStream => "5 numeric netperf columns",
        },
        candidates.first().copied().unwrap_or_default(),
    ))
}

// ── Interface listings ──────────────────────────────────────────────

/// Interface names from `ip a | egrep "[0-9]*: " | cut -d ':' -f 2`.
///
/// Everything before the loopback entry (echoed command, banners) is
/// skipped, as are prompt lines; `veth0@if5` style names keep the part
/// before `@`.
pub fn parse_interface_names(text: &str) -> Result<Vec<String>> {
    let mut lines = text.lines().map(str::trim).skip_while(|l| *l != "lo");
    if lines.next().is_none() {
        return Err(SessionError::Unparsed {
            field: "loopback interface",
        });
    }
    let mut names = vec!["lo".to_string()];
    for line in lines {
        if line.is_empty()
            || line.contains(':')
            || line.contains(char::is_whitespace)
            || line.ends_with('#')
            || line.ends_with('$')
        {
            continue;
        }
        let name = line.split('@').next().unwrap_or(line);
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Names present in `after` but not in `before`, in `after` order.
pub fn new_interfaces(before: &[String], after: &[String]) -> Vec<String> {
    after
        .iter()
        .filter(|name| !before.contains(name))
        .cloned()
        .collect()
}
