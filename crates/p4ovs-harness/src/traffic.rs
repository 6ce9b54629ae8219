//! Traffic generation and checks: ping with loss expectations, netperf
//! client and server.

use std::time::Duration;

use anyhow::{bail, Context};
use p4ovs_session::parser::{
    LossExpectation, LossVerdict, ThroughputRow, NETPERF_VERSION_MARKER, NETSERVER_STARTED_MARKER,
    NETSERVER_UNREACHABLE_MARKER,
};
use p4ovs_session::retry::{run_netperf, Attempted, NetperfRequest, RetryPolicy};

use crate::host::Host;

// ── Ping ────────────────────────────────────────────────────────────

pub fn ping_command(dst: &str, count: u32) -> String {
    format!("ping {dst} -c {count}")
}

fn measure(host: &mut Host, command: &str, count: u32, expect: LossExpectation) -> LossVerdict {
    let timeout = host.session().config().timeout + Duration::from_secs(u64::from(count));
    let outcome = host.exec_timeout(command, timeout);
    let verdict = expect.check(&outcome.payload, count);
    if verdict.passed {
        tracing::info!(host = %host.name(), %command, %verdict, "ping");
    } else {
        tracing::warn!(host = %host.name(), %command, %verdict, "ping");
    }
    verdict
}

/// Ping `dst` from `host` and check the loss against `expect`.
pub fn ping(host: &mut Host, dst: &str, count: u32, expect: LossExpectation) -> LossVerdict {
    measure(host, &ping_command(dst, count), count, expect)
}

/// Like [`ping`], preceded by one unchecked run so neighbour resolution
/// and flow learning do not count as loss.
pub fn ping_after_warm_up(host: &mut Host, dst: &str, count: u32, expect: LossExpectation) -> LossVerdict {
    let command = ping_command(dst, count);
    let timeout = host.session().config().timeout + Duration::from_secs(u64::from(count));
    let _ = host.exec_timeout(&command, timeout);
    measure(host, &command, count, expect)
}

/// Ping from inside network namespace `ns` on `host`.
pub fn namespace_ping(
    host: &mut Host,
    ns: &str,
    dst: &str,
    count: u32,
    expect: LossExpectation,
) -> LossVerdict {
    let command = format!("ip netns exec {ns} {}", ping_command(dst, count));
    measure(host, &command, count, expect)
}

// ── Netperf ─────────────────────────────────────────────────────────

fn netns_prefix(namespace: Option<&str>) -> String {
    namespace
        .map(|ns| format!("ip netns exec {ns} "))
        .unwrap_or_default()
}

/// Fail unless `netperf -V` reports a version.
pub fn check_netperf(host: &mut Host) -> anyhow::Result<()> {
    let outcome = host.exec("netperf -V");
    if !outcome.payload.contains(NETPERF_VERSION_MARKER) {
        bail!("netperf is not installed on {}", host.name());
    }
    tracing::info!(host = %host.name(), "netperf installed");
    Ok(())
}

/// Check netperf and kill any running netserver so it can be restarted.
pub fn host_check_netperf(host: &mut Host) -> anyhow::Result<()> {
    check_netperf(host)?;
    // pkill exits 1 when nothing matched.
    let _ = host.exec("pkill -9 netserver");
    Ok(())
}

/// Start a netserver, in `namespace` when given. Outside a namespace any
/// running netserver is killed first.
pub fn start_netserver(host: &mut Host, namespace: Option<&str>) -> anyhow::Result<()> {
    if namespace.is_none() {
        let _ = host.exec("pkill -9 netserver");
    }
    let outcome = host.exec(&format!("{}netserver", netns_prefix(namespace)));
    if !outcome.payload.contains(NETSERVER_STARTED_MARKER) {
        bail!(
            "netserver did not start on {}{}: {}",
            host.name(),
            namespace.map(|ns| format!(" in {ns}")).unwrap_or_default(),
            outcome.payload.trim()
        );
    }
    tracing::info!(host = %host.name(), namespace, "netserver running");
    Ok(())
}

/// Run a netperf client, retrying until it prints a complete result row.
pub fn netperf(
    host: &mut Host,
    request: &NetperfRequest,
    policy: &RetryPolicy,
) -> anyhow::Result<Attempted<ThroughputRow>> {
    let name = host.name().to_string();
    run_netperf(host.session(), request, policy)
        .with_context(|| format!("`{}` on {name}", request.command()))
}

/// Run a netperf client that must fail to reach its server.
pub fn netperf_expect_refused(host: &mut Host, request: &NetperfRequest, timeout: Duration) -> anyhow::Result<()> {
    let command = request.command();
    let outcome = host.exec_timeout(&command, timeout);
    if outcome.payload.contains(NETSERVER_UNREACHABLE_MARKER)
        || outcome.detail.contains(NETSERVER_UNREACHABLE_MARKER)
    {
        tracing::info!(host = %host.name(), %command, "netserver unreachable as expected");
        return Ok(());
    }
    bail!("`{command}` reached a netserver that should be unreachable");
}
