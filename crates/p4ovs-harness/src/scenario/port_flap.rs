//! VM port flap under traffic.
//!
//! VM0 pings its peer while the peer-facing interface is taken down and
//! brought back up; the run passes once replies resume, the link carries
//! traffic again and the switch counters moved on every control port.

use std::thread;
use std::time::Duration;

use anyhow::{ensure, Context};
use p4ovs_session::flap::{PortFlapConfig, PortFlapDetector};
use p4ovs_session::parser::{LossExpectation, PortDump};
use p4ovs_session::retry::{NetperfRequest, RetryPolicy};
use p4ovs_session::CommandChannel;

use super::{shutdown_vms, Scenario, Testbed};
use crate::config::{strip_prefix_len, TestConfig};
use crate::p4c::{self, Artifacts};
use crate::results::TestResults;
use crate::{gnmi, ovs, traffic, vm};

/// Where OVS creates vhost-user sockets for the VM ports.
pub const VHOST_SOCKET_DIR: &str = "/tmp";

/// Longest the flap ping keeps printing after recovery.
const FLAP_DRAIN_TIMEOUT: Duration = Duration::from_secs(35);

pub struct PortFlap {
    config: TestConfig,
    bed: Testbed,
    artifacts: Option<Artifacts>,
    launched: bool,
}

impl PortFlap {
    pub const NAME: &'static str = "port-flap";

    pub fn new(config: TestConfig, bed: Testbed) -> Self {
        Self {
            config,
            bed,
            artifacts: None,
            launched: false,
        }
    }

    pub fn testbed(&mut self) -> &mut Testbed {
        &mut self.bed
    }

    fn flap_target(&self) -> anyhow::Result<(String, String)> {
        let peer = self
            .config
            .vm(0)
            .and_then(|vm| vm.remote_ips.first())
            .context("VM0 has no remote_ip to ping")?;
        let iface = self
            .config
            .ports
            .get(1)
            .and_then(|p| p.interface.clone())
            .context("port 1 has no interface to flap")?;
        Ok((strip_prefix_len(peer).to_string(), iface))
    }

    fn configure(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let cfg = &self.config;
        let bed = &mut self.bed;
        let artifacts = self.artifacts.as_ref().context("P4 artifacts were not generated")?;

        for ((id, console), port) in bed.vms.iter_mut().zip(&cfg.ports) {
            let (Some(iface), Some(ip)) = (&port.interface, &port.ip) else {
                continue;
            };
            let outcomes = vm::run_batch(
                console,
                &[
                    format!("ip addr add {ip} dev {iface}"),
                    format!("ip link set dev {iface} up"),
                ],
            );
            results.expect(format!("configure VM{id}"), outcomes.iter().all(|o| o.success), || {
                format!("addressing {iface} failed")
            });
        }

        ovs::add_control_ports(&mut bed.local, &cfg.bridge, &cfg.control_ports(), cfg.p4_device_id)?;
        ovs::set_pipe(&mut bed.local, &cfg.switch, &artifacts.pb_bin_str(), &artifacts.p4_info_str())?;
        for table in &cfg.tables {
            for entry in &table.match_actions {
                ovs::add_entry(&mut bed.local, &table.switch, &table.name, entry)?;
            }
            results.pass(format!("rules added: {}", table.description));
        }
        results.pass("bridge and pipeline configured");
        Ok(())
    }

    fn flap(&mut self, peer: &str, iface: &str, results: &mut TestResults) -> anyhow::Result<()> {
        let count = self.config.timing.ping_count;
        let console = self.bed.vms.console(0)?;

        let verdict = traffic::ping_after_warm_up(console, peer, count, LossExpectation::NoLoss);
        ensure!(verdict.passed, "ping to {peer} before flap: {verdict}");
        results.pass("traffic before flap");

        let mut detector = PortFlapDetector::new(PortFlapConfig::ping(peer, iface));
        let flapped = detector.run(console.session());
        tracing::info!(
            history = ?detector.history(),
            chunks = detector.chunks_read(),
            "port flap finished"
        );
        flapped.with_context(|| format!("flapping {iface} while pinging {peer}"))?;
        results.pass(format!("traffic recovered after flapping {iface}"));

        // The flap ping keeps running until its deadline.
        console
            .session()
            .read_result(FLAP_DRAIN_TIMEOUT)
            .with_context(|| format!("draining the flap ping on {}", console.name()))?;

        let verdict = traffic::ping_after_warm_up(console, peer, count, LossExpectation::NoLoss);
        results.expect("traffic after flap", verdict.passed, || verdict.to_string());
        Ok(())
    }

    fn netperf(&mut self, peer: &str, results: &mut TestResults) -> anyhow::Result<()> {
        let Some(np) = self.config.traffic.netperf.clone() else {
            return Ok(());
        };
        let server = self.bed.vms.console(1)?;
        traffic::check_netperf(server)?;
        traffic::start_netserver(server, None)?;

        let request = NetperfRequest::new(peer, np.kind, np.duration_secs).with_options(np.options);
        let policy = RetryPolicy::new(
            np.max_retries,
            Duration::from_secs(u64::from(np.duration_secs)) + self.config.timing.session_timeout,
        );
        let client = self.bed.vms.console(0)?;
        let row = traffic::netperf(client, &request, &policy)?;
        results.pass(format!(
            "{} {:.2} Mbit/s after {} attempt(s)",
            np.kind,
            row.value.throughput_mbps(),
            row.attempts
        ));
        Ok(())
    }

    fn check_counters(&mut self, before: &PortDump, results: &mut TestResults) -> anyhow::Result<()> {
        let cfg = &self.config;
        let after = ovs::dump_ports(&mut self.bed.local, &cfg.bridge, &cfg.control_ports())?;
        for (port, counters) in &after {
            let Some(earlier) = before.get(port) else {
                results.fail(format!("{port} counters"), "port missing from the first dump");
                continue;
            };
            let delta = counters.delta(earlier)?;
            let moved = delta.rx.get("pkts").unwrap_or(0) + delta.tx.get("pkts").unwrap_or(0);
            results.expect(format!("{port} carried traffic"), moved > 0, || {
                "packet counters did not move".into()
            });
        }
        Ok(())
    }
}

impl Scenario for PortFlap {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_up(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let cfg = &self.config;
        ensure!(cfg.vms.len() >= 2, "port-flap needs two VMs, {} configured", cfg.vms.len());
        self.flap_target()?;

        self.artifacts = Some(p4c::generate(&mut self.bed.local, &cfg.p4)?);
        results.pass("P4 artifacts generated");

        if self.bed.vms.is_empty() {
            let removed = vm::clear_vhost_sockets(&mut self.bed.local, VHOST_SOCKET_DIR)?;
            tracing::debug!(removed, "vhost-user sockets cleared");
        }
        gnmi::set_and_verify(&mut self.bed.local, &gnmi::port_params(&cfg.ports))
            .context("configuring ports through gnmi-cli")?;
        results.pass("gnmi port configuration");

        if self.bed.vms.is_empty() {
            self.launched = true;
            vm::launch_all(&mut self.bed.local, &cfg.vms, cfg.timing.settle)?;
            results.pass("VMs launched");
        }
        self.bed.attach_vms(&cfg.vms, cfg)?;
        results.pass("VM consoles connected");
        Ok(())
    }

    fn run(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let (peer, iface) = self.flap_target()?;
        self.configure(results)?;

        thread::sleep(self.config.timing.settle);
        let before = ovs::dump_ports(&mut self.bed.local, &self.config.bridge, &self.config.control_ports())?;

        self.flap(&peer, &iface, results)?;
        self.netperf(&peer, results)?;
        self.check_counters(&before, results)
    }

    fn tear_down(&mut self, results: &mut TestResults) {
        let cfg = &self.config;
        let bed = &mut self.bed;
        bed.vms.close_all();

        for table in &cfg.tables {
            for key in &table.del_actions {
                results.record(
                    format!("delete {} entry {key}", table.name),
                    ovs::del_entry(&mut bed.local, &table.switch, &table.name, key),
                );
            }
        }
        results.record(
            format!("delete bridge {}", cfg.bridge),
            ovs::del_bridge(&mut bed.local, &cfg.bridge),
        );
        if self.launched {
            shutdown_vms(bed, &cfg.vms, results);
            results.record(
                "clear vhost-user sockets",
                vm::clear_vhost_sockets(&mut bed.local, VHOST_SOCKET_DIR),
            );
        }
    }
}
