//! ECMP with hotplugged VM ports.
//!
//! Two local VMs get their ports hotplugged through gnmi-cli and sit
//! behind the P4 bridge as VLANs on a TAP port. The remote host runs
//! standard OVS with namespace "VMs" behind a VXLAN tunnel, reached over
//! weighted ECMP routes in both directions. The run checks underlay and
//! overlay reachability, then that traffic to the balanced destination
//! leaves through every configured send port.

use std::iter;
use std::thread;

use anyhow::{bail, ensure, Context};
use p4ovs_session::parser::{new_interfaces, LossExpectation};

use super::{shutdown_vms, Scenario, Testbed};
use crate::config::{strip_prefix_len, TestConfig, VxlanConfig};
use crate::gnmi::{self, GnmiParams};
use crate::p4c::{self, Artifacts};
use crate::results::TestResults;
use crate::topology::{self, Nexthop};
use crate::{ovs, traffic, vm};

/// Dummy tunnel endpoint device on the remote host.
pub const REMOTE_TEP: &str = "TEP1";

/// Counter compared before and after the load-balancing ping.
pub const BALANCE_COUNTER: &str = "out-unicast-pkts";

const OVERLAY_PING_COUNT: u32 = 4;

pub fn vlan_name(id: u16) -> String {
    format!("vlan{id}")
}

/// Weight-1 nexthops pairing each gateway with a device.
fn nexthops(gateways: &[String], devices: &[String]) -> Vec<Nexthop> {
    gateways
        .iter()
        .zip(devices)
        .map(|(via, dev)| Nexthop {
            via: strip_prefix_len(via).to_string(),
            dev: dev.clone(),
            weight: 1,
        })
        .collect()
}

pub struct EcmpHotplug {
    config: TestConfig,
    bed: Testbed,
    artifacts: Option<Artifacts>,
    launched: bool,
}

impl EcmpHotplug {
    pub const NAME: &'static str = "ecmp-hotplug";

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

    fn vxlan(&self) -> anyhow::Result<&VxlanConfig> {
        self.config
            .vxlan
            .as_ref()
            .context("ecmp-hotplug needs a vxlan section")
    }

    /// Hotplug ports into every VM and return the new interface of each.
    fn hotplug(&mut self, results: &mut TestResults) -> anyhow::Result<Vec<String>> {
        let cfg = &self.config;
        let bed = &mut self.bed;

        let mut before = Vec::with_capacity(bed.vms.len());
        for (id, console) in bed.vms.iter_mut() {
            before.push(vm::interfaces(console).with_context(|| format!("listing VM{id} interfaces"))?);
        }

        gnmi::set_and_verify(&mut bed.local, &gnmi::port_params(&cfg.ports))
            .context("configuring ports through gnmi-cli")?;
        results.pass("gnmi port configuration");
        gnmi::set_and_verify(&mut bed.local, &gnmi::hotplug_params(&cfg.ports))
            .context("hotplugging ports through gnmi-cli")?;
        results.pass("gnmi hotplug");

        let mut hotplugged = Vec::with_capacity(before.len());
        for (id, console) in bed.vms.iter_mut() {
            let after = vm::interfaces(console)?;
            let added = new_interfaces(&before[id], &after);
            let Some(iface) = added.first() else {
                bail!("hotplug add failed for VM{id}");
            };
            results.pass(format!("hotplugged {iface} into VM{id}"));
            hotplugged.push(iface.clone());
        }
        Ok(hotplugged)
    }

    fn configure_vms(&mut self, interfaces: &[String], results: &mut TestResults) -> anyhow::Result<()> {
        let cfg = &self.config;
        for ((id, console), (port, iface)) in self.bed.vms.iter_mut().zip(cfg.ports.iter().zip(interfaces)) {
            let ip = port
                .ip
                .as_deref()
                .with_context(|| format!("port {} has no ip", port.name))?;
            let mut commands = vec![
                format!("ip addr add {ip} dev {iface}"),
                format!("ip link set dev {iface} up"),
            ];
            if let Some(mac) = &port.mac {
                commands.push(format!("ip link set dev {iface} address {mac}"));
            }
            let failed = vm::run_batch(console, &commands)
                .iter()
                .filter(|o| !o.success)
                .count();
            results.expect(format!("configure VM{id}"), failed == 0, || {
                format!("{failed} of {} commands failed", commands.len())
            });
        }
        Ok(())
    }

    fn configure_local(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let vxlan = self.vxlan()?.clone();
        let cfg = &self.config;
        let local = &mut self.bed.local;
        let artifacts = self.artifacts.as_ref().context("P4 artifacts were not generated")?;

        let tap = cfg
            .tap_ports()
            .into_iter()
            .next()
            .context("no TAP port configured")?;
        topology::link_up(local, &tap)?;

        topology::link_add(local, &vxlan.tep_intf, "dummy")?;
        results.record(
            format!("address {} on {}", vxlan.local_tep, vxlan.tep_intf),
            topology::addr_add(local, &vxlan.tep_intf, &vxlan.local_tep),
        );
        for (port, ip) in cfg.ecmp.local_ports.iter().zip(&cfg.ecmp.local_ports_ip) {
            results.record(format!("address {ip} on {port}"), topology::addr_add(local, port, ip));
        }

        ovs::set_pipe(local, &cfg.switch, &artifacts.pb_bin_str(), &artifacts.p4_info_str())?;
        ovs::add_bridge(local, &cfg.bridge)?;
        topology::link_up(local, &cfg.bridge)?;
        ovs::add_vxlan_port(
            local,
            &cfg.bridge,
            &vxlan.name,
            strip_prefix_len(&vxlan.local_tep),
            strip_prefix_len(&vxlan.remote_tep),
            vxlan.dst_port,
        )?;
        results.pass("local bridge with vxlan port");

        for port in cfg.ports.iter().take(cfg.vms.len()) {
            let id = port
                .vlan
                .with_context(|| format!("port {} has no vlan", port.name))?;
            let vlan = vlan_name(id);
            topology::vlan_add(local, &tap, &vlan, id)?;
            ovs::add_port(local, &cfg.bridge, &vlan)?;
            topology::link_up(local, &vlan)?;
        }
        results.pass("vlan ports on bridge");

        for table in &cfg.tables {
            for entry in &table.match_actions {
                ovs::add_entry(local, &table.switch, &table.name, entry)?;
            }
            results.pass(format!("rules added: {}", table.description));
        }
        Ok(())
    }

    fn configure_remote(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let vxlan = self.vxlan()?.clone();
        let cfg = &self.config;
        let remote_cfg = cfg.remote.as_ref().context("ecmp-hotplug needs a remote host")?;
        let remote = self.bed.remote()?;

        ovs::add_bridge(remote, &cfg.bridge)?;
        topology::link_up(remote, &cfg.bridge)?;
        for ns in &cfg.namespaces {
            topology::create_namespace_vm(remote, ns)?;
            ovs::add_port(remote, &cfg.bridge, &ns.peer_name)?;
        }
        ovs::add_vxlan_port(
            remote,
            &cfg.bridge,
            &vxlan.name,
            strip_prefix_len(&vxlan.remote_tep),
            strip_prefix_len(&vxlan.local_tep),
            vxlan.dst_port,
        )?;

        topology::link_add(remote, REMOTE_TEP, "dummy")?;
        let ports = iter::once(REMOTE_TEP).chain(remote_cfg.ports.iter().map(String::as_str));
        let addrs = iter::once(vxlan.remote_tep.as_str()).chain(cfg.ecmp.remote_ports_ip.iter().map(String::as_str));
        for (port, addr) in ports.zip(addrs) {
            topology::link_up(remote, port)?;
            topology::addr_add(remote, port, addr)?;
        }

        topology::route_add_ecmp(
            remote,
            strip_prefix_len(&vxlan.local_tep),
            &nexthops(&cfg.ecmp.local_ports_ip, &remote_cfg.ports),
        )?;
        results.pass("remote host configuration");
        Ok(())
    }

    fn check_reachability(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let vxlan = self.vxlan()?.clone();
        let cfg = &self.config;
        let bed = &mut self.bed;
        let count = cfg.timing.ping_count;

        tracing::info!(settle = ?cfg.timing.settle, "waiting before traffic");
        thread::sleep(cfg.timing.settle);

        for addr in &cfg.ecmp.remote_ports_ip {
            let verdict = traffic::ping(&mut bed.local, strip_prefix_len(addr), count, LossExpectation::Partial);
            ensure!(verdict.passed, "underlay ping to {addr}: {verdict}");
        }
        results.pass("underlay ping");

        let remote_tep = strip_prefix_len(&vxlan.remote_tep);
        topology::route_add_ecmp(
            &mut bed.local,
            remote_tep,
            &nexthops(&cfg.ecmp.remote_ports_ip, &cfg.ecmp.local_ports),
        )?;
        let verdict = traffic::ping(&mut bed.local, remote_tep, count, LossExpectation::Partial);
        ensure!(verdict.passed, "ping to remote TEP {remote_tep}: {verdict}");
        results.pass("remote TEP reachable");

        for (id, console) in bed.vms.iter_mut() {
            let Some(vm) = cfg.vm(id) else { continue };
            for addr in &vm.remote_ips {
                let verdict = traffic::ping_after_warm_up(
                    console,
                    strip_prefix_len(addr),
                    OVERLAY_PING_COUNT,
                    LossExpectation::NoLoss,
                );
                ensure!(verdict.passed, "{} ping to {addr}: {verdict}", vm.name);
            }
            results.pass(format!("{} overlay ping", vm.name));
        }
        Ok(())
    }

    fn check_load_balancing(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let cfg = &self.config;
        let bed = &mut self.bed;
        let Some(dst) = cfg.traffic.balanced_destination.as_deref() else {
            tracing::info!("no balanced destination configured, skipping load-balancing check");
            return Ok(());
        };
        let packets = cfg.traffic.packets;
        let send_ports: Vec<GnmiParams> = cfg
            .traffic
            .send_ports
            .iter()
            .map(|&id| GnmiParams::from_map(&cfg.ports[id].gnmi))
            .collect();

        let before = send_ports
            .iter()
            .map(|p| gnmi::counters(&mut bed.local, p))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let verdict = traffic::ping_after_warm_up(bed.vms.console(0)?, dst, packets, LossExpectation::NoLoss);
        ensure!(verdict.passed, "ping to balanced destination {dst}: {verdict}");
        let after = send_ports
            .iter()
            .map(|p| gnmi::counters(&mut bed.local, p))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut total = 0i64;
        for (b, a) in before.iter().zip(&after) {
            let delta = a.delta(b)?;
            let sent = delta
                .get(BALANCE_COUNTER)
                .with_context(|| format!("{} reports no {BALANCE_COUNTER}", b.source()))?;
            results.expect(format!("{} forwards traffic", b.source()), sent > 0, || {
                format!("{BALANCE_COUNTER} did not increase")
            });
            total += sent;
        }
        results.expect("traffic load balanced", total >= i64::from(packets), || {
            format!("{packets} packets expected but {total} counted")
        });
        Ok(())
    }
}

impl Scenario for EcmpHotplug {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_up(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
        let cfg = &self.config;
        ensure!(cfg.vms.len() >= 2, "ecmp-hotplug needs two VMs, {} configured", cfg.vms.len());
        ensure!(cfg.ports.len() >= cfg.vms.len(), "every VM needs a port");
        ensure!(cfg.remote.is_some(), "ecmp-hotplug needs a remote host");
        self.vxlan()?;

        let version = vm::check_hotplug_support(&mut self.bed.local)?;
        results.pass(format!("qemu {version} supports hotplug"));

        self.artifacts = Some(p4c::generate(&mut self.bed.local, &cfg.p4)?);
        results.pass("P4 artifacts generated");

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
        let interfaces = self.hotplug(results)?;
        self.configure_vms(&interfaces, results)?;
        self.configure_local(results)?;
        self.configure_remote(results)?;
        self.check_reachability(results)?;
        self.check_load_balancing(results)
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
        for id in cfg.ports.iter().take(cfg.vms.len()).filter_map(|p| p.vlan) {
            let vlan = vlan_name(id);
            results.record(format!("delete {vlan}"), topology::link_del(&mut bed.local, &vlan));
        }
        if let Some(vxlan) = &cfg.vxlan {
            results.record(
                format!("delete {}", vxlan.tep_intf),
                topology::link_del(&mut bed.local, &vxlan.tep_intf),
            );
            let remote_tep = strip_prefix_len(&vxlan.remote_tep);
            results.record(
                format!("delete route to {remote_tep}"),
                topology::route_del(&mut bed.local, remote_tep),
            );
        }

        if let (Some(remote), Some(remote_cfg)) = (bed.remote.as_mut(), &cfg.remote) {
            for ns in &cfg.namespaces {
                results.record(format!("delete {}", ns.peer_name), topology::link_del(remote, &ns.peer_name));
                results.record(
                    format!("delete namespace {}", ns.name),
                    topology::delete_namespace_vm(remote, ns),
                );
            }
            results.record(
                format!("delete remote bridge {}", cfg.bridge),
                ovs::del_bridge(remote, &cfg.bridge),
            );
            results.record(format!("delete {REMOTE_TEP}"), topology::link_del(remote, REMOTE_TEP));
            if let Some(vxlan) = &cfg.vxlan {
                let local_tep = strip_prefix_len(&vxlan.local_tep);
                results.record(
                    format!("delete remote route to {local_tep}"),
                    topology::route_del(remote, local_tep),
                );
            }
            for (port, addr) in remote_cfg.ports.iter().zip(&cfg.ecmp.remote_ports_ip) {
                results.record(
                    format!("delete {addr} from {port}"),
                    topology::addr_del(remote, port, addr),
                );
            }
        }

        results.record(
            format!("delete bridge {}", cfg.bridge),
            ovs::del_bridge(&mut bed.local, &cfg.bridge),
        );
        if self.launched {
            shutdown_vms(bed, &cfg.vms, results);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nexthops_pair_gateways_with_devices() {
        let hops = nexthops(
            &["50.1.1.1/24".into(), "60.1.1.1/24".into()],
            &["ens1".into(), "ens2".into()],
        );
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[1].via, "60.1.1.1");
        assert_eq!(hops[1].dev, "ens2");
        assert!(hops.iter().all(|h| h.weight == 1));
    }
}
