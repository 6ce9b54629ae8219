//! Linux networking on a [`Host`]: links, addresses, routes and the
//! namespace-backed "VMs" used on the remote traffic host.

use anyhow::{bail, Context};
use p4ovs_session::parser::parse_link_detected;

use crate::config::NamespaceConfig;
use crate::host::{Host, Outcome, StepFailed};

// ── Links and addresses ─────────────────────────────────────────────

pub fn link_up(host: &mut Host, dev: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip link set {dev} up")).map(drop)
}

pub fn link_down(host: &mut Host, dev: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip link set {dev} down")).map(drop)
}

/// `ip link add <name> type <kind>`, e.g. a `dummy` tunnel endpoint.
pub fn link_add(host: &mut Host, name: &str, kind: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip link add {name} type {kind}")).map(drop)
}

pub fn vlan_add(host: &mut Host, parent: &str, name: &str, id: u16) -> Result<(), StepFailed> {
    host.run(&format!("ip link add link {parent} name {name} type vlan id {id}"))
        .map(drop)
}

pub fn link_del(host: &mut Host, name: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip link del {name}")).map(drop)
}

pub fn addr_add(host: &mut Host, dev: &str, cidr: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip addr add {cidr} dev {dev}")).map(drop)
}

pub fn addr_del(host: &mut Host, dev: &str, cidr: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip addr del {cidr} dev {dev}")).map(drop)
}

/// One leg of a multipath route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nexthop {
    pub via: String,
    pub dev: String,
    pub weight: u32,
}

pub fn ecmp_route_command(dst: &str, nexthops: &[Nexthop]) -> String {
    let mut cmd = format!("ip route add {dst}");
    for nh in nexthops {
        cmd.push_str(&format!(" nexthop via {} dev {} weight {}", nh.via, nh.dev, nh.weight));
    }
    cmd
}

pub fn route_add_ecmp(host: &mut Host, dst: &str, nexthops: &[Nexthop]) -> Result<(), StepFailed> {
    host.run(&ecmp_route_command(dst, nexthops)).map(drop)
}

pub fn route_del(host: &mut Host, dst: &str) -> Result<(), StepFailed> {
    host.run(&format!("ip route del {dst}")).map(drop)
}

/// Interface name bound to a PCI device, from `/sys/class/net`.
pub fn port_name_from_pci_bdf(host: &mut Host, bdf: &str) -> Result<String, StepFailed> {
    let listing = host.run(&format!("ls -la /sys/class/net/ | grep -i {bdf}"))?;
    listing
        .lines()
        .find(|l| l.to_ascii_lowercase().contains(&bdf.to_ascii_lowercase()))
        .and_then(|l| l.split_whitespace().nth(8))
        .map(str::to_string)
        .ok_or_else(|| StepFailed {
            host: host.name().to_string(),
            what: format!("look up port for {bdf}"),
            detail: "no matching /sys/class/net entry".into(),
        })
}

/// `Link detected:` of `iface` according to ethtool.
pub fn link_detected(host: &mut Host, iface: &str) -> anyhow::Result<bool> {
    let output = host.run(&format!("ethtool {iface}"))?;
    parse_link_detected(&output).with_context(|| format!("no link state for {iface} in ethtool output"))
}

/// Fail on the first interface without a link.
pub fn require_links<S: AsRef<str>>(host: &mut Host, ifaces: &[S]) -> anyhow::Result<()> {
    for iface in ifaces {
        let iface = iface.as_ref();
        if !link_detected(host, iface)? {
            bail!("no link detected on {iface}");
        }
        tracing::debug!(%iface, "link detected");
    }
    Ok(())
}

// ── Namespaces ──────────────────────────────────────────────────────

/// A network namespace on some host, managed through `ip netns`.
///
/// Not deleted on drop; teardown calls [`Namespace::delete`] explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    /// Create the namespace (replacing a stale one) and bring up loopback.
    pub fn create(host: &mut Host, name: &str) -> Result<Self, StepFailed> {
        let _ = host.exec(&format!("ip netns del {name}"));
        host.run(&format!("ip netns add {name}"))?;
        let ns = Self {
            name: name.to_string(),
        };
        let _ = ns.exec(host, "ip link set lo up");
        Ok(ns)
    }

    pub fn exec(&self, host: &mut Host, command: &str) -> Outcome {
        host.exec(&format!("ip netns exec {} {command}", self.name))
    }

    pub fn run(&self, host: &mut Host, command: &str) -> Result<String, StepFailed> {
        host.run(&format!("ip netns exec {} {command}", self.name))
    }

    /// Create a veth pair and move `inner` into this namespace; `outer`
    /// stays on the host.
    pub fn add_veth(&self, host: &mut Host, inner: &str, outer: &str) -> Result<(), StepFailed> {
        let _ = host.exec(&format!("ip link del {outer}"));
        host.run(&format!("ip link add {inner} type veth peer name {outer}"))?;
        host.run(&format!("ip link set {inner} netns {}", self.name))?;
        Ok(())
    }

    pub fn delete(self, host: &mut Host) -> Result<(), StepFailed> {
        host.run(&format!("ip netns del {}", self.name)).map(drop)
    }
}

/// Build a namespace "VM": namespace, veth pair, in-namespace setup
/// commands, host side up.
pub fn create_namespace_vm(host: &mut Host, cfg: &NamespaceConfig) -> Result<Namespace, StepFailed> {
    tracing::info!(host = %host.name(), namespace = %cfg.name, "creating namespace");
    let ns = Namespace::create(host, &cfg.name)?;
    ns.add_veth(host, &cfg.veth_if, &cfg.peer_name)?;
    for command in &cfg.commands {
        ns.run(host, command)?;
    }
    link_up(host, &cfg.peer_name)?;
    Ok(ns)
}

pub fn delete_namespace_vm(host: &mut Host, cfg: &NamespaceConfig) -> Result<(), StepFailed> {
    Namespace {
        name: cfg.name.clone(),
    }
    .delete(host)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use p4ovs_session::channel::ScriptedChannel;

    use super::*;
    use crate::host::testing::scripted;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn ecmp_route_lists_every_nexthop() {
        let nexthops = [
            Nexthop {
                via: "50.1.1.1".into(),
                dev: "ens1".into(),
                weight: 1,
            },
            Nexthop {
                via: "60.1.1.1".into(),
                dev: "ens2".into(),
                weight: 2,
            },
        ];
        assert_eq!(
            ecmp_route_command("40.1.1.1", &nexthops),
            "ip route add 40.1.1.1 nexthop via 50.1.1.1 dev ens1 weight 1 nexthop via 60.1.1.1 dev ens2 weight 2"
        );
    }

    #[test]
    fn namespace_vm_command_sequence() {
        let ch = ScriptedChannel::new("remote");
        let ch = (0..8).fold(ch, |ch, _| ch.respond(""));
        let mut host = scripted(ch);
        let cfg = NamespaceConfig {
            name: "VM2".into(),
            veth_if: "veth0".into(),
            peer_name: "veth_host_vm2".into(),
            commands: vec!["ip addr add 99.0.0.3/24 dev veth0".into()],
        };

        let ns = create_namespace_vm(&mut host, &cfg).unwrap();
        assert_eq!(ns.name, "VM2");
        assert_eq!(
            host.history(),
            [
                "ip netns del VM2",
                "ip netns add VM2",
                "ip netns exec VM2 ip link set lo up",
                "ip link del veth_host_vm2",
                "ip link add veth0 type veth peer name veth_host_vm2",
                "ip link set veth0 netns VM2",
                "ip netns exec VM2 ip addr add 99.0.0.3/24 dev veth0",
                "ip link set veth_host_vm2 up",
            ]
        );
    }

    #[test]
    fn pci_bdf_lookup() {
        let listing = "lrwxrwxrwx 1 root root 0 Oct  1 10:00 ens801f0 -> ../../devices/pci0000:ae/0000:af:00.0/net/ens801f0\n";
        let mut host = scripted(ScriptedChannel::new("h").respond(listing).respond(""));
        assert_eq!(port_name_from_pci_bdf(&mut host, "0000:AF:00.0").unwrap(), "ens801f0");
        assert!(port_name_from_pci_bdf(&mut host, "0000:af:00.1").is_err());
    }

    #[test]
    fn ethtool_link_state() {
        let mut host = scripted(
            ScriptedChannel::new("h")
                .respond("Settings for ens4:\n\tSpeed: 10000Mb/s\n\tLink detected: yes\n")
                .respond("Settings for ens5:\n\tLink detected: no\n")
                .respond("Settings for ens4:\n\tLink detected: yes\n")
                .respond("Settings for ens6:\n\tSpeed: Unknown!\n"),
        );
        assert!(link_detected(&mut host, "ens4").unwrap());
        assert!(!link_detected(&mut host, "ens5").unwrap());
        assert!(require_links(&mut host, &["ens4", "ens6"]).is_err());
    }

    #[test]
    fn namespace_veth_ping() {
        if !check_privileges() {
            eprintln!("Skipping test, unsufficient privileges or missing tools");
            return;
        }

        let mut host = Host::local(Duration::from_secs(10)).expect("local host");
        let inner = unique_ns_name("p4a");
        let cfg = NamespaceConfig {
            name: unique_ns_name("p4t"),
            veth_if: inner.clone(),
            peer_name: unique_ns_name("p4b"),
            commands: vec![
                format!("ip addr add 10.201.1.2/24 dev {inner}"),
                format!("ip link set dev {inner} up"),
            ],
        };

        let ns = create_namespace_vm(&mut host, &cfg).expect("create namespace vm");
        addr_add(&mut host, &cfg.peer_name, "10.201.1.1/24").expect("host address");
        let out = ns.exec(&mut host, "ping -c 1 -W 1 10.201.1.1");
        let _ = link_del(&mut host, &cfg.peer_name);
        ns.delete(&mut host).expect("delete namespace");

        assert!(out.success, "ping failed: {}", out.detail);
    }
}
