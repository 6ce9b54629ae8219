//! Test topology configuration.
//!
//! The suite's native format is JSON; TOML is accepted too. Files
//! deserialize into the lenient `*Input` structs, command-line overrides are
//! applied on top, and [`TestConfigInput::resolve`] validates everything
//! into an immutable [`TestConfig`] that scenarios borrow.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use p4ovs_session::parser::TestKind;
use p4ovs_session::Credentials;
use serde::Deserialize;

/// First serial console port; VM `i` listens on `6550 + i`.
pub const SERIAL_PORT_BASE: u16 = 6550;

// ── Input (as written in the file) ─────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestConfigInput {
    pub switch: String,
    pub bridge: String,
    pub p4file: String,
    pub p4_arch: Option<String>,
    pub artifacts_dir: Option<String>,
    pub p4_device_id: Option<u32>,
    pub pci_bdf: Option<String>,
    pub client_hostname: Option<String>,
    pub client_username: Option<String>,
    pub client_password: Option<String>,
    pub port: Vec<PortInput>,
    pub vm: Vec<VmInput>,
    pub vxlan: VxlanInput,
    pub ecmp: EcmpInput,
    pub remote_port: Vec<String>,
    pub net_namespace: Vec<NamespaceInput>,
    pub table: Vec<TableInput>,
    pub traffic: TrafficInput,
    pub timing: TimingInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortInput {
    pub name: String,
    #[serde(rename = "control-port")]
    pub control_port: Option<String>,
    pub interface: Option<String>,
    pub ip: Option<String>,
    pub mac_local: Option<String>,
    pub vlan: Option<String>,
    /// gnmi-cli `key:value` parameters creating the port.
    pub gnmi: BTreeMap<String, String>,
    /// gnmi-cli parameters hotplugging the port into a VM.
    pub hotplug: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmInput {
    pub vm_name: String,
    pub vm_image_location: String,
    pub vm_username: String,
    pub vm_password: String,
    pub remote_ip: Vec<String>,
    pub memory: Option<String>,
    pub vhost_socket: Option<String>,
    pub hotplug: Option<VmHotplugInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmHotplugInput {
    #[serde(rename = "qemu-socket-port")]
    pub qemu_socket_port: Option<u16>,
    #[serde(rename = "serial-telnet-port")]
    pub serial_telnet_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VxlanInput {
    pub tep_intf: String,
    pub tep_ip: Vec<String>,
    pub vxlan_name: Vec<String>,
    pub dst_port: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EcmpInput {
    pub local_ports: Vec<String>,
    pub local_ports_ip: Vec<String>,
    pub remote_ports_ip: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamespaceInput {
    pub name: String,
    pub veth_if: String,
    pub peer_name: String,
    pub cmds: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TableInput {
    pub description: String,
    pub switch: String,
    pub name: String,
    pub match_action: Vec<String>,
    pub del_action: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrafficInput {
    pub number_pkts: Vec<u32>,
    pub send_port: Vec<usize>,
    pub in_pkt_header: BTreeMap<String, String>,
    pub netperf: Option<NetperfInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetperfInput {
    pub test: String,
    pub duration_secs: Option<u32>,
    pub options: String,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingInput {
    pub session_timeout_secs: Option<u64>,
    pub settle_secs: Option<u64>,
    pub vm_boot_timeout_secs: Option<u64>,
    pub ping_count: Option<u32>,
}

/// Values given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub pci_bdf: Option<String>,
    pub vm_images: Vec<String>,
    pub vm_credentials: Option<Credentials>,
    pub client_credentials: Option<Credentials>,
    pub remote_ports: Vec<String>,
}

// ── Resolved ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P4Arch {
    /// `p4c --arch psa --target dpdk`
    Psa,
    /// `p4c-dpdk --arch pna`
    Pna,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P4Config {
    pub program: String,
    pub arch: P4Arch,
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub name: String,
    pub control_port: Option<String>,
    pub interface: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub vlan: Option<u16>,
    pub gnmi: BTreeMap<String, String>,
    pub hotplug: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmAttach {
    /// NICs arrive later through the qemu monitor.
    Hotplug { monitor_port: u16 },
    /// One virtio NIC backed by a vhost-user socket.
    VhostUser { socket: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub id: usize,
    pub name: String,
    pub image: String,
    pub credentials: Credentials,
    pub remote_ips: Vec<String>,
    pub memory: String,
    pub serial_port: u16,
    pub attach: VmAttach,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VxlanConfig {
    pub tep_intf: String,
    pub local_tep: String,
    pub remote_tep: String,
    pub name: String,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcmpConfig {
    pub local_ports: Vec<String>,
    pub local_ports_ip: Vec<String>,
    pub remote_ports_ip: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHostConfig {
    pub hostname: String,
    pub credentials: Credentials,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub name: String,
    pub veth_if: String,
    pub peer_name: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub description: String,
    pub switch: String,
    pub name: String,
    pub match_actions: Vec<String>,
    pub del_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetperfConfig {
    pub kind: TestKind,
    pub duration_secs: u32,
    pub options: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficConfig {
    pub packets: u32,
    pub send_ports: Vec<usize>,
    pub balanced_destination: Option<String>,
    pub netperf: Option<NetperfConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    pub session_timeout: Duration,
    pub settle: Duration,
    pub vm_boot_timeout: Duration,
    pub ping_count: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            settle: Duration::from_secs(15),
            vm_boot_timeout: Duration::from_secs(120),
            ping_count: 10,
        }
    }
}

/// Validated, immutable test configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    pub switch: String,
    pub bridge: String,
    pub p4: P4Config,
    pub p4_device_id: u32,
    pub pci_bdf: Option<String>,
    pub ports: Vec<PortConfig>,
    pub vms: Vec<VmConfig>,
    pub vxlan: Option<VxlanConfig>,
    pub ecmp: EcmpConfig,
    pub remote: Option<RemoteHostConfig>,
    pub namespaces: Vec<NamespaceConfig>,
    pub tables: Vec<TableConfig>,
    pub traffic: TrafficConfig,
    pub timing: TimingConfig,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// `10.0.0.1/24` → `10.0.0.1`
pub fn strip_prefix_len(addr: &str) -> &str {
    addr.split('/').next().unwrap_or(addr)
}

impl TestConfigInput {
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(bdf) = &overrides.pci_bdf {
            self.pci_bdf = Some(bdf.clone());
        }
        for (vm, image) in self.vm.iter_mut().zip(&overrides.vm_images) {
            vm.vm_image_location = image.clone();
        }
        if let Some(creds) = &overrides.vm_credentials {
            for vm in &mut self.vm {
                vm.vm_username = creds.username.clone();
                vm.vm_password = creds.password.clone();
            }
        }
        if let Some(creds) = &overrides.client_credentials {
            self.client_username = Some(creds.username.clone());
            self.client_password = Some(creds.password.clone());
        }
        if !overrides.remote_ports.is_empty() {
            self.remote_port = overrides.remote_ports.clone();
        }
    }

    pub fn resolve(self) -> Result<TestConfig, String> {
        let bridge = self.bridge.trim().to_string();
        if bridge.is_empty() {
            return Err("bridge must be set".into());
        }
        let switch = match self.switch.trim() {
            "" => bridge.clone(),
            s => s.to_string(),
        };

        let program = self.p4file.trim().to_string();
        if program.is_empty() {
            return Err("p4file must be set".into());
        }
        let arch = match self.p4_arch.as_deref().map(str::trim) {
            None | Some("") | Some("pna") => P4Arch::Pna,
            Some("psa") => P4Arch::Psa,
            Some(other) => return Err(format!("Unsupported p4 arch {other}")),
        };
        let artifacts_dir = non_empty(self.artifacts_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new("common").join("p4c_artifacts").join(&program));

        let mut ports = Vec::with_capacity(self.port.len());
        for (idx, port) in self.port.into_iter().enumerate() {
            let name = port.name.trim().to_string();
            if name.is_empty() {
                return Err(format!("port {idx} has no name"));
            }
            let vlan = match non_empty(port.vlan) {
                Some(v) => Some(
                    v.parse::<u16>()
                        .ok()
                        .filter(|id| (1..4095).contains(id))
                        .ok_or_else(|| format!("port {name}: invalid vlan {v}"))?,
                ),
                None => None,
            };
            ports.push(PortConfig {
                name,
                control_port: non_empty(port.control_port),
                interface: non_empty(port.interface),
                ip: non_empty(port.ip),
                mac: non_empty(port.mac_local),
                vlan,
                gnmi: port.gnmi,
                hotplug: port.hotplug,
            });
        }

        let mut vms = Vec::with_capacity(self.vm.len());
        for (id, vm) in self.vm.into_iter().enumerate() {
            let name = match vm.vm_name.trim() {
                "" => format!("VM{id}"),
                n => n.to_string(),
            };
            let image = vm.vm_image_location.trim().to_string();
            if image.is_empty() {
                return Err(format!("{name}: vm_image_location must be set"));
            }
            let default_serial = u16::try_from(id)
                .ok()
                .and_then(|i| SERIAL_PORT_BASE.checked_add(i))
                .ok_or_else(|| format!("{name}: too many VMs"))?;
            let (serial_port, attach) = match vm.hotplug {
                Some(hp) => {
                    let monitor_port = hp
                        .qemu_socket_port
                        .ok_or_else(|| format!("{name}: hotplug needs qemu-socket-port"))?;
                    (
                        hp.serial_telnet_port.unwrap_or(default_serial),
                        VmAttach::Hotplug { monitor_port },
                    )
                }
                None => (
                    default_serial,
                    VmAttach::VhostUser {
                        socket: non_empty(vm.vhost_socket)
                            .unwrap_or_else(|| format!("/tmp/vhost-user-{id}")),
                    },
                ),
            };
            vms.push(VmConfig {
                id,
                name,
                image,
                credentials: Credentials::new(vm.vm_username, vm.vm_password),
                remote_ips: vm.remote_ip,
                memory: non_empty(vm.memory).unwrap_or_else(|| "512M".into()),
                serial_port,
                attach,
            });
        }

        let vxlan = if self.vxlan.tep_intf.trim().is_empty() {
            None
        } else {
            let v = self.vxlan;
            if v.tep_ip.len() < 2 {
                return Err("vxlan.tep_ip needs local and remote addresses".into());
            }
            let name = v
                .vxlan_name
                .first()
                .cloned()
                .ok_or("vxlan.vxlan_name must not be empty")?;
            let dst_port = match v.dst_port.first() {
                Some(p) => p
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid vxlan dst_port {p}"))?,
                None => 4789,
            };
            Some(VxlanConfig {
                tep_intf: v.tep_intf.trim().to_string(),
                local_tep: v.tep_ip[0].clone(),
                remote_tep: v.tep_ip[1].clone(),
                name,
                dst_port,
            })
        };

        if self.ecmp.local_ports.len() != self.ecmp.local_ports_ip.len() {
            return Err("ecmp.local_ports and ecmp.local_ports_ip differ in length".into());
        }

        let remote = match non_empty(self.client_hostname) {
            Some(hostname) => Some(RemoteHostConfig {
                hostname,
                credentials: Credentials::new(
                    self.client_username.unwrap_or_default(),
                    self.client_password.unwrap_or_default(),
                ),
                ports: self.remote_port,
            }),
            None => None,
        };

        let namespaces = self
            .net_namespace
            .into_iter()
            .map(|ns| NamespaceConfig {
                name: ns.name,
                veth_if: ns.veth_if,
                peer_name: ns.peer_name,
                commands: ns.cmds,
            })
            .collect();

        let tables = self
            .table
            .into_iter()
            .map(|t| TableConfig {
                switch: if t.switch.trim().is_empty() {
                    switch.clone()
                } else {
                    t.switch
                },
                description: t.description,
                name: t.name,
                match_actions: t.match_action,
                del_actions: t.del_action,
            })
            .collect();

        if let Some(&bad) = self.traffic.send_port.iter().find(|&&p| p >= ports.len()) {
            return Err(format!("traffic.send_port {bad} is not a configured port"));
        }
        let netperf = match self.traffic.netperf {
            Some(n) => Some(NetperfConfig {
                kind: n.test.trim().parse()?,
                duration_secs: n.duration_secs.unwrap_or(10),
                options: n.options,
                max_retries: n
                    .max_retries
                    .unwrap_or(p4ovs_session::retry::DEFAULT_MAX_RETRIES),
            }),
            None => None,
        };
        let traffic = TrafficConfig {
            packets: self.traffic.number_pkts.first().copied().unwrap_or(10),
            send_ports: self.traffic.send_port,
            balanced_destination: self.traffic.in_pkt_header.get("ip_dst_1").cloned(),
            netperf,
        };

        let defaults = TimingConfig::default();
        let timing = TimingConfig {
            session_timeout: self
                .timing
                .session_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            settle: self
                .timing
                .settle_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.settle),
            vm_boot_timeout: self
                .timing
                .vm_boot_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.vm_boot_timeout),
            ping_count: self.timing.ping_count.unwrap_or(defaults.ping_count).max(1),
        };

        Ok(TestConfig {
            switch,
            bridge,
            p4: P4Config {
                program,
                arch,
                artifacts_dir,
            },
            p4_device_id: self.p4_device_id.unwrap_or(1),
            pci_bdf: non_empty(self.pci_bdf),
            ports,
            vms,
            vxlan,
            ecmp: EcmpConfig {
                local_ports: self.ecmp.local_ports,
                local_ports_ip: self.ecmp.local_ports_ip,
                remote_ports_ip: self.ecmp.remote_ports_ip,
            },
            remote,
            namespaces,
            tables,
            traffic,
            timing,
        })
    }
}

impl TestConfig {
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let parsed: TestConfigInput =
            serde_json::from_str(input).map_err(|e| format!("Invalid config JSON: {e}"))?;
        parsed.resolve()
    }

    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        let parsed: TestConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {e}"))?;
        parsed.resolve()
    }

    /// Read `path` (`.toml` → TOML, anything else → JSON), apply the
    /// overrides and validate.
    pub fn load(path: &Path, overrides: &Overrides) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut input: TestConfigInput = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)
                .with_context(|| format!("parsing TOML config {}", path.display()))?,
            _ => serde_json::from_str(&text)
                .with_context(|| format!("parsing JSON config {}", path.display()))?,
        };
        input.apply(overrides);
        input
            .resolve()
            .map_err(|e| anyhow!("invalid config {}: {e}", path.display()))
    }

    pub fn vm(&self, id: usize) -> Option<&VmConfig> {
        self.vms.get(id)
    }

    /// Names of the OVS control ports, in port order.
    pub fn control_ports(&self) -> Vec<String> {
        self.ports
            .iter()
            .filter_map(|p| p.control_port.clone())
            .collect()
    }

    /// Host-side `TAP*` port names.
    pub fn tap_ports(&self) -> Vec<String> {
        self.ports
            .iter()
            .filter(|p| p.name.starts_with("TAP"))
            .map(|p| p.name.clone())
            .collect()
    }
}
