//! qemu virtual machines: version check, launch, serial consoles and the
//! shell helpers run on them.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use once_cell::sync::Lazy;
use p4ovs_session::parser::parse_interface_names;
use p4ovs_session::retry::poll;
use p4ovs_session::{Session, SessionConfig, SessionError};
use regex::Regex;

use crate::config::{strip_prefix_len, TimingConfig, VmAttach, VmConfig};
use crate::host::{Host, Outcome, StepFailed};

/// Lists interface names one per line, loopback first.
pub const INTERFACE_LISTING: &str = r#"ip a | egrep "[0-9]*: " | cut -d ':' -f 2"#;

/// Repeated hotplug add/delete of the same device needs at least this.
pub const MIN_HOTPLUG_QEMU: QemuVersion = QemuVersion {
    major: 6,
    minor: 1,
    patch: 0,
};

const CONSOLE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

static QEMU_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"version (\d+)\.(\d+)(?:\.(\d+))?").expect("qemu version regex")
});

// ── qemu ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for QemuVersion {
    type Err = String;

    /// Accepts `qemu-system-x86_64 --version` output, e.g.
    /// `QEMU emulator version 6.2.0 (Debian 1:6.2+dfsg-2ubuntu6)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = QEMU_VERSION
            .captures(s)
            .ok_or_else(|| format!("no qemu version in {:?}", s.trim()))?;
        let num = |i: usize| -> Result<u32, String> {
            caps.get(i)
                .map_or(Ok(0), |m| m.as_str().parse().map_err(|e| format!("{e}")))
        };
        Ok(Self {
            major: num(1)?,
            minor: num(2)?,
            patch: num(3)?,
        })
    }
}

impl fmt::Display for QemuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub fn qemu_version(host: &mut Host) -> anyhow::Result<QemuVersion> {
    let output = host.run("qemu-system-x86_64 --version | head -1")?;
    output.parse().map_err(anyhow::Error::msg)
}

/// Fail unless the installed qemu supports repeated hotplug.
pub fn check_hotplug_support(host: &mut Host) -> anyhow::Result<QemuVersion> {
    let version = qemu_version(host)?;
    if version < MIN_HOTPLUG_QEMU {
        bail!("qemu {version} is too old for hotplug, need {MIN_HOTPLUG_QEMU} or newer");
    }
    tracing::info!(%version, "qemu supports hotplug");
    Ok(version)
}

/// The qemu invocation for `vm`, without backgrounding.
pub fn launch_command(vm: &VmConfig) -> String {
    let mem = &vm.memory;
    let common = format!(
        "-boot c -cpu host -enable-kvm -nographic -L /root/pc-bios -name {name} -hda {image} \
         -object memory-backend-file,id=mem,size={mem},mem-path=/dev/hugepages,share=on \
         -mem-prealloc -numa node,memdev=mem",
        name = vm.name,
        image = vm.image,
    );
    match &vm.attach {
        VmAttach::Hotplug { monitor_port } => format!(
            "qemu-system-x86_64 -smp 4 -m {mem} {common} \
             -monitor telnet::{monitor_port},server,nowait -serial telnet::{},server",
            vm.serial_port
        ),
        VmAttach::VhostUser { socket } => format!(
            "qemu-kvm -smp 2 -m {mem} {common} \
             -chardev socket,id=char{id},path={socket} \
             -netdev type=vhost-user,id=netdev{id},chardev=char{id},vhostforce \
             -device virtio-net-pci,netdev=netdev{id} -serial telnet::{},server,nowait",
            vm.serial_port,
            id = vm.id,
        ),
    }
}

fn process_pattern(vm: &VmConfig) -> String {
    format!("qemu.*-name {} ", vm.name)
}

/// Start `vm` in the background with its console output in
/// `/tmp/qemu-<name>.log`.
pub fn launch(host: &mut Host, vm: &VmConfig) -> Result<(), StepFailed> {
    let command = format!(
        "({} > /tmp/qemu-{}.log 2>&1 &)",
        launch_command(vm),
        vm.name
    );
    host.run(&command)?;
    tracing::info!(vm = vm.id, name = %vm.name, serial = vm.serial_port, "vm launched");
    Ok(())
}

/// Launch every VM, wait `settle`, then require each qemu process to
/// still be running.
pub fn launch_all(host: &mut Host, vms: &[VmConfig], settle: Duration) -> Result<(), StepFailed> {
    for vm in vms {
        launch(host, vm)?;
    }
    thread::sleep(settle);
    for vm in vms {
        host.run(&format!("pgrep -f \"{}\"", process_pattern(vm)))
            .map_err(|e| StepFailed {
                what: format!("{} exited right after launch", vm.name),
                ..e
            })?;
    }
    Ok(())
}

pub fn shutdown(host: &mut Host, vm: &VmConfig) -> Outcome {
    host.exec(&format!("pkill -f \"{}\"", process_pattern(vm)))
}

/// Delete leftover `vhost-user*` sockets in `dir`, returning how many
/// were removed.
pub fn clear_vhost_sockets(host: &mut Host, dir: &str) -> anyhow::Result<usize> {
    let listing = host.run(&format!("ls {dir}"))?;
    let sockets: Vec<&str> = listing
        .split_whitespace()
        .filter(|f| f.starts_with("vhost-user"))
        .collect();
    for socket in &sockets {
        let path = format!("{}/{socket}", dir.trim_end_matches('/'));
        host.run(&format!("rm -f {path}"))
            .with_context(|| format!("deleting vhost-user socket {path}"))?;
        tracing::info!(%path, "stale vhost-user socket removed");
    }
    Ok(sockets.len())
}

// ── Consoles ────────────────────────────────────────────────────────

/// Log in on the serial console of `vm`, retrying until it boots.
pub fn connect_console(vm: &VmConfig, timing: &TimingConfig) -> Result<Host, SessionError> {
    let config = SessionConfig::telnet("127.0.0.1", vm.serial_port, Some(vm.credentials.clone()))
        .with_timeout(timing.session_timeout);
    let session = poll(timing.vm_boot_timeout, CONSOLE_RETRY_INTERVAL, || {
        match Session::open(config.clone()) {
            Ok(session) => Ok(Some(session)),
            Err(err) if err.is_transport() || matches!(err, SessionError::Timeout(_)) => {
                tracing::debug!(vm = vm.id, error = %err, "console not ready");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    })?;
    tracing::info!(vm = vm.id, name = %vm.name, "console connected");
    Ok(Host::from_session(vm.name.clone(), session))
}

/// Open VM consoles, indexed by VM id.
#[derive(Default)]
pub struct VmRegistry {
    consoles: Vec<Host>,
}

impl VmRegistry {
    /// Console of VM `i` becomes id `i`.
    pub fn from_consoles(consoles: Vec<Host>) -> Self {
        Self { consoles }
    }

    /// Connect to every VM in order. Stops at the first VM that does not
    /// come up; consoles opened so far are closed.
    pub fn connect(vms: &[VmConfig], timing: &TimingConfig) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for vm in vms {
            match connect_console(vm, timing) {
                Ok(console) => registry.consoles.push(console),
                Err(err) => {
                    registry.close_all();
                    return Err(err).with_context(|| format!("connecting to {} console", vm.name));
                }
            }
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.consoles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consoles.is_empty()
    }

    pub fn get(&mut self, id: usize) -> Option<&mut Host> {
        self.consoles.get_mut(id)
    }

    pub fn console(&mut self, id: usize) -> anyhow::Result<&mut Host> {
        let count = self.consoles.len();
        self.consoles
            .get_mut(id)
            .with_context(|| format!("no console for VM{id} ({count} connected)"))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Host)> {
        self.consoles.iter_mut().enumerate()
    }

    pub fn close_all(&mut self) {
        for console in &mut self.consoles {
            console.close();
        }
        self.consoles.clear();
    }
}

// ── Shell helpers ───────────────────────────────────────────────────

/// Run every command, collecting each outcome; failures do not stop the
/// batch.
pub fn run_batch<S: AsRef<str>>(console: &mut Host, commands: &[S]) -> Vec<Outcome> {
    commands
        .iter()
        .map(|cmd| {
            let outcome = console.exec(cmd.as_ref());
            if !outcome.success {
                tracing::warn!(host = %console.name(), command = cmd.as_ref(), "command failed");
            }
            outcome
        })
        .collect()
}

pub fn interfaces(console: &mut Host) -> anyhow::Result<Vec<String>> {
    let listing = console.run(INTERFACE_LISTING)?;
    parse_interface_names(&listing).with_context(|| format!("listing interfaces on {}", console.name()))
}

pub fn set_mac(console: &mut Host, iface: &str, mac: &str) -> Result<(), StepFailed> {
    console
        .run(&format!("ip link set dev {iface} address {mac}"))
        .map(drop)
}

/// Route the /24 of `remote_ip` via `local_ip`.
pub fn add_route_via(console: &mut Host, iface: &str, local_ip: &str, remote_ip: &str) -> Result<(), StepFailed> {
    console
        .run(&format!(
            "ip route add {}/24 via {} dev {iface}",
            strip_prefix_len(remote_ip),
            strip_prefix_len(local_ip)
        ))
        .map(drop)
}

pub fn add_neighbor(console: &mut Host, iface: &str, remote_ip: &str, mac: &str) -> Result<(), StepFailed> {
    console
        .run(&format!(
            "ip neigh add dev {iface} {} lladdr {mac}",
            strip_prefix_len(remote_ip)
        ))
        .map(drop)
}

pub fn offload_off(console: &mut Host, iface: &str) -> Result<(), StepFailed> {
    console
        .run(&format!("ethtool --offload {iface} rx off tx off"))
        .map(drop)
}

pub fn set_mtu(console: &mut Host, iface: &str, mtu: u32) -> Result<(), StepFailed> {
    console
        .run(&format!("ip link set {iface} mtu {mtu} up"))
        .map(drop)
}
