//! Open vSwitch and P4 pipeline control: `ovs-vsctl`, `ovs-ofctl`,
//! `ovs-p4ctl`.

use anyhow::Context;
use p4ovs_session::parser::{parse_counter_dump, PortDump};

use crate::host::{Host, StepFailed};

// ── ovs-vsctl ───────────────────────────────────────────────────────

pub fn add_p4_device(host: &mut Host, device_id: u32) -> Result<(), StepFailed> {
    host.run(&format!("ovs-vsctl add-p4-device {device_id}")).map(drop)
}

pub fn add_bridge(host: &mut Host, bridge: &str) -> Result<(), StepFailed> {
    host.run(&format!("ovs-vsctl add-br {bridge}")).map(drop)
}

/// Attach an existing bridge to a P4 device.
pub fn add_bridge_p4(host: &mut Host, bridge: &str, device_id: u32) -> Result<(), StepFailed> {
    host.run(&format!("ovs-vsctl add-br-p4 {bridge} {device_id}"))
        .map(drop)
}

pub fn add_port(host: &mut Host, bridge: &str, port: &str) -> Result<(), StepFailed> {
    host.run(&format!("ovs-vsctl add-port {bridge} {port}")).map(drop)
}

pub fn vxlan_port_command(
    bridge: &str,
    name: &str,
    local_ip: &str,
    remote_ip: &str,
    dst_port: u16,
) -> String {
    format!(
        "ovs-vsctl add-port {bridge} {name} -- set interface {name} type=vxlan \
         options:local_ip={local_ip} options:remote_ip={remote_ip} options:dst_port={dst_port}"
    )
}

pub fn add_vxlan_port(
    host: &mut Host,
    bridge: &str,
    name: &str,
    local_ip: &str,
    remote_ip: &str,
    dst_port: u16,
) -> Result<(), StepFailed> {
    host.run(&vxlan_port_command(bridge, name, local_ip, remote_ip, dst_port))
        .map(drop)
}

pub fn del_bridge(host: &mut Host, bridge: &str) -> Result<(), StepFailed> {
    host.run(&format!("ovs-vsctl del-br {bridge}")).map(drop)
}

/// `add-p4-device`, `add-br`, `add-br-p4`, then every control port.
pub fn add_control_ports(
    host: &mut Host,
    bridge: &str,
    ports: &[String],
    device_id: u32,
) -> Result<(), StepFailed> {
    add_p4_device(host, device_id)?;
    add_bridge(host, bridge)?;
    add_bridge_p4(host, bridge, device_id)?;
    for port in ports {
        add_port(host, bridge, port)?;
    }
    Ok(())
}

// ── ovs-ofctl ───────────────────────────────────────────────────────

/// Port counters of `bridge`, keyed by control-port name.
pub fn dump_ports(host: &mut Host, bridge: &str, control_ports: &[String]) -> anyhow::Result<PortDump> {
    let output = host.run(&format!("ovs-ofctl dump-ports {bridge}"))?;
    let dump = parse_counter_dump(&output, control_ports)
        .with_context(|| format!("parsing dump-ports of {bridge}"))?;
    tracing::debug!(%bridge, ports = dump.len(), "port counters read");
    Ok(dump)
}

// ── ovs-p4ctl ───────────────────────────────────────────────────────

pub fn set_pipe(host: &mut Host, switch: &str, pb_bin: &str, p4_info: &str) -> Result<(), StepFailed> {
    host.run(&format!("ovs-p4ctl set-pipe {switch} {pb_bin} {p4_info}"))
        .map(drop)
}

pub fn add_entry(host: &mut Host, switch: &str, table: &str, match_action: &str) -> Result<(), StepFailed> {
    host.run(&format!("ovs-p4ctl add-entry {switch} {table} \"{match_action}\""))
        .map(drop)
}

pub fn del_entry(host: &mut Host, switch: &str, table: &str, key: &str) -> Result<(), StepFailed> {
    host.run(&format!("ovs-p4ctl del-entry {switch} {table} \"{key}\""))
        .map(drop)
}

#[cfg(test)]
mod tests {
    use p4ovs_session::channel::ScriptedChannel;

    use super::*;
    use crate::host::testing::scripted;

    #[test]
    fn vxlan_port_options() {
        assert_eq!(
            vxlan_port_command("br-int", "vxlan1", "40.1.1.1", "30.1.1.1", 4789),
            "ovs-vsctl add-port br-int vxlan1 -- set interface vxlan1 type=vxlan \
             options:local_ip=40.1.1.1 options:remote_ip=30.1.1.1 options:dst_port=4789"
        );
    }

    #[test]
    fn control_port_setup_stops_at_first_failure() {
        let mut host = scripted(
            ScriptedChannel::new("h")
                .respond("")
                .respond_failure("ovs-vsctl: cannot create a bridge named br1 because a bridge named br1 already exists"),
        );
        let err = add_control_ports(&mut host, "br1", &["TAP1".into()], 1).unwrap_err();
        assert!(err.detail.contains("already exists"));
        assert_eq!(host.history(), ["ovs-vsctl add-p4-device 1", "ovs-vsctl add-br br1"]);
    }

    #[test]
    fn dump_ports_maps_control_ports() {
        let dump = "\
ovs-ofctl dump-ports br1
OFPST_PORT reply (xid=0x2): 2 ports
  port LOCAL: rx pkts=22, bytes=1860, drop=0, errs=0, frame=0, over=0, crc=0
           tx pkts=8, bytes=656, drop=0, errs=0, coll=0
  port  1: rx pkts=0, bytes=0, drop=0, errs=0, frame=0, over=0, crc=0
           tx pkts=14, bytes=1204, drop=0, errs=0, coll=0
";
        let mut host = scripted(ScriptedChannel::new("h").respond(dump).respond("garbage\n"));
        let ports = dump_ports(&mut host, "br1", &["TAP1".into()]).unwrap();
        assert_eq!(ports["TAP1"].tx.get("pkts"), Some(14));
        assert!(dump_ports(&mut host, "br1", &["TAP1".into()]).is_err());
    }

    #[test]
    fn p4ctl_quotes_entries() {
        let mut host = scripted(ScriptedChannel::new("h").respond("").respond(""));
        add_entry(&mut host, "br0", "ingress.ipv4_host", "hdr.ipv4.dst_addr=1.1.1.1,action=ingress.send(0)").unwrap();
        del_entry(&mut host, "br0", "ingress.ipv4_host", "hdr.ipv4.dst_addr=1.1.1.1").unwrap();
        assert_eq!(
            host.history()[0],
            "ovs-p4ctl add-entry br0 ingress.ipv4_host \"hdr.ipv4.dst_addr=1.1.1.1,action=ingress.send(0)\""
        );
    }
}
