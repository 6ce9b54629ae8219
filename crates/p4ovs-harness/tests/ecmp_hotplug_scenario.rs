//! The ECMP hotplug scenario end to end against scripted hosts and
//! consoles.

use std::path::Path;

use p4ovs_harness::scenario::EcmpHotplug;
use p4ovs_harness::vm::VmRegistry;
use p4ovs_harness::{execute, Host, Overrides, TestConfig, Testbed};
use p4ovs_session::channel::ScriptedChannel;
use p4ovs_session::{Session, SessionConfig};

const QEMU_VERSION: &str = "QEMU emulator version 6.2.0 (Debian 1:6.2+dfsg-2ubuntu6)";
const GNMI_SET_OK: &str = "Set request, successful...!!!";
const PING_OK: &str = "--- 99.0.0.3 ping statistics ---\n\
    4 packets transmitted, 4 received, 0% packet loss, time 3004ms\n\
    rtt min/avg/max/mdev = 0.301/0.402/0.512/0.077 ms";
const PING_PARTIAL: &str = "--- 50.1.1.2 ping statistics ---\n\
    4 packets transmitted, 3 received, 25% packet loss, time 3004ms";

const LISTING_BEFORE: &str = "lo\nens3\n";
const LISTING_AFTER: &str = "lo\nens3\nens4\n";

fn config() -> TestConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/ecmp_scenario.toml");
    TestConfig::load(&path, &Overrides::default()).unwrap()
}

fn host(name: &str, channel: ScriptedChannel) -> Host {
    Host::from_session(name, Session::from_channel(SessionConfig::local(), Box::new(channel)))
}

fn quiet(channel: ScriptedChannel, commands: usize) -> ScriptedChannel {
    (0..commands).fold(channel, |ch, _| ch.respond(""))
}

fn gnmi_port(name: &str) -> String {
    format!("path {{ elem {{ name: \"{name}\" }} }}")
}

fn counters(out_unicast: u64) -> String {
    format!("in-unicast-pkts: 7\nout-unicast-pkts: {out_unicast}\n")
}

/// Version check, compile, then gnmi port creation and hotplug.
fn local_until_hotplug() -> ScriptedChannel {
    let mut script = quiet(ScriptedChannel::new("localhost").respond(QEMU_VERSION), 2);
    for _ in 0..2 {
        script = script
            .respond(GNMI_SET_OK)
            .respond(GNMI_SET_OK)
            .respond(gnmi_port("net_vhost0"))
            .respond(gnmi_port("net_vhost1"));
    }
    script
}

/// del-entry, both vlans, TEP0, the route to the remote TEP, del-br.
fn local_tear_down(script: ScriptedChannel) -> ScriptedChannel {
    quiet(script, 6)
}

/// Local switch answering a full run. `vhost1_after` is the second
/// `out-unicast-pkts` reading of the second send port.
fn local_switch(vhost1_after: u64) -> Host {
    // TAP link, TEP0, three addresses, pipeline, bridge, vxlan, two
    // vlans, one table entry.
    let script = quiet(local_until_hotplug(), 16)
        .respond(PING_PARTIAL)
        .respond(PING_PARTIAL)
        .respond("") // ecmp route to the remote TEP
        .respond(PING_PARTIAL)
        .respond(counters(100))
        .respond(counters(200))
        .respond(counters(106))
        .respond(counters(vhost1_after));
    host("localhost", local_tear_down(script))
}

/// Seven teardown commands: veth, namespace, bridge, TEP1, route and two
/// addresses.
fn remote_tear_down(script: ScriptedChannel) -> ScriptedChannel {
    quiet(script, 7)
}

fn remote_host() -> Host {
    // Bridge and link, namespace VM (nine) plus its port, vxlan, TEP1,
    // three links with addresses, ecmp route.
    let script = quiet(ScriptedChannel::new("10.233.1.2"), 21);
    host("10.233.1.2", remote_tear_down(script))
}

fn vm_console(name: &str, after: &str, balance_ping: bool) -> Host {
    let mut script = ScriptedChannel::new(name)
        .respond(LISTING_BEFORE)
        .respond(after);
    script = quiet(script, 3).respond(PING_OK).respond(PING_OK);
    if balance_ping {
        script = script.respond(PING_OK).respond(PING_OK);
    }
    host(name, script)
}

fn testbed(local: Host, remote: Host, vm0: Host, vm1: Host) -> Testbed {
    Testbed::new(local, Some(remote)).with_vms(VmRegistry::from_consoles(vec![vm0, vm1]))
}

#[test]
fn hotplugged_vms_reach_remote_and_traffic_balances() {
    let bed = testbed(
        local_switch(203),
        remote_host(),
        vm_console("VM0", LISTING_AFTER, true),
        vm_console("VM1", LISTING_AFTER, false),
    );
    let mut scenario = EcmpHotplug::new(config(), bed);
    let results = execute(&mut scenario);

    assert!(results.was_successful(), "{results}");
    let passed = results.passed();
    for step in [
        "qemu 6.2.0 supports hotplug",
        "hotplugged ens4 into VM0",
        "hotplugged ens4 into VM1",
        "remote host configuration",
        "remote TEP reachable",
        "VM1 overlay ping",
        "net_vhost0 forwards traffic",
        "net_vhost1 forwards traffic",
        "traffic load balanced",
    ] {
        assert!(passed.iter().any(|s| s == step), "missing {step}: {results}");
    }

    let bed = scenario.testbed();
    let local = bed.local.history();
    assert!(local[1].starts_with("p4c-dpdk"));
    assert!(local.contains(&"ip link add link TAP0 name vlan200 type vlan id 200".to_string()));
    assert!(local.contains(
        &"ip route add 40.1.1.2 nexthop via 50.1.1.2 dev ens2f0 weight 1 nexthop via 60.1.1.2 dev ens2f1 weight 1"
            .to_string()
    ));
    assert_eq!(local.last().map(String::as_str), Some("ovs-vsctl del-br br-int"));

    let remote = bed.remote.as_ref().unwrap().history();
    assert!(remote.contains(
        &"ip route add 40.1.1.1 nexthop via 50.1.1.1 dev ens1f0 weight 1 nexthop via 60.1.1.1 dev ens1f1 weight 1"
            .to_string()
    ));
    assert_eq!(remote.last().map(String::as_str), Some("ip addr del 60.1.1.2/24 dev ens1f1"));
    assert!(bed.vms.is_empty());
}

#[test]
fn missing_hotplugged_interface_stops_the_run() {
    let bed = testbed(
        host("localhost", local_tear_down(local_until_hotplug())),
        host("10.233.1.2", remote_tear_down(ScriptedChannel::new("10.233.1.2"))),
        host(
            "VM0",
            ScriptedChannel::new("VM0").respond(LISTING_BEFORE).respond(LISTING_AFTER),
        ),
        host(
            "VM1",
            ScriptedChannel::new("VM1").respond(LISTING_BEFORE).respond(LISTING_BEFORE),
        ),
    );
    let mut scenario = EcmpHotplug::new(config(), bed);
    let results = execute(&mut scenario);

    assert_eq!(results.failures().len(), 1, "{results}");
    let failure = &results.failures()[0];
    assert_eq!(failure.step, "run");
    assert!(failure.reason.contains("hotplug add failed for VM1"), "{}", failure.reason);
    assert!(results.passed().iter().any(|s| s == "hotplugged ens4 into VM0"));
    assert!(results.passed().iter().any(|s| s == "delete bridge br-int"));
}

#[test]
fn idle_send_port_fails_only_that_port() {
    let bed = testbed(
        local_switch(200),
        remote_host(),
        vm_console("VM0", LISTING_AFTER, true),
        vm_console("VM1", LISTING_AFTER, false),
    );
    let mut scenario = EcmpHotplug::new(config(), bed);
    let results = execute(&mut scenario);

    assert_eq!(results.failures().len(), 1, "{results}");
    assert_eq!(results.failures()[0].step, "net_vhost1 forwards traffic");
    assert!(results.passed().iter().any(|s| s == "net_vhost0 forwards traffic"));
    assert!(results.passed().iter().any(|s| s == "traffic load balanced"));
}
