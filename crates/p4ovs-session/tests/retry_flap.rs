//! Retry engine and port-flap detector driven through scripted channels.

use std::time::Duration;

use p4ovs_session::channel::ScriptedChannel;
use p4ovs_session::flap::{FlapState, PortFlapConfig, PortFlapDetector};
use p4ovs_session::parser::{parse_packet_loss, LossExpectation, TestKind};
use p4ovs_session::retry::{run_netperf, NetperfRequest, RetryPolicy};
use p4ovs_session::SessionError;

const UDP_ROW: &str = "212992           10.00     1938991             99.27\nroot@vm:~# ";
const TRUNCATED: &str = "netperf -H 99.0.0.3 -l 10 -t UDP_STREAM\nSocket  Message  Elapsed\nroot@vm:~# ";

fn udp_request() -> NetperfRequest {
    NetperfRequest::new("99.0.0.3", TestKind::UdpStream, 10)
}

// ─── Netperf retry ───────────────────────────────────────────────────────────

#[test]
fn netperf_succeeds_on_third_attempt() {
    let mut ch = ScriptedChannel::new("vm1")
        .respond(TRUNCATED)
        .respond("garbage line\n")
        .respond(UDP_ROW);
    let policy = RetryPolicy::new(3, Duration::from_secs(1));

    let res = run_netperf(&mut ch, &udp_request(), &policy).unwrap();

    assert_eq!(res.attempts, 3);
    assert_eq!(res.value.throughput_mbps(), 99.27);
    assert_eq!(ch.sent().len(), 3);
    assert!(ch
        .sent()
        .iter()
        .all(|c| c == "netperf -H 99.0.0.3 -l 10 -t UDP_STREAM"));
}

#[test]
fn netperf_never_exceeds_attempt_ceiling() {
    let mut ch = ScriptedChannel::new("vm1");
    for _ in 0..10 {
        ch = ch.respond(TRUNCATED);
    }
    let policy = RetryPolicy::new(3, Duration::from_secs(1));

    let err = run_netperf(&mut ch, &udp_request(), &policy).unwrap_err();

    assert!(matches!(err, SessionError::RetryExhausted { attempts: 4, .. }));
    assert_eq!(ch.sent().len(), 4);
    assert_eq!(ch.remaining_responses(), 6);
}

#[test]
fn netperf_connection_loss_stops_retrying() {
    let mut ch = ScriptedChannel::new("vm1").respond(TRUNCATED);
    let err = run_netperf(&mut ch, &udp_request(), &RetryPolicy::default()).unwrap_err();
    assert!(err.is_transport());
    assert_eq!(ch.sent().len(), 2);
}

#[test]
fn tcp_rows_need_five_columns() {
    let mut ch = ScriptedChannel::new("vm1")
        .respond(UDP_ROW)
        .respond("131072  16384     64    10.00     610.03\nroot@vm:~# ");
    let req = NetperfRequest::new("99.0.0.3", TestKind::TcpStream, 10).with_options("-- -m 64");
    let res = run_netperf(&mut ch, &req, &RetryPolicy::default()).unwrap();
    assert_eq!(res.attempts, 2);
    assert_eq!(res.value.values().len(), 5);
}

// ─── Port flap ───────────────────────────────────────────────────────────────

fn flap_config() -> PortFlapConfig {
    PortFlapConfig {
        overall_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_millis(100),
        ..PortFlapConfig::ping("10.0.0.2", "ens4")
    }
}

fn reply(seq: u32) -> String {
    format!("\n64 bytes from 10.0.0.2: icmp_seq={seq} ttl=64 time=0.41 ms")
}

#[test]
fn flap_walks_every_state_with_one_down_and_one_up() {
    let mut ch = ScriptedChannel::new("vm0")
        .chunk("ping -w 30 10.0.0.2\nPING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.")
        .chunk(reply(1))
        .chunk(reply(2))
        .chunk("\nip link set ens4 down\nFrom 10.0.0.1 icmp_seq=4 Destination Host Unreachable ms")
        .silence()
        .chunk(reply(9));
    let mut det = PortFlapDetector::new(flap_config());

    det.run(&mut ch).unwrap();

    assert_eq!(det.state(), FlapState::Success);
    assert_eq!(
        det.history(),
        [
            FlapState::WaitingTraffic,
            FlapState::LinkDownIssued,
            FlapState::WaitingRecovery,
            FlapState::Success,
        ]
    );
    assert_eq!(det.downs_sent(), 1);
    assert_eq!(det.ups_sent(), 1);
    assert_eq!(
        ch.sent(),
        [
            "ping -w 30 10.0.0.2",
            "ip link set ens4 down",
            "ip link set ens4 up"
        ]
    );
}

#[test]
fn flap_ignores_traffic_before_down_echo() {
    let mut ch = ScriptedChannel::new("vm0")
        .chunk(reply(1))
        .chunk(reply(2))
        .chunk(reply(3))
        .chunk("\nip link set ens4 down")
        .chunk(reply(7));
    let mut det = PortFlapDetector::new(PortFlapConfig {
        traffic_command: None,
        ..flap_config()
    });

    det.run(&mut ch).unwrap();

    assert_eq!(det.downs_sent(), 1);
    assert_eq!(det.ups_sent(), 1);
    assert_eq!(ch.sent(), ["ip link set ens4 down", "ip link set ens4 up"]);
}

#[test]
fn flap_times_out_when_deadline_passes() {
    let mut ch = ScriptedChannel::new("vm0").silence();
    let mut det = PortFlapDetector::new(PortFlapConfig {
        overall_timeout: Duration::ZERO,
        ..flap_config()
    });

    let err = det.run(&mut ch).unwrap_err();

    assert!(matches!(err, SessionError::Timeout(_)));
    assert_eq!(det.state(), FlapState::Failure);
    assert_eq!(det.downs_sent(), 0);
}

#[test]
fn flap_fails_when_stream_drops() {
    let mut ch = ScriptedChannel::new("vm0")
        .chunk(reply(1))
        .drop_connection();
    let mut det = PortFlapDetector::new(flap_config());

    let err = det.run(&mut ch).unwrap_err();

    assert!(err.is_transport());
    assert_eq!(det.state(), FlapState::Failure);
    assert_eq!(
        det.history(),
        [
            FlapState::WaitingTraffic,
            FlapState::LinkDownIssued,
            FlapState::Failure
        ]
    );
    assert_eq!(det.ups_sent(), 0);
}

#[test]
fn flap_fails_when_up_command_cannot_be_sent() {
    let mut ch = ScriptedChannel::new("vm0")
        .chunk(reply(1))
        .chunk("\nip link set ens4 down")
        .chunk(reply(5))
        .fail_sends_after(2);
    let mut det = PortFlapDetector::new(flap_config());

    let err = det.run(&mut ch).unwrap_err();

    assert!(matches!(err, SessionError::ConnectionLost { .. }));
    assert_eq!(det.state(), FlapState::Failure);
    assert_eq!(det.downs_sent(), 1);
    assert_eq!(det.ups_sent(), 0);
}

// ─── Ping verdicts ───────────────────────────────────────────────────────────

#[test]
fn ping_examples() {
    let clean = "10 packets transmitted, 10 received, 0% packet loss, time 9014ms";
    assert_eq!(parse_packet_loss(clean), Some(0));
    assert!(LossExpectation::NoLoss.check(clean, 10).passed);

    let lossy = "4 packets transmitted, 4 received, 25% packet loss";
    assert_eq!(parse_packet_loss("4 received, 25% packet loss"), Some(25));
    let verdict = LossExpectation::Total.check(lossy, 4);
    assert!(!verdict.passed);
    assert_eq!(verdict.to_string(), "FAIL: 25% loss, expected Total");
}
