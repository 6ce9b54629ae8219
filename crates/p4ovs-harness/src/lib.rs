//! P4OVS end-to-end test harness.
//!
//! Drives a P4-programmable Open vSwitch, qemu VMs and a remote traffic
//! host through interactive sessions:
//! - Typed test configuration loaded from JSON or TOML
//! - Wrappers for the collaborator tools (`ip`, `ovs-vsctl`, `ovs-p4ctl`,
//!   `gnmi-cli`, `p4c`, qemu, ping, netperf)
//! - Scenarios with a set-up/run/tear-down runner and result accumulation

pub mod config;
pub mod gnmi;
pub mod host;
pub mod ovs;
pub mod p4c;
pub mod results;
pub mod scenario;
pub mod topology;
pub mod traffic;
pub mod vm;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{Overrides, TestConfig};
pub use host::{Host, Outcome, StepFailed};
pub use results::TestResults;
pub use scenario::{execute, Scenario, Testbed};
