//! End-to-end scenarios and the runner that drives them.
//!
//! A scenario prepares the testbed in [`Scenario::set_up`], exercises it in
//! [`Scenario::run`] and undoes its configuration in
//! [`Scenario::tear_down`]. [`execute`] always calls `tear_down`, whatever
//! happened before, and hands back the accumulated [`TestResults`].

pub mod ecmp_hotplug;
pub mod port_flap;

use anyhow::Context;

pub use ecmp_hotplug::EcmpHotplug;
pub use port_flap::PortFlap;

use crate::config::{TestConfig, VmConfig};
use crate::host::Host;
use crate::results::TestResults;
use crate::vm::{self, VmRegistry};

pub trait Scenario {
    fn name(&self) -> &str;

    /// Fatal errors skip [`Scenario::run`].
    fn set_up(&mut self, results: &mut TestResults) -> anyhow::Result<()>;

    /// An error ends the run and is recorded as a failure; non-fatal
    /// checks go straight into `results`.
    fn run(&mut self, results: &mut TestResults) -> anyhow::Result<()>;

    /// Best effort: every undo step is attempted and recorded.
    fn tear_down(&mut self, results: &mut TestResults);
}

pub fn execute(scenario: &mut dyn Scenario) -> TestResults {
    let mut results = TestResults::new(scenario.name());
    let span = tracing::info_span!("scenario", name = %scenario.name());
    let _enter = span.enter();

    tracing::info!("setting up");
    match scenario.set_up(&mut results) {
        Ok(()) => {
            tracing::info!("running");
            if let Err(err) = scenario.run(&mut results) {
                results.fail("run", err);
            }
        }
        Err(err) => results.fail("set up", err),
    }

    tracing::info!("tearing down");
    scenario.tear_down(&mut results);

    if results.was_successful() {
        tracing::info!(passed = results.passed().len(), "scenario PASSED");
    } else {
        tracing::error!(failed = results.failures().len(), "scenario FAILED");
    }
    results
}

/// The machines a scenario drives.
pub struct Testbed {
    pub local: Host,
    pub remote: Option<Host>,
    pub vms: VmRegistry,
}

impl Testbed {
    pub fn new(local: Host, remote: Option<Host>) -> Self {
        Self {
            local,
            remote,
            vms: VmRegistry::default(),
        }
    }

    /// Open the local shell and, when configured, the remote host.
    pub fn connect(config: &TestConfig) -> anyhow::Result<Self> {
        let timeout = config.timing.session_timeout;
        let local = Host::local(timeout).context("opening local shell")?;
        let remote = match &config.remote {
            Some(r) => Some(
                Host::remote(&r.hostname, r.credentials.clone(), timeout)
                    .with_context(|| format!("connecting to {}", r.hostname))?,
            ),
            None => None,
        };
        Ok(Self::new(local, remote))
    }

    /// Consoles already logged in, e.g. when attached to running VMs.
    pub fn with_vms(mut self, vms: VmRegistry) -> Self {
        self.vms = vms;
        self
    }

    pub fn remote(&mut self) -> anyhow::Result<&mut Host> {
        self.remote
            .as_mut()
            .context("scenario needs a remote host (client_hostname)")
    }

    /// Log in on every VM console unless consoles are already attached.
    pub fn attach_vms(&mut self, vms: &[VmConfig], config: &TestConfig) -> anyhow::Result<()> {
        if self.vms.is_empty() {
            self.vms = VmRegistry::connect(vms, &config.timing)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.vms.close_all();
        if let Some(remote) = &mut self.remote {
            remote.close();
        }
        self.local.close();
    }
}

/// Stop the qemu processes of `vms`, recording each.
pub(crate) fn shutdown_vms(bed: &mut Testbed, vms: &[VmConfig], results: &mut TestResults) {
    for vm in vms {
        let outcome = vm::shutdown(&mut bed.local, vm);
        let name = bed.local.name().to_string();
        results.record(format!("stop {}", vm.name), outcome.check(&name, "pkill qemu"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        fail_set_up: bool,
        calls: Vec<&'static str>,
    }

    impl Scenario for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn set_up(&mut self, _: &mut TestResults) -> anyhow::Result<()> {
            self.calls.push("set_up");
            if self.fail_set_up {
                anyhow::bail!("no qemu");
            }
            Ok(())
        }

        fn run(&mut self, results: &mut TestResults) -> anyhow::Result<()> {
            self.calls.push("run");
            results.pass("step");
            anyhow::bail!("lost VM0 console")
        }

        fn tear_down(&mut self, _: &mut TestResults) {
            self.calls.push("tear_down");
        }
    }

    #[test]
    fn tear_down_always_runs() {
        let mut recorder = Recorder {
            fail_set_up: false,
            calls: Vec::new(),
        };
        let results = execute(&mut recorder);
        assert_eq!(recorder.calls, ["set_up", "run", "tear_down"]);
        assert_eq!(results.passed(), ["step"]);
        assert_eq!(results.failures()[0].step, "run");

        let mut recorder = Recorder {
            fail_set_up: true,
            calls: Vec::new(),
        };
        let results = execute(&mut recorder);
        assert_eq!(recorder.calls, ["set_up", "tear_down"]);
        assert_eq!(results.failures()[0].reason, "no qemu");
    }
}
