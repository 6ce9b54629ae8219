//! p4ovs-ptf
//!
//! Runs one end-to-end scenario against the local P4OVS switch and exits
//! non-zero when any step failed.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use p4ovs_harness::scenario::{EcmpHotplug, PortFlap};
use p4ovs_harness::{execute, Overrides, Scenario, TestConfig, Testbed};
use p4ovs_session::Credentials;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioName {
    /// Two hotplugged VMs, remote namespace host, ECMP over VXLAN.
    EcmpHotplug,
    /// Flap a VM port under ping and check recovery.
    PortFlap,
}

/// P4OVS end-to-end test runner.
#[derive(Parser, Debug)]
#[command(name = "p4ovs-ptf", about = "P4OVS end-to-end test runner")]
struct Cli {
    /// Test configuration (`.json` or `.toml`).
    #[arg(long)]
    config: PathBuf,

    /// PCI address of the physical port under test.
    #[arg(long)]
    pci_bdf: Option<String>,

    /// VM disk images, in VM order.
    #[arg(long, value_delimiter = ',')]
    vm_images: Vec<String>,

    /// VM login as `user:password`.
    #[arg(long, value_parser = parse_credentials)]
    vm_cred: Option<Credentials>,

    /// Remote host login as `user:password`.
    #[arg(long, value_parser = parse_credentials)]
    client_cred: Option<Credentials>,

    /// Remote host ports facing the switch.
    #[arg(long, value_delimiter = ',')]
    remote_port: Vec<String>,

    #[arg(value_enum)]
    scenario: ScenarioName,
}

fn parse_credentials(s: &str) -> Result<Credentials, String> {
    match s.split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok(Credentials::new(user, pass)),
        _ => Err(format!("expected user:password, got {s:?}")),
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let overrides = Overrides {
        pci_bdf: cli.pci_bdf,
        vm_images: cli.vm_images,
        vm_credentials: cli.vm_cred,
        client_credentials: cli.client_cred,
        remote_ports: cli.remote_port,
    };
    let config = TestConfig::load(&cli.config, &overrides)?;
    tracing::info!(
        config = %cli.config.display(),
        bridge = %config.bridge,
        vms = config.vms.len(),
        "configuration loaded"
    );

    let bed = Testbed::connect(&config).context("opening testbed sessions")?;
    let mut scenario: Box<dyn Scenario> = match cli.scenario {
        ScenarioName::EcmpHotplug => Box::new(EcmpHotplug::new(config, bed)),
        ScenarioName::PortFlap => Box::new(PortFlap::new(config, bed)),
    };
    let results = execute(scenario.as_mut());
    println!("{results}");
    Ok(results.was_successful())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}
