//! `gnmi-cli` port configuration, hotplug and counters.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Context};
use once_cell::sync::Lazy;
use p4ovs_session::parser::{parse_key_value_counters, CounterSnapshot};
use regex::Regex;

use crate::config::PortConfig;
use crate::host::Host;

static GNMI_UINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"name: "([\w-]+)"\s*\}\s*\}\s*val\s*\{\s*uint_val:\s*(\d+)"#).expect("gnmi counter regex")
});

/// Ordered `key:value` list passed to `gnmi-cli` as one argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GnmiParams {
    pairs: Vec<(String, String)>,
}

impl GnmiParams {
    /// `device` and `name` first, then the remaining keys sorted.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut pairs: Vec<_> = ["device", "name"]
            .iter()
            .filter_map(|k| map.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        pairs.extend(
            map.iter()
                .filter(|(k, _)| k.as_str() != "device" && k.as_str() != "name")
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name")
    }

    /// Just `device` and `name`, identifying the port for `get`.
    pub fn identity(&self) -> String {
        self.pairs
            .iter()
            .filter(|(k, _)| k == "device" || k == "name")
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The port identity followed by a flag such as `counters`.
    pub fn query(&self, flag: &str) -> String {
        format!("{},{flag}", self.identity())
    }
}

impl fmt::Display for GnmiParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        Ok(())
    }
}

/// Port creation parameters of every port that has any.
pub fn port_params(ports: &[PortConfig]) -> Vec<GnmiParams> {
    ports
        .iter()
        .filter(|p| !p.gnmi.is_empty())
        .map(|p| GnmiParams::from_map(&p.gnmi))
        .collect()
}

/// Hotplug requests: each port's `device` and `name` plus its hotplug
/// keys.
pub fn hotplug_params(ports: &[PortConfig]) -> Vec<GnmiParams> {
    ports
        .iter()
        .filter(|p| !p.hotplug.is_empty())
        .map(|p| {
            let mut map: BTreeMap<String, String> = p
                .gnmi
                .iter()
                .filter(|(k, _)| k.as_str() == "device" || k.as_str() == "name")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.extend(p.hotplug.clone());
            GnmiParams::from_map(&map)
        })
        .collect()
}

pub fn set(host: &mut Host, params: &GnmiParams) -> anyhow::Result<String> {
    Ok(host.run(&format!("gnmi-cli set \"{params}\""))?)
}

pub fn get(host: &mut Host, params: &str) -> anyhow::Result<String> {
    Ok(host.run(&format!("gnmi-cli get \"{params}\""))?)
}

/// Set every port, then read each back and require its name to show up.
pub fn set_and_verify(host: &mut Host, ports: &[GnmiParams]) -> anyhow::Result<()> {
    for params in ports {
        set(host, params).with_context(|| format!("gnmi-cli set {params}"))?;
    }
    for params in ports {
        let Some(name) = params.name() else {
            continue;
        };
        let output = get(host, &params.identity()).with_context(|| format!("gnmi-cli get {name}"))?;
        if !output.contains(name) {
            bail!("gnmi-cli get did not report port {name}");
        }
        tracing::info!(port = %name, "gnmi port configured");
    }
    Ok(())
}

/// Interface counters of one port.
pub fn counters(host: &mut Host, params: &GnmiParams) -> anyhow::Result<CounterSnapshot> {
    let name = params.name().unwrap_or("port").to_string();
    let output = get(host, &params.query("counters"))?;
    parse_gnmi_counters(&output, &name)
        .with_context(|| format!("reading gnmi counters of {name}"))
}

/// Counters from `gnmi-cli get` output: protobuf-text updates
/// (`... elem { name: "in-octets" } } val { uint_val: 42 }`), or plain
/// `name: value` lines.
pub fn parse_gnmi_counters(text: &str, source: &str) -> p4ovs_session::Result<CounterSnapshot> {
    let values: BTreeMap<String, u64> = GNMI_UINT
        .captures_iter(text)
        .filter_map(|c| Some((c[1].to_string(), c[2].parse().ok()?)))
        .collect();
    if values.is_empty() {
        return parse_key_value_counters(text, source);
    }
    Ok(CounterSnapshot::new(source, values))
}
