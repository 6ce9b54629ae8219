use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Whether we run as root with a working `ip netns`. Namespace tests skip themselves when it
/// does not (no root, no iproute2).
pub fn check_privileges() -> bool {
    let root = match Command::new("id").arg("-u").output() {
        Ok(o) => String::from_utf8_lossy(&o.stdout).trim() == "0",
        Err(_) => false,
    };
    root && matches!(Command::new("ip").arg("netns").output(), Ok(o) if o.status.success())
}

/// Unique namespace or interface name for parallel tests, at most 15
/// characters (the Linux interface name limit).
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}{:x}{}", prefix, pid % 0xFFFF, seq);
    name.chars().take(15).collect()
}
