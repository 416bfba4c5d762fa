// crates/kconform-core/src/driver/prereq.rs
// ============================================================================
// Module: Prerequisite Checks
// Description: Host checks performed before anything is acquired.
// Purpose: Turn unmet requirements into a single UNSUPPORTED result.
// Dependencies: crate::probe, crate::descriptor
// ============================================================================

//! ## Overview
//! Checks run in a fixed order and stop at the first unmet requirement.
//! Requesting a device, format, mount or read-only filesystem implies root.

use crate::descriptor::CapabilityAction;
use crate::descriptor::ResourceRequest;
use crate::descriptor::TestDescriptor;
use crate::probe::KernelVersion;
use crate::probe::SystemProbe;

/// Why the test cannot run on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unmet(pub(crate) String);

/// Returns true when the descriptor needs root privileges.
fn needs_root(descriptor: &TestDescriptor) -> bool {
    descriptor.needs_root
        || descriptor.has_request(|request| {
            matches!(
                request,
                ResourceRequest::Device(_)
                    | ResourceRequest::Format(_)
                    | ResourceRequest::Mount(_)
                    | ResourceRequest::ReadOnlyFs(_)
            )
        })
}

/// Checks one `CONFIG_X` or `CONFIG_X=value` requirement.
fn kconfig_satisfied(probe: &dyn SystemProbe, entry: &str) -> Result<bool, Unmet> {
    let (name, expected) = match entry.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (entry, None),
    };
    let value = probe.kconfig(name).map_err(|err| Unmet(format!("kernel config unavailable: {err}")))?;
    Ok(match (value, expected) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(value), Some(expected)) => value.trim_matches('"') == expected.trim_matches('"'),
    })
}

/// Runs every prerequisite check in order.
pub(crate) fn check(descriptor: &TestDescriptor, probe: &dyn SystemProbe) -> Result<(), Unmet> {
    if let Some(reason) = &descriptor.unsupported_reason {
        return Err(Unmet(reason.clone()));
    }
    if needs_root(descriptor) && probe.euid() != 0 {
        return Err(Unmet("test requires root".to_string()));
    }
    if !descriptor.supported_archs.is_empty() {
        let machine = probe.machine().map_err(|err| Unmet(err.to_string()))?;
        if !descriptor.supported_archs.contains(&machine) {
            return Err(Unmet(format!("architecture {machine} is not supported")));
        }
    }
    if let Some(min) = descriptor.min_kver {
        let release = probe.kernel_release().map_err(|err| Unmet(err.to_string()))?;
        let running = KernelVersion::parse(&release)
            .ok_or_else(|| Unmet(format!("cannot parse kernel release '{release}'")))?;
        if running < min {
            return Err(Unmet(format!("test requires kernel {min} or newer, running {running}")));
        }
    }
    if let Some(cmd) = descriptor.cmds.iter().find(|cmd| !probe.has_command(cmd)) {
        return Err(Unmet(format!("command {cmd} not found")));
    }
    for entry in &descriptor.kconfigs {
        if !kconfig_satisfied(probe, entry)? {
            return Err(Unmet(format!("kernel config {entry} not set")));
        }
    }
    if let Some(driver) = descriptor.drivers.iter().find(|driver| !probe.has_driver(driver)) {
        return Err(Unmet(format!("driver {driver} not available")));
    }
    let cpus = probe.online_cpus();
    if cpus < descriptor.min_cpus {
        return Err(Unmet(format!("test requires {} CPUs, {cpus} online", descriptor.min_cpus)));
    }
    if descriptor.min_mem_avail_mb > 0 {
        let available = probe.mem_available_mb().map_err(|err| Unmet(err.to_string()))?;
        if available < descriptor.min_mem_avail_mb {
            return Err(Unmet(format!(
                "test requires {} MiB available memory, {available} MiB available",
                descriptor.min_mem_avail_mb
            )));
        }
    }
    check_capabilities(descriptor, probe)?;
    for request in &descriptor.resources {
        if let ResourceRequest::Cgroup(cgroup) = request
            && !probe.cgroup_available(cgroup.version, &cgroup.controllers)
        {
            return Err(Unmet(format!("cgroup controllers [{}] unavailable", cgroup.controllers.join(", "))));
        }
    }
    Ok(())
}

/// Checks `Require` capability actions against the permitted set.
fn check_capabilities(descriptor: &TestDescriptor, probe: &dyn SystemProbe) -> Result<(), Unmet> {
    let required: u64 = descriptor
        .resources
        .iter()
        .filter_map(|request| match request {
            ResourceRequest::Capabilities(actions) => Some(actions),
            _ => None,
        })
        .flatten()
        .filter_map(|action| match action {
            CapabilityAction::Require(cap) => Some(cap.mask()),
            _ => None,
        })
        .fold(0, |mask, bit| mask | bit);
    if required == 0 {
        return Ok(());
    }
    let permitted = probe.permitted_capabilities().map_err(|err| Unmet(err.to_string()))?;
    let missing = required & !permitted;
    if missing != 0 {
        return Err(Unmet(format!("capabilities {missing:#x} not permitted")));
    }
    Ok(())
}

/// Reads the taint baseline; UNSUPPORTED when a masked flag is already set.
pub(crate) fn taint_baseline(descriptor: &TestDescriptor, probe: &dyn SystemProbe) -> Result<Option<u64>, Unmet> {
    let Some(mask) = descriptor.taint_check else {
        return Ok(None);
    };
    let tainted = probe.tainted().map_err(|err| Unmet(err.to_string()))?;
    if tainted & mask != 0 {
        return Err(Unmet(format!("kernel already tainted ({:#x})", tainted & mask)));
    }
    Ok(Some(mask))
}

