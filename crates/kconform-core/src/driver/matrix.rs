// crates/kconform-core/src/driver/matrix.rs
// ============================================================================
// Module: Sub-Run Matrix
// Description: Filesystem resolution and the variant x filesystem product.
// Purpose: Decide which sub-runs a test executes and in what order.
// Dependencies: kconform-config, crate::probe
// ============================================================================

//! ## Overview
//! Variants form the outer loop and filesystems the inner one. A test that
//! neither formats a device nor iterates filesystems gets one `None`
//! filesystem per variant.

use kconform_config::DeviceConfig;

use crate::channel::Location;
use crate::channel::ResultChannel;
use crate::descriptor::ResourceRequest;
use crate::descriptor::TestDescriptor;
use crate::driver::prereq::Unmet;
use crate::probe::SystemProbe;
use crate::severity::Severity;

/// One (variant, filesystem) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubRun {
    /// Variant index.
    pub(crate) variant: u32,
    /// Filesystem, when one is selected.
    pub(crate) filesystem: Option<String>,
}

/// Resolves the filesystems the test runs on.
pub(crate) fn filesystems(
    descriptor: &TestDescriptor,
    device: &DeviceConfig,
    probe: &dyn SystemProbe,
    channel: &ResultChannel,
) -> Result<Vec<Option<String>>, Unmet> {
    if descriptor.all_filesystems {
        let candidates = device.single_fs_type.as_ref().map_or_else(|| device.filesystems.clone(), |fs| vec![fs.clone()]);
        let mut selected = Vec::new();
        for fs_type in candidates {
            if descriptor.skip_filesystems.contains(&fs_type) {
                continue;
            }
            if probe.filesystem_supported(&fs_type) {
                selected.push(Some(fs_type));
            } else {
                channel.report(Severity::Info, Location::caller(), &format!("{fs_type} is not supported, skipping"));
            }
        }
        if selected.is_empty() {
            return Err(Unmet("no supported filesystem to run on".to_string()));
        }
        return Ok(selected);
    }
    if !descriptor.has_request(|request| matches!(request, ResourceRequest::Format(_))) {
        return Ok(vec![None]);
    }
    let fs_type = descriptor.dev_fs_type.clone().unwrap_or_else(|| device.fs_type.clone());
    if !probe.filesystem_supported(&fs_type) {
        return Err(Unmet(format!("{fs_type} is not supported")));
    }
    Ok(vec![Some(fs_type)])
}

/// Builds the sub-run list with variants outermost.
pub(crate) fn sub_runs(variants: u32, filesystems: &[Option<String>]) -> Vec<SubRun> {
    (0 .. variants)
        .flat_map(|variant| {
            filesystems.iter().map(move |filesystem| SubRun {
                variant,
                filesystem: filesystem.clone(),
            })
        })
        .collect()
}

/// True when every selected filesystem is tmpfs, so no device is needed.
pub(crate) fn device_unneeded(filesystems: &[Option<String>]) -> bool {
    !filesystems.is_empty() && filesystems.iter().all(|fs| fs.as_deref() == Some("tmpfs"))
}
