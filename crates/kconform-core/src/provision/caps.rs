// crates/kconform-core/src/provision/caps.rs
// ============================================================================
// Module: Capabilities
// Description: capget/capset wrappers and the effective-set adjuster.
// Purpose: Run a test with capabilities added to or dropped from its
//          effective set.
// Dependencies: libc, nix
// ============================================================================

//! ## Overview
//! Uses the 64-bit (`_LINUX_CAPABILITY_VERSION_3`) interface for the
//! calling thread. Only the effective set is changed; permitted and
//! inheritable sets are written back unchanged.

#![allow(unsafe_code, reason = "capget(2) and capset(2) have no safe wrapper in nix.")]

use nix::errno::Errno;

use crate::descriptor::CapabilityAction;
use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label.
const RESOURCE: &str = "capabilities";
/// `_LINUX_CAPABILITY_VERSION_3`.
const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// `struct __user_cap_header_struct`.
#[repr(C)]
struct CapHeader {
    /// Interface version.
    version: u32,
    /// Target thread; 0 is the caller.
    pid: i32,
}

/// `struct __user_cap_data_struct`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    /// Effective bits.
    effective: u32,
    /// Permitted bits.
    permitted: u32,
    /// Inheritable bits.
    inheritable: u32,
}

/// Capability sets of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapSet {
    /// Effective set.
    pub effective: u64,
    /// Permitted set.
    pub permitted: u64,
    /// Inheritable set.
    pub inheritable: u64,
}

/// Joins the two 32-bit halves of a set.
fn join(low: u32, high: u32) -> u64 {
    u64::from(low) | (u64::from(high) << 32)
}

/// Splits a set into its two 32-bit halves.
fn split(set: u64) -> (u32, u32) {
    let [b0, b1, b2, b3, b4, b5, b6, b7] = set.to_le_bytes();
    (u32::from_le_bytes([b0, b1, b2, b3]), u32::from_le_bytes([b4, b5, b6, b7]))
}

/// Reads the calling thread's capability sets.
///
/// # Errors
///
/// Returns the `capget` errno.
pub fn current() -> Result<CapSet, Errno> {
    let mut header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];
    // SAFETY: header and a two-element data array match the version 3 ABI.
    let rc = unsafe {
        libc::syscall(libc::SYS_capget, std::ptr::from_mut(&mut header), data.as_mut_ptr())
    };
    Errno::result(rc)?;
    Ok(CapSet {
        effective: join(data[0].effective, data[1].effective),
        permitted: join(data[0].permitted, data[1].permitted),
        inheritable: join(data[0].inheritable, data[1].inheritable),
    })
}

/// Writes the calling thread's capability sets.
///
/// # Errors
///
/// Returns the `capset` errno.
pub fn apply(set: CapSet) -> Result<(), Errno> {
    let mut header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let (effective_low, effective_high) = split(set.effective);
    let (permitted_low, permitted_high) = split(set.permitted);
    let (inheritable_low, inheritable_high) = split(set.inheritable);
    let data = [
        CapData {
            effective: effective_low,
            permitted: permitted_low,
            inheritable: inheritable_low,
        },
        CapData {
            effective: effective_high,
            permitted: permitted_high,
            inheritable: inheritable_high,
        },
    ];
    // SAFETY: header and a two-element data array match the version 3 ABI.
    let rc = unsafe { libc::syscall(libc::SYS_capset, std::ptr::from_mut(&mut header), data.as_ptr()) };
    Errno::result(rc).map(drop)
}

/// Computes the effective set after applying `actions` to `effective`.
#[must_use]
pub fn adjusted_effective(effective: u64, actions: &[CapabilityAction]) -> u64 {
    actions.iter().fold(effective, |set, action| match action {
        CapabilityAction::Add(cap) => set | cap.mask(),
        CapabilityAction::Drop(cap) => set & !cap.mask(),
        CapabilityAction::Require(_) => set,
    })
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Adjusts the effective set for the test process.
#[derive(Debug, Clone)]
pub struct CapabilitiesFactory {
    /// Requested adjustments.
    actions: Vec<CapabilityAction>,
}

impl CapabilitiesFactory {
    /// Creates a factory applying `actions`.
    #[must_use]
    pub const fn new(actions: Vec<CapabilityAction>) -> Self {
        Self {
            actions,
        }
    }
}

impl ResourceFactory for CapabilitiesFactory {
    fn acquire(&self, _state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let before = current().map_err(|errno| ProvisionError::failed(RESOURCE, "capget", errno))?;
        let effective = adjusted_effective(before.effective, &self.actions);
        let missing = effective & !before.permitted;
        if missing != 0 {
            return Err(ProvisionError::unavailable(
                RESOURCE,
                format!("capabilities {missing:#x} are not permitted"),
            ));
        }
        if effective != before.effective {
            apply(CapSet {
                effective,
                ..before
            })
            .map_err(|errno| ProvisionError::failed(RESOURCE, "capset", errno))?;
        }
        Ok(Box::new(AdjustedCaps {
            before,
            effective,
        }))
    }
}

/// Applied capability adjustment.
struct AdjustedCaps {
    /// Sets before the change.
    before: CapSet,
    /// Effective set installed.
    effective: u64,
}

impl Resource for AdjustedCaps {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::Capabilities {
            previous: self.before.effective,
            effective: self.effective,
        }
    }

    fn release(self: Box<Self>, _state: &mut ProvisionState) -> Result<(), ProvisionError> {
        if self.effective == self.before.effective {
            return Ok(());
        }
        apply(self.before).map_err(|errno| ProvisionError::failed(RESOURCE, "restore capset", errno))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
