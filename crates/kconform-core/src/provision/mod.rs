// crates/kconform-core/src/provision/mod.rs
// ============================================================================
// Module: Resource Provisioner
// Description: Acquisition stack with strict reverse-order teardown.
// Purpose: Guarantee every acquired resource is released exactly once.
// Dependencies: nix, thiserror, crate::descriptor
// ============================================================================

//! ## Overview
//! Resources are acquired through [`ResourceFactory`] implementations and
//! pushed onto a [`Provisioner`] stack as [`ResourceHandle`] values. Teardown
//! pops the stack, so release order is the exact reverse of acquisition.
//! Invariants:
//! - Each handle is released at most once, and only by the owning process.
//! - Release failures are returned to the caller, never swallowed silently.
//! - [`ProvisionError::severity`] distinguishes missing facilities
//!   (UNSUPPORTED) from failing operations (BROKEN).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;

use nix::unistd::Pid;
use nix::unistd::getpid;
use thiserror::Error;

use crate::severity::Severity;

pub mod caps;
pub mod cgroup;
pub mod device;
pub mod files;
pub mod hugepages;
pub mod mount;
pub mod scratch;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Provisioning errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// The facility does not exist on this system.
    #[error("{resource} unavailable: {reason}")]
    Unavailable {
        /// Resource class.
        resource: &'static str,
        /// Why it is unavailable.
        reason: String,
    },
    /// An operation on an existing facility failed.
    #[error("{resource}: {operation} failed: {reason}")]
    Failed {
        /// Resource class.
        resource: &'static str,
        /// Failing operation.
        operation: String,
        /// OS error text.
        reason: String,
    },
}

impl ProvisionError {
    /// Builds an [`ProvisionError::Unavailable`].
    pub(crate) fn unavailable(resource: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            resource,
            reason: reason.into(),
        }
    }

    /// Builds a [`ProvisionError::Failed`].
    pub(crate) fn failed(
        resource: &'static str,
        operation: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Failed {
            resource,
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Severity reported when this error stops a run.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Unavailable {
                ..
            } => Severity::Unsupported,
            Self::Failed {
                ..
            } => Severity::Broken,
        }
    }
}

// ============================================================================
// SECTION: State
// ============================================================================

/// What has been provisioned so far; later factories build on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionState {
    /// Scratch directory.
    pub scratch_dir: Option<PathBuf>,
    /// Block device path.
    pub device: Option<PathBuf>,
    /// Filesystem selected for the current sub-run.
    pub fs_type: Option<String>,
    /// Mounted filesystem location.
    pub mount_point: Option<PathBuf>,
    /// Test cgroup directory.
    pub cgroup_dir: Option<PathBuf>,
    /// Huge pages reserved for the test.
    pub hugepages: u64,
}

/// Description of an acquired resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquiredResource {
    /// Scratch directory path.
    ScratchDir(PathBuf),
    /// Files copied into the scratch directory.
    ResourceFiles(Vec<PathBuf>),
    /// Block device, loop-backed or configured.
    Device {
        /// Device node.
        path: PathBuf,
        /// True when a loop device was attached for the test.
        loop_backed: bool,
    },
    /// Device formatted with a filesystem.
    Formatted {
        /// Device node.
        device: PathBuf,
        /// Filesystem type.
        fs_type: String,
    },
    /// Mounted filesystem.
    Mount {
        /// Mount point.
        target: PathBuf,
        /// Filesystem type.
        fs_type: String,
    },
    /// Capability set applied.
    Capabilities {
        /// Effective set before the change.
        previous: u64,
        /// Effective set after the change.
        effective: u64,
    },
    /// Control group created.
    Cgroup {
        /// Test cgroup directory.
        test_dir: PathBuf,
    },
    /// Huge page pool raised.
    HugePages {
        /// Pool size before the change.
        previous: u64,
        /// Pages actually added.
        reserved: u64,
    },
    /// Resource provided by a caller-defined factory.
    Custom(String),
}

// ============================================================================
// SECTION: Traits
// ============================================================================

/// Acquires one resource.
pub trait ResourceFactory {
    /// Acquires the resource, updating `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when acquisition fails; nothing must remain
    /// acquired in that case.
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError>;
}

/// An acquired resource and its inverse action.
pub trait Resource {
    /// Describes what was acquired.
    fn acquired(&self) -> AcquiredResource;

    /// Releases the resource, updating `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the inverse action fails.
    fn release(self: Box<Self>, state: &mut ProvisionState) -> Result<(), ProvisionError>;
}

/// Entry on the provisioner stack.
pub struct ResourceHandle {
    /// Acquisition sequence number, starting at 1.
    pub seq: u64,
    /// What was acquired.
    pub acquired: AcquiredResource,
    /// Inverse action.
    resource: Box<dyn Resource>,
}

/// A release that failed during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    /// Sequence number of the handle.
    pub seq: u64,
    /// What was being released.
    pub acquired: AcquiredResource,
    /// Why release failed.
    pub error: ProvisionError,
}

// ============================================================================
// SECTION: Provisioner
// ============================================================================

/// Stack of acquired resources owned by one process.
///
/// # Invariants
/// - Handles are released in reverse acquisition order.
/// - Only the process that created the provisioner releases; forked copies
///   leave the stack untouched.
pub struct Provisioner {
    /// Creating process.
    owner: Pid,
    /// Next sequence number.
    next_seq: u64,
    /// Acquired handles, oldest first.
    stack: Vec<ResourceHandle>,
    /// Accumulated state.
    state: ProvisionState,
}

impl Provisioner {
    /// Creates an empty provisioner owned by the calling process.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: getpid(),
            next_seq: 1,
            stack: Vec::new(),
            state: ProvisionState::default(),
        }
    }

    /// Returns the accumulated state.
    #[must_use]
    pub const fn state(&self) -> &ProvisionState {
        &self.state
    }

    /// Selects the filesystem for subsequent format and mount requests.
    pub fn set_fs_type(&mut self, fs_type: Option<String>) {
        self.state.fs_type = fs_type;
    }

    /// Returns acquired handles, oldest first.
    pub fn handles(&self) -> impl Iterator<Item = (u64, &AcquiredResource)> {
        self.stack.iter().map(|handle| (handle.seq, &handle.acquired))
    }

    /// Acquires a resource and pushes it onto the stack.
    ///
    /// # Errors
    ///
    /// Returns the factory's [`ProvisionError`]; the stack is unchanged.
    pub fn acquire(&mut self, factory: &dyn ResourceFactory) -> Result<AcquiredResource, ProvisionError> {
        let resource = factory.acquire(&mut self.state)?;
        let acquired = resource.acquired();
        self.stack.push(ResourceHandle {
            seq: self.next_seq,
            acquired: acquired.clone(),
            resource,
        });
        self.next_seq += 1;
        Ok(acquired)
    }

    /// Returns a mark for [`Provisioner::release_to`].
    #[must_use]
    pub fn mark(&self) -> usize {
        self.stack.len()
    }

    /// Releases every handle acquired after `mark`, newest first.
    pub fn release_to(&mut self, mark: usize) -> Vec<ReleaseFailure> {
        let mut failures = Vec::new();
        if self.owner != getpid() {
            return failures;
        }
        while self.stack.len() > mark {
            let Some(handle) = self.stack.pop() else {
                break;
            };
            let ResourceHandle {
                seq,
                acquired,
                resource,
            } = handle;
            if let Err(error) = resource.release(&mut self.state) {
                failures.push(ReleaseFailure {
                    seq,
                    acquired,
                    error,
                });
            }
        }
        failures
    }

    /// Releases everything, newest first.
    pub fn teardown(&mut self) -> Vec<ReleaseFailure> {
        self.release_to(0)
    }
}

impl Default for Provisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Provisioner {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
