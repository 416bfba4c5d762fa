// crates/kconform-core/src/provision/mount.rs
// ============================================================================
// Module: Format and Mount
// Description: mkfs on the test device, mount(2) and read-only filesystems.
// Purpose: Provide the filesystem a test operates on.
// Dependencies: nix (mount)
// ============================================================================

//! ## Overview
//! Formatting shells out to `mkfs.<fs>`; mounting uses `mount(2)` directly.
//! tmpfs needs neither a device nor mkfs. Unmounting retries while the
//! kernel reports `EBUSY`.
//! Invariants:
//! - Mount points live inside the scratch directory.
//! - A missing mkfs binary or kernel filesystem is UNSUPPORTED.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::mount::mount;
use nix::mount::umount;

use crate::descriptor::FormatRequest;
use crate::descriptor::MountRequest;
use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label for formatting.
const FORMAT: &str = "format";
/// Resource class label for mounting.
const MOUNT: &str = "mount";
/// Number of umount attempts while the filesystem is busy.
const UMOUNT_ATTEMPTS: u32 = 50;
/// Delay between umount attempts.
const UMOUNT_DELAY: Duration = Duration::from_millis(100);
/// Filesystem that is mounted without a device.
const TMPFS: &str = "tmpfs";

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the filesystem selected for this sub-run.
fn selected_fs(state: &ProvisionState, resource: &'static str) -> Result<String, ProvisionError> {
    state.fs_type.clone().ok_or_else(|| ProvisionError::failed(resource, "select filesystem", "none selected"))
}

/// Runs `mkfs.<fs_type>` on `device`.
fn run_mkfs(device: &Path, fs_type: &str, request: &FormatRequest) -> Result<(), ProvisionError> {
    let program = format!("mkfs.{fs_type}");
    let mut command = Command::new(&program);
    if matches!(fs_type, "xfs" | "btrfs") {
        command.arg("-f");
    }
    command.args(&request.mkfs_opts).arg(device).args(&request.mkfs_extra);
    let output = command.output().map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ProvisionError::unavailable(FORMAT, format!("{program} not found"))
        } else {
            ProvisionError::failed(FORMAT, program.clone(), err)
        }
    })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ProvisionError::failed(FORMAT, format!("{program} {}", device.display()), stderr.trim()))
}

/// Mounts `fs_type` at `target`.
fn mount_fs(
    device: Option<&Path>,
    target: &Path,
    fs_type: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), ProvisionError> {
    let source = if fs_type == TMPFS { Some(Path::new("kconform")) } else { device };
    if source.is_none() {
        return Err(ProvisionError::failed(MOUNT, format!("mount {fs_type}"), "no device"));
    }
    mount(source, target, Some(fs_type), flags, data).map_err(|errno| match errno {
        Errno::ENODEV => ProvisionError::unavailable(MOUNT, format!("kernel does not support {fs_type}")),
        errno => ProvisionError::failed(MOUNT, format!("mount {fs_type} at {}", target.display()), errno),
    })
}

/// Unmounts `target`, retrying while busy.
fn umount_with_retries(target: &Path) -> Result<(), ProvisionError> {
    let mut attempt = 0;
    loop {
        match umount(target) {
            Ok(()) => return Ok(()),
            Err(Errno::EBUSY) if attempt + 1 < UMOUNT_ATTEMPTS => {
                attempt += 1;
                thread::sleep(UMOUNT_DELAY);
            }
            Err(errno) => {
                return Err(ProvisionError::failed(MOUNT, format!("umount {}", target.display()), errno));
            }
        }
    }
}

/// Creates the mount point under the scratch directory.
fn prepare_target(state: &ProvisionState, mount_point: &Path) -> Result<PathBuf, ProvisionError> {
    let scratch = state
        .scratch_dir
        .as_ref()
        .ok_or_else(|| ProvisionError::failed(MOUNT, "create mount point", "no scratch directory"))?;
    let target = scratch.join(mount_point);
    fs::create_dir_all(&target)
        .map_err(|err| ProvisionError::failed(MOUNT, format!("create {}", target.display()), err))?;
    Ok(target)
}

// ============================================================================
// SECTION: Format
// ============================================================================

/// Formats the device with the selected filesystem.
#[derive(Debug, Clone)]
pub struct FormatFactory {
    /// mkfs arguments.
    request: FormatRequest,
}

impl FormatFactory {
    /// Creates a format factory.
    #[must_use]
    pub const fn new(request: FormatRequest) -> Self {
        Self {
            request,
        }
    }
}

impl ResourceFactory for FormatFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let fs_type = selected_fs(state, FORMAT)?;
        let device = state.device.clone().unwrap_or_default();
        if fs_type != TMPFS {
            if state.device.is_none() {
                return Err(ProvisionError::failed(FORMAT, format!("mkfs.{fs_type}"), "no device"));
            }
            run_mkfs(&device, &fs_type, &self.request)?;
        }
        Ok(Box::new(Formatted {
            device,
            fs_type,
        }))
    }
}

/// Formatted device; release has nothing to undo.
struct Formatted {
    /// Device node.
    device: PathBuf,
    /// Filesystem written.
    fs_type: String,
}

impl Resource for Formatted {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::Formatted {
            device: self.device.clone(),
            fs_type: self.fs_type.clone(),
        }
    }

    fn release(self: Box<Self>, _state: &mut ProvisionState) -> Result<(), ProvisionError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Mount
// ============================================================================

/// Mounts the selected filesystem inside the scratch directory.
#[derive(Debug, Clone)]
pub struct MountFactory {
    /// Mount request.
    request: MountRequest,
}

impl MountFactory {
    /// Creates a mount factory.
    #[must_use]
    pub const fn new(request: MountRequest) -> Self {
        Self {
            request,
        }
    }
}

impl ResourceFactory for MountFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let fs_type = selected_fs(state, MOUNT)?;
        let target = prepare_target(state, &self.request.mount_point)?;
        mount_fs(state.device.as_deref(), &target, &fs_type, self.request.flags, self.request.data.as_deref())?;
        state.mount_point = Some(target.clone());
        Ok(Box::new(Mounted {
            target,
            fs_type,
        }))
    }
}

/// Mounted filesystem.
struct Mounted {
    /// Mount point.
    target: PathBuf,
    /// Filesystem type.
    fs_type: String,
}

impl Resource for Mounted {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::Mount {
            target: self.target.clone(),
            fs_type: self.fs_type.clone(),
        }
    }

    fn release(self: Box<Self>, state: &mut ProvisionState) -> Result<(), ProvisionError> {
        state.mount_point = None;
        umount_with_retries(&self.target)
    }
}

// ============================================================================
// SECTION: Read-Only Filesystem
// ============================================================================

/// Mounts a read-only filesystem: tmpfs, or the formatted device as fallback.
#[derive(Debug, Clone)]
pub struct ReadOnlyFsFactory {
    /// Mount point relative to the scratch directory.
    mount_point: PathBuf,
}

impl ReadOnlyFsFactory {
    /// Creates a read-only filesystem factory.
    #[must_use]
    pub const fn new(mount_point: PathBuf) -> Self {
        Self {
            mount_point,
        }
    }
}

impl ResourceFactory for ReadOnlyFsFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let target = prepare_target(state, &self.mount_point)?;
        let fs_type = match mount_fs(None, &target, TMPFS, MsFlags::MS_RDONLY, None) {
            Ok(()) => TMPFS.to_string(),
            Err(tmpfs_error) => {
                let (Some(device), Some(fs_type)) = (state.device.clone(), state.fs_type.clone()) else {
                    return Err(tmpfs_error);
                };
                run_mkfs(&device, &fs_type, &FormatRequest::default())?;
                mount_fs(Some(&device), &target, &fs_type, MsFlags::MS_RDONLY, None)?;
                fs_type
            }
        };
        state.mount_point = Some(target.clone());
        Ok(Box::new(Mounted {
            target,
            fs_type,
        }))
    }
}
