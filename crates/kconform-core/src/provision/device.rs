// crates/kconform-core/src/provision/device.rs
// ============================================================================
// Module: Block Device
// Description: Configured block device or a loop device over a backing file.
// Purpose: Give filesystem tests a device they may format and mount.
// Dependencies: nix (ioctl)
// ============================================================================

//! ## Overview
//! When `device.path` is configured that device is used as is. Otherwise a
//! sparse backing file is created in the scratch directory and attached to
//! a free loop device through `/dev/loop-control`.
//! Invariants:
//! - A missing loop facility is UNSUPPORTED; failing ioctls are BROKEN.
//! - Release detaches only loop devices this factory attached.

#![allow(unsafe_code, reason = "Loop device control is only reachable through ioctl(2).")]

use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::ioctl_none_bad;
use nix::ioctl_write_int_bad;

use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label.
const RESOURCE: &str = "block device";
/// Loop control node.
const LOOP_CONTROL: &str = "/dev/loop-control";
/// Bytes per MiB.
const MIB: u64 = 1_024 * 1_024;
/// Attempts to grab a free loop device before giving up.
const LOOP_ATTEMPTS: u32 = 5;

ioctl_none_bad!(
    /// `LOOP_CTL_GET_FREE`: returns the index of a free loop device.
    loop_ctl_get_free,
    0x4C82
);
ioctl_write_int_bad!(
    /// `LOOP_SET_FD`: attaches a backing file descriptor.
    loop_set_fd,
    0x4C00
);
ioctl_none_bad!(
    /// `LOOP_CLR_FD`: detaches the backing file.
    loop_clr_fd,
    0x4C01
);

/// Provides a block device.
#[derive(Debug, Clone)]
pub struct DeviceFactory {
    /// Pre-provisioned device.
    configured: Option<PathBuf>,
    /// Backing file size for loop devices.
    size_mb: u64,
}

impl DeviceFactory {
    /// Creates a factory; `configured` wins over loop devices.
    #[must_use]
    pub const fn new(configured: Option<PathBuf>, size_mb: u64) -> Self {
        Self {
            configured,
            size_mb,
        }
    }

    /// Validates and returns the configured device.
    fn configured_device(path: &Path) -> Result<Box<dyn Resource>, ProvisionError> {
        let meta = std::fs::metadata(path)
            .map_err(|err| ProvisionError::failed(RESOURCE, format!("stat {}", path.display()), err))?;
        if !meta.file_type().is_block_device() {
            return Err(ProvisionError::failed(
                RESOURCE,
                format!("check {}", path.display()),
                "not a block device",
            ));
        }
        Ok(Box::new(BlockDevice {
            path: path.to_path_buf(),
            backing: None,
        }))
    }

    /// Attaches `backing` to a free loop device.
    fn attach_loop(backing: &File) -> Result<PathBuf, ProvisionError> {
        let control = OpenOptions::new().read(true).write(true).open(LOOP_CONTROL).map_err(|err| {
            ProvisionError::unavailable(RESOURCE, format!("cannot open {LOOP_CONTROL}: {err}"))
        })?;
        let mut last_error = String::from("no attempt made");
        for _ in 0 .. LOOP_ATTEMPTS {
            // SAFETY: `control` is an open loop-control descriptor; the request takes no argument.
            let index = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
                .map_err(|errno| ProvisionError::unavailable(RESOURCE, format!("no free loop device: {errno}")))?;
            let path = PathBuf::from(format!("/dev/loop{index}"));
            let device = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(device) => device,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    last_error = format!("{} missing", path.display());
                    continue;
                }
                Err(err) => return Err(ProvisionError::failed(RESOURCE, format!("open {}", path.display()), err)),
            };
            // SAFETY: both descriptors are open for the duration of the call.
            match unsafe { loop_set_fd(device.as_raw_fd(), backing.as_raw_fd()) } {
                Ok(_) => return Ok(path),
                Err(Errno::EBUSY) => last_error = format!("{} busy", path.display()),
                Err(errno) => {
                    return Err(ProvisionError::failed(RESOURCE, format!("LOOP_SET_FD {}", path.display()), errno));
                }
            }
        }
        Err(ProvisionError::unavailable(RESOURCE, last_error))
    }
}

impl ResourceFactory for DeviceFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        if let Some(path) = &self.configured {
            let resource = Self::configured_device(path)?;
            state.device = Some(path.clone());
            return Ok(resource);
        }
        let scratch = state
            .scratch_dir
            .clone()
            .ok_or_else(|| ProvisionError::failed(RESOURCE, "create backing file", "no scratch directory"))?;
        let backing_path = scratch.join("test_dev.img");
        let backing = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&backing_path)
            .map_err(|err| ProvisionError::failed(RESOURCE, "create backing file", err))?;
        let attached = backing
            .set_len(self.size_mb.saturating_mul(MIB))
            .map_err(|err| ProvisionError::failed(RESOURCE, "size backing file", err))
            .and_then(|()| Self::attach_loop(&backing));
        match attached {
            Ok(path) => {
                state.device = Some(path.clone());
                Ok(Box::new(BlockDevice {
                    path,
                    backing: Some(backing_path),
                }))
            }
            Err(err) => {
                let _ = std::fs::remove_file(&backing_path);
                Err(err)
            }
        }
    }
}

/// Acquired block device.
struct BlockDevice {
    /// Device node.
    path: PathBuf,
    /// Backing file when loop-backed.
    backing: Option<PathBuf>,
}

impl Resource for BlockDevice {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::Device {
            path: self.path.clone(),
            loop_backed: self.backing.is_some(),
        }
    }

    fn release(self: Box<Self>, state: &mut ProvisionState) -> Result<(), ProvisionError> {
        state.device = None;
        let Some(backing) = self.backing else {
            return Ok(());
        };
        let device = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|err| ProvisionError::failed(RESOURCE, format!("open {}", self.path.display()), err))?;
        // SAFETY: `device` is an open loop device descriptor; the request takes no argument.
        unsafe { loop_clr_fd(device.as_raw_fd()) }
            .map_err(|errno| ProvisionError::failed(RESOURCE, format!("LOOP_CLR_FD {}", self.path.display()), errno))?;
        std::fs::remove_file(&backing)
            .map_err(|err| ProvisionError::failed(RESOURCE, format!("remove {}", backing.display()), err))
    }
}
