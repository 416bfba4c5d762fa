// crates/kconform-core/src/probe.rs
// ============================================================================
// Module: System Probe
// Description: Prerequisite discovery behind a narrow trait.
// Purpose: Let the driver check preconditions without touching the host in tests.
// Dependencies: nix, thiserror, kconform-config
// ============================================================================

//! ## Overview
//! [`SystemProbe`] answers the questions the driver asks before acquiring
//! anything: who am I, which kernel and architecture, which commands,
//! kernel options, drivers and filesystems exist. [`HostProbe`] answers them
//! from `/proc`, `/sys`, `/lib/modules`, `/boot` and `PATH`.
//! Invariants:
//! - Probing never mutates the host.
//! - Unreadable sources surface as [`ProbeError`], never as "supported".

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use kconform_config::PathsConfig;
use nix::sys::utsname::uname;
use nix::unistd::geteuid;
use thiserror::Error;

use crate::descriptor::CgroupVersion;
use crate::provision::caps;
use crate::provision::cgroup::CgroupMounts;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Probe errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// A host source could not be read.
    #[error("cannot read {source_name}: {reason}")]
    Unreadable {
        /// Path or facility that failed.
        source_name: String,
        /// OS error text.
        reason: String,
    },
    /// A host source had unexpected contents.
    #[error("cannot parse {source_name}: {reason}")]
    Malformed {
        /// Path or facility that failed.
        source_name: String,
        /// Parse failure description.
        reason: String,
    },
}

// ============================================================================
// SECTION: Kernel Version
// ============================================================================

/// Kernel version triple parsed from a release string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch level.
    pub patch: u32,
}

impl KernelVersion {
    /// Parses `5.15.0-91-generic` or `6.1` style release strings.
    #[must_use]
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split(['.', '-', '+', '_']);
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(leading_number).unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parses the leading decimal digits of `part`.
fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

// ============================================================================
// SECTION: Probe Trait
// ============================================================================

/// Prerequisite discovery seam.
pub trait SystemProbe {
    /// Effective user id.
    fn euid(&self) -> u32;

    /// Kernel release string (`uname -r`).
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the release cannot be read.
    fn kernel_release(&self) -> Result<String, ProbeError>;

    /// Machine architecture (`uname -m`).
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the architecture cannot be read.
    fn machine(&self) -> Result<String, ProbeError>;

    /// True when `command` is an executable on `PATH`.
    fn has_command(&self, command: &str) -> bool;

    /// Value of a kernel config option, `None` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when no kernel config can be read.
    fn kconfig(&self, option: &str) -> Result<Option<String>, ProbeError>;

    /// True when a driver is loaded, built in, or available as a module.
    fn has_driver(&self, driver: &str) -> bool;

    /// Number of online CPUs.
    fn online_cpus(&self) -> u32;

    /// `MemAvailable` in MiB.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when meminfo cannot be parsed.
    fn mem_available_mb(&self) -> Result<u64, ProbeError>;

    /// True when the kernel and userspace support `fs_type`.
    fn filesystem_supported(&self, fs_type: &str) -> bool;

    /// Kernel taint mask.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the taint file cannot be read.
    fn tainted(&self) -> Result<u64, ProbeError>;

    /// Permitted capability set of this process.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when capget fails.
    fn permitted_capabilities(&self) -> Result<u64, ProbeError>;

    /// True when a cgroup hierarchy of `version` with `controllers` exists.
    fn cgroup_available(&self, version: CgroupVersion, controllers: &[String]) -> bool;
}

// ============================================================================
// SECTION: Host Probe
// ============================================================================

/// Probe reading the running host.
#[derive(Debug, Clone)]
pub struct HostProbe {
    /// procfs mount point.
    proc_root: PathBuf,
    /// sysfs mount point.
    sys_root: PathBuf,
    /// Explicit kernel config path.
    kconfig: Option<PathBuf>,
}

impl HostProbe {
    /// Creates a host probe from the path configuration.
    #[must_use]
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            proc_root: paths.proc_root.clone(),
            sys_root: paths.sys_root.clone(),
            kconfig: paths.kconfig.clone(),
        }
    }

    /// Reads a procfs file as text.
    fn read_proc(&self, relative: &str) -> Result<String, ProbeError> {
        read_text(&self.proc_root.join(relative))
    }

    /// Returns the kernel config file to consult.
    fn kconfig_path(&self) -> Result<PathBuf, ProbeError> {
        if let Some(path) = &self.kconfig {
            return Ok(path.clone());
        }
        let release = self.kernel_release()?;
        Ok(PathBuf::from(format!("/boot/config-{release}")))
    }

    /// Returns module names listed in a modules.* index file.
    fn module_index_contains(&self, file: &str, driver: &str) -> bool {
        let Ok(release) = self.kernel_release() else {
            return false;
        };
        let path = Path::new("/lib/modules").join(release).join(file);
        let Ok(contents) = fs::read_to_string(path) else {
            return false;
        };
        contents.lines().any(|line| {
            let module_path = line.split(':').next().unwrap_or_default();
            module_name(module_path) == normalize_module(driver)
        })
    }
}

/// Reads a text file, mapping errors to [`ProbeError::Unreadable`].
fn read_text(path: &Path) -> Result<String, ProbeError> {
    fs::read_to_string(path).map_err(|err| ProbeError::Unreadable {
        source_name: path.display().to_string(),
        reason: err.to_string(),
    })
}

/// Extracts the module name from `kernel/fs/xfs/xfs.ko.zst`.
fn module_name(module_path: &str) -> String {
    let file = module_path.rsplit('/').next().unwrap_or_default();
    let stem = file.split(".ko").next().unwrap_or_default();
    normalize_module(stem)
}

/// Module names treat `-` and `_` as equivalent.
fn normalize_module(name: &str) -> String {
    name.replace('-', "_")
}

/// Parses a `KEY=value` line of a kernel config.
fn parse_kconfig_line<'a>(line: &'a str, option: &str) -> Option<&'a str> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("# ") {
        if rest.strip_prefix(option).is_some_and(|tail| tail == " is not set") {
            return Some("n");
        }
        return None;
    }
    let (key, value) = line.split_once('=')?;
    (key == option).then_some(value)
}

impl SystemProbe for HostProbe {
    fn euid(&self) -> u32 {
        geteuid().as_raw()
    }

    fn kernel_release(&self) -> Result<String, ProbeError> {
        let uts = uname().map_err(|err| ProbeError::Unreadable {
            source_name: "uname".to_string(),
            reason: err.to_string(),
        })?;
        Ok(uts.release().to_string_lossy().into_owned())
    }

    fn machine(&self) -> Result<String, ProbeError> {
        let uts = uname().map_err(|err| ProbeError::Unreadable {
            source_name: "uname".to_string(),
            reason: err.to_string(),
        })?;
        Ok(uts.machine().to_string_lossy().into_owned())
    }

    fn has_command(&self, command: &str) -> bool {
        let Some(path) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&path).any(|dir| {
            fs::metadata(dir.join(command))
                .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        })
    }

    fn kconfig(&self, option: &str) -> Result<Option<String>, ProbeError> {
        let contents = read_text(&self.kconfig_path()?)?;
        Ok(contents
            .lines()
            .find_map(|line| parse_kconfig_line(line, option))
            .filter(|value| *value != "n")
            .map(str::to_string))
    }

    fn has_driver(&self, driver: &str) -> bool {
        let wanted = normalize_module(driver);
        let loaded = self.read_proc("modules").is_ok_and(|modules| {
            modules.lines().any(|line| line.split_whitespace().next() == Some(wanted.as_str()))
        });
        loaded
            || self.sys_root.join("module").join(&wanted).exists()
            || self.module_index_contains("modules.builtin", driver)
            || self.module_index_contains("modules.dep", driver)
    }

    fn online_cpus(&self) -> u32 {
        std::thread::available_parallelism()
            .ok()
            .and_then(|count| u32::try_from(count.get()).ok())
            .unwrap_or(1)
    }

    fn mem_available_mb(&self) -> Result<u64, ProbeError> {
        let meminfo = self.read_proc("meminfo")?;
        let kib = meminfo
            .lines()
            .find_map(|line| line.strip_prefix("MemAvailable:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| ProbeError::Malformed {
                source_name: "meminfo".to_string(),
                reason: "MemAvailable missing".to_string(),
            })?;
        Ok(kib / 1_024)
    }

    fn filesystem_supported(&self, fs_type: &str) -> bool {
        let in_kernel = self.read_proc("filesystems").is_ok_and(|filesystems| {
            filesystems.lines().any(|line| line.split_whitespace().last() == Some(fs_type))
        }) || self.has_driver(fs_type);
        if !in_kernel {
            return false;
        }
        fs_type == "tmpfs" || self.has_command(&format!("mkfs.{fs_type}"))
    }

    fn tainted(&self) -> Result<u64, ProbeError> {
        let text = self.read_proc("sys/kernel/tainted")?;
        text.trim().parse().map_err(|_| ProbeError::Malformed {
            source_name: "sys/kernel/tainted".to_string(),
            reason: format!("'{}' is not a number", text.trim()),
        })
    }

    fn permitted_capabilities(&self) -> Result<u64, ProbeError> {
        caps::current().map(|set| set.permitted).map_err(|err| ProbeError::Unreadable {
            source_name: "capget".to_string(),
            reason: err.to_string(),
        })
    }

    fn cgroup_available(&self, version: CgroupVersion, controllers: &[String]) -> bool {
        self.read_proc("self/mounts")
            .ok()
            .map(|mounts| CgroupMounts::parse(&mounts))
            .is_some_and(|mounts| mounts.select(version, controllers).is_some())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
