// crates/kconform-config/src/config.rs
// ============================================================================
// Module: Harness Configuration Model
// Description: Typed configuration sections, defaults, loading, and validation.
// Purpose: Give the orchestration engine validated, fail-closed tunables.
// Dependencies: serde, thiserror, toml
// ============================================================================

//! ## Overview
//! [`HarnessConfig`] groups the tunables of the harness into sections
//! (timeouts, paths, devices, output, checkpoints, supervision). Every field
//! has a default so an empty file, or no file at all, is a valid configuration.
//! Invariants:
//! - Unknown keys are rejected at parse time.
//! - Numeric limits are enforced by [`HarnessConfig::validate`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::overrides::CONFIG_PATH_ENV;
use crate::overrides::EnvOverrides;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum accepted configuration file size in bytes.
pub const MAX_CONFIG_FILE_BYTES: u64 = 1_048_576;
/// Maximum accepted configuration path length in bytes.
const MAX_PATH_BYTES: usize = 4_096;
/// Maximum accepted length for a single path component.
const MAX_PATH_COMPONENT_BYTES: usize = 255;
/// Upper bound for the default per-test timeout (one week).
const MAX_DEFAULT_TIMEOUT_SECS: u64 = 7 * 24 * 3_600;
/// Upper bound for the global timeout multipliers.
const MAX_MULTIPLIER: f64 = 1_000.0;
/// Upper bound for checkpoint timeouts (one hour).
const MAX_CHECKPOINT_TIMEOUT_MS: u64 = 3_600_000;
/// Upper bound for the supervision poll interval.
const MAX_POLL_INTERVAL_MS: u64 = 1_000;
/// Lower bound for the interval between SIGKILL retries.
const MIN_KILL_RETRY_INTERVAL_MS: u64 = 100;
/// Maximum accepted length for a filesystem type name.
const MAX_FS_NAME_BYTES: usize = 32;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading and validation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// Configuration file failed to parse.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Configuration value is invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// Timeout scaling settings.
///
/// # Invariants
/// - `multiplier` is finite and at least 1.
/// - `runtime_multiplier` is finite and positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutConfig {
    /// Timeout applied when a descriptor does not override it, in seconds.
    pub default_secs: u64,
    /// Global scaling factor applied to every timeout.
    pub multiplier: f64,
    /// Scaling factor applied to declared runtimes.
    pub runtime_multiplier: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 300,
            multiplier: 1.0,
            runtime_multiplier: 1.0,
        }
    }
}

/// Filesystem locations used by the harness.
///
/// # Invariants
/// - All paths except `kconfig` are absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    /// Parent directory for scratch directories.
    pub tmpdir: PathBuf,
    /// Preferred directory for the shared execution region.
    pub shm_dir: PathBuf,
    /// Mount point of procfs.
    pub proc_root: PathBuf,
    /// Mount point of sysfs.
    pub sys_root: PathBuf,
    /// Optional kernel config file (plain text) used for kconfig checks.
    pub kconfig: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tmpdir: PathBuf::from("/tmp"),
            shm_dir: PathBuf::from("/dev/shm"),
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
            kconfig: None,
        }
    }
}

/// Block device and filesystem iteration settings.
///
/// # Invariants
/// - Filesystem names are non-empty, unique, and contain no path separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeviceConfig {
    /// Pre-provisioned block device; a loop device is created when absent.
    pub path: Option<PathBuf>,
    /// Filesystem used when a descriptor formats a device without naming one.
    pub fs_type: String,
    /// Minimum size of loop device backing files in MiB.
    pub default_size_mb: u64,
    /// Restricts all-filesystem iteration to a single filesystem.
    pub single_fs_type: Option<String>,
    /// Candidate filesystems for all-filesystem iteration, in order.
    pub filesystems: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: None,
            fs_type: "ext2".to_string(),
            default_size_mb: 300,
            single_fs_type: None,
            filesystems: ["ext2", "ext3", "ext4", "xfs", "btrfs", "vfat", "exfat", "ntfs", "tmpfs"]
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
        }
    }
}

/// Colour policy for human-readable result lines.
///
/// # Invariants
/// - Variants are stable for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// Colour only when stderr is a terminal.
    #[default]
    Auto,
    /// Always colour.
    Always,
    /// Never colour.
    Never,
}

impl ColorMode {
    /// Parses a colour policy from its configuration label or a `0`/`1` flag.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "auto" => Some(Self::Auto),
            "always" | "1" => Some(Self::Always),
            "never" | "0" => Some(Self::Never),
            _ => None,
        }
    }
}

/// Result output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputConfig {
    /// Colour policy for stderr result lines.
    pub color: ColorMode,
    /// Optional JSON-lines log of every result record.
    pub json_log: Option<PathBuf>,
    /// Print the summary block at exit.
    pub summary: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            color: ColorMode::Auto,
            json_log: None,
            summary: true,
        }
    }
}

/// Checkpoint defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CheckpointConfig {
    /// Timeout used by context checkpoint helpers, in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
        }
    }
}

/// Process supervision settings.
///
/// # Invariants
/// - `poll_interval_ms` is within `1..=1000`.
/// - `kill_retries` is at least 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SupervisorConfig {
    /// Mark the driver as child subreaper so orphaned descendants are swept.
    pub reap_orphans: bool,
    /// Interval between liveness polls of the test process.
    pub poll_interval_ms: u64,
    /// Number of SIGKILL attempts before giving up on a hung test.
    pub kill_retries: u32,
    /// Delay between SIGKILL attempts.
    pub kill_retry_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reap_orphans: true,
            poll_interval_ms: 10,
            kill_retries: 10,
            kill_retry_interval_ms: 5_000,
        }
    }
}

// ============================================================================
// SECTION: Harness Config
// ============================================================================

/// Complete harness configuration.
///
/// # Invariants
/// - A value returned by [`HarnessConfig::load`] has passed [`HarnessConfig::validate`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HarnessConfig {
    /// Timeout scaling.
    pub timeout: TimeoutConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Device and filesystem iteration.
    pub device: DeviceConfig,
    /// Result output.
    pub output: OutputConfig,
    /// Checkpoint defaults.
    pub checkpoint: CheckpointConfig,
    /// Process supervision.
    pub supervisor: SupervisorConfig,
}

impl HarnessConfig {
    /// Loads configuration from `path`, or from `KCONFORM_CONFIG` when `path`
    /// is `None`, applies process environment overrides, and validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let resolved = path.map(Path::to_path_buf).or(env_path);
        let mut config = match resolved {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        EnvOverrides::from_process().apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML file without applying overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the path or file contents are rejected.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        check_path(path)?;
        let metadata = fs::metadata(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if metadata.len() > MAX_CONFIG_FILE_BYTES {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Parses configuration from TOML text without applying overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout(&self.timeout)?;
        validate_paths(&self.paths)?;
        validate_device(&self.device)?;
        validate_checkpoint(&self.checkpoint)?;
        validate_supervisor(&self.supervisor)?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Validation
// ============================================================================

/// Rejects overly long paths before touching the filesystem.
fn check_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().len() > MAX_PATH_BYTES {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    if path.components().any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_BYTES)
    {
        return Err(ConfigError::Invalid("config path component too long".to_string()));
    }
    Ok(())
}

/// Validates timeout scaling.
fn validate_timeout(config: &TimeoutConfig) -> Result<(), ConfigError> {
    if config.default_secs == 0 || config.default_secs > MAX_DEFAULT_TIMEOUT_SECS {
        return Err(ConfigError::Invalid(
            "timeout.default_secs must be between 1 and 604800".to_string(),
        ));
    }
    if !config.multiplier.is_finite()
        || config.multiplier < 1.0
        || config.multiplier > MAX_MULTIPLIER
    {
        return Err(ConfigError::Invalid(format!(
            "timeout.multiplier must be between 1 and {MAX_MULTIPLIER}"
        )));
    }
    if !config.runtime_multiplier.is_finite()
        || config.runtime_multiplier <= 0.0
        || config.runtime_multiplier > MAX_MULTIPLIER
    {
        return Err(ConfigError::Invalid(format!(
            "timeout.runtime_multiplier must be positive and at most {MAX_MULTIPLIER}"
        )));
    }
    Ok(())
}

/// Validates filesystem locations.
fn validate_paths(config: &PathsConfig) -> Result<(), ConfigError> {
    for (label, path) in [
        ("paths.tmpdir", &config.tmpdir),
        ("paths.shm_dir", &config.shm_dir),
        ("paths.proc_root", &config.proc_root),
        ("paths.sys_root", &config.sys_root),
    ] {
        if !path.is_absolute() {
            return Err(ConfigError::Invalid(format!("{label} must be an absolute path")));
        }
        if path.as_os_str().len() > MAX_PATH_BYTES {
            return Err(ConfigError::Invalid(format!("{label} exceeds max length")));
        }
    }
    Ok(())
}

/// Validates a filesystem type name.
fn validate_fs_name(label: &str, name: &str) -> Result<(), ConfigError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed != name {
        return Err(ConfigError::Invalid(format!("{label} must be a non-empty name")));
    }
    if name.len() > MAX_FS_NAME_BYTES {
        return Err(ConfigError::Invalid(format!("{label} exceeds max length")));
    }
    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.') {
        return Err(ConfigError::Invalid(format!("{label} contains invalid characters")));
    }
    Ok(())
}

/// Validates device and filesystem iteration settings.
fn validate_device(config: &DeviceConfig) -> Result<(), ConfigError> {
    validate_fs_name("device.fs_type", &config.fs_type)?;
    if config.default_size_mb == 0 {
        return Err(ConfigError::Invalid("device.default_size_mb must be at least 1".to_string()));
    }
    if let Some(single) = &config.single_fs_type {
        validate_fs_name("device.single_fs_type", single)?;
    }
    if config.filesystems.is_empty() {
        return Err(ConfigError::Invalid("device.filesystems must not be empty".to_string()));
    }
    let mut seen = BTreeSet::new();
    for name in &config.filesystems {
        validate_fs_name("device.filesystems entry", name)?;
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "device.filesystems contains duplicate entry {name}"
            )));
        }
    }
    if let Some(path) = &config.path
        && !path.is_absolute()
    {
        return Err(ConfigError::Invalid("device.path must be an absolute path".to_string()));
    }
    Ok(())
}

/// Validates checkpoint defaults.
fn validate_checkpoint(config: &CheckpointConfig) -> Result<(), ConfigError> {
    if config.default_timeout_ms == 0 || config.default_timeout_ms > MAX_CHECKPOINT_TIMEOUT_MS {
        return Err(ConfigError::Invalid(
            "checkpoint.default_timeout_ms must be between 1 and 3600000".to_string(),
        ));
    }
    Ok(())
}

/// Validates supervision settings.
fn validate_supervisor(config: &SupervisorConfig) -> Result<(), ConfigError> {
    if config.poll_interval_ms == 0 || config.poll_interval_ms > MAX_POLL_INTERVAL_MS {
        return Err(ConfigError::Invalid(
            "supervisor.poll_interval_ms must be between 1 and 1000".to_string(),
        ));
    }
    if config.kill_retries == 0 {
        return Err(ConfigError::Invalid("supervisor.kill_retries must be at least 1".to_string()));
    }
    if config.kill_retry_interval_ms < MIN_KILL_RETRY_INTERVAL_MS {
        return Err(ConfigError::Invalid(
            "supervisor.kill_retry_interval_ms must be at least 100".to_string(),
        ));
    }
    Ok(())
}
