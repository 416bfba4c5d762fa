// crates/kconform-config/src/overrides.rs
// ============================================================================
// Module: Environment Overrides
// Description: KCONFORM_* environment variables layered over file configuration.
// Purpose: Let CI and wrappers tune a run without editing configuration files.
// Dependencies: crate::config
// ============================================================================

//! ## Overview
//! Environment overrides are captured once into an [`EnvOverrides`] snapshot
//! and then applied to a [`HarnessConfig`]. Capturing first keeps application
//! deterministic and lets tests supply explicit values.
//! Invariants:
//! - Only the variables listed in [`OVERRIDE_KEYS`] are read.
//! - Malformed values are rejected, never ignored.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::ColorMode;
use crate::config::ConfigError;
use crate::config::HarnessConfig;

// ============================================================================
// SECTION: Variable Names
// ============================================================================

/// Path of the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "KCONFORM_CONFIG";
/// Global timeout multiplier.
const TIMEOUT_MUL_ENV: &str = "KCONFORM_TIMEOUT_MUL";
/// Runtime multiplier.
const RUNTIME_MUL_ENV: &str = "KCONFORM_RUNTIME_MUL";
/// Scratch directory parent.
const TMPDIR_ENV: &str = "TMPDIR";
/// Plain-text kernel config location.
const KCONFIG_ENV: &str = "KCONFORM_KCONFIG";
/// Pre-provisioned block device.
const DEV_ENV: &str = "KCONFORM_DEV";
/// Default filesystem for formatted devices.
const DEV_FS_TYPE_ENV: &str = "KCONFORM_DEV_FS_TYPE";
/// Single filesystem restriction for all-filesystem iteration.
const SINGLE_FS_TYPE_ENV: &str = "KCONFORM_SINGLE_FS_TYPE";
/// Colour policy.
const COLORIZE_ENV: &str = "KCONFORM_COLORIZE_OUTPUT";
/// JSON-lines result log.
const JSON_LOG_ENV: &str = "KCONFORM_JSON_LOG";

/// Every environment variable consulted by [`EnvOverrides::from_process`].
pub const OVERRIDE_KEYS: &[&str] = &[
    TIMEOUT_MUL_ENV,
    RUNTIME_MUL_ENV,
    TMPDIR_ENV,
    KCONFIG_ENV,
    DEV_ENV,
    DEV_FS_TYPE_ENV,
    SINGLE_FS_TYPE_ENV,
    COLORIZE_ENV,
    JSON_LOG_ENV,
];

// ============================================================================
// SECTION: Overrides
// ============================================================================

/// Snapshot of override variables.
///
/// # Invariants
/// - Empty values are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// Captured variable values keyed by name.
    values: BTreeMap<String, String>,
}

impl EnvOverrides {
    /// Captures override variables from the process environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self::from_pairs(OVERRIDE_KEYS.iter().filter_map(|key| {
            std::env::var(key).ok().map(|value| ((*key).to_string(), value))
        }))
    }

    /// Builds a snapshot from explicit pairs.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        Self {
            values,
        }
    }

    /// Returns the captured value for `key`.
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Applies the captured overrides to `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value cannot be parsed.
    pub fn apply(&self, config: &mut HarnessConfig) -> Result<(), ConfigError> {
        if let Some(value) = self.get(TIMEOUT_MUL_ENV) {
            config.timeout.multiplier = parse_multiplier(TIMEOUT_MUL_ENV, value)?;
        }
        if let Some(value) = self.get(RUNTIME_MUL_ENV) {
            config.timeout.runtime_multiplier = parse_multiplier(RUNTIME_MUL_ENV, value)?;
        }
        if let Some(value) = self.get(TMPDIR_ENV) {
            config.paths.tmpdir = PathBuf::from(value);
        }
        if let Some(value) = self.get(KCONFIG_ENV) {
            config.paths.kconfig = Some(PathBuf::from(value));
        }
        if let Some(value) = self.get(DEV_ENV) {
            config.device.path = Some(PathBuf::from(value));
        }
        if let Some(value) = self.get(DEV_FS_TYPE_ENV) {
            config.device.fs_type = value.to_string();
        }
        if let Some(value) = self.get(SINGLE_FS_TYPE_ENV) {
            config.device.single_fs_type = Some(value.to_string());
        }
        if let Some(value) = self.get(COLORIZE_ENV) {
            config.output.color = ColorMode::parse(value).ok_or_else(|| {
                ConfigError::Invalid(format!("{COLORIZE_ENV} must be auto, always, never, 0 or 1"))
            })?;
        }
        if let Some(value) = self.get(JSON_LOG_ENV) {
            config.output.json_log = Some(PathBuf::from(value));
        }
        Ok(())
    }
}

/// Parses a floating point multiplier.
fn parse_multiplier(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::Invalid(format!("invalid {key} value '{value}'")))
}
