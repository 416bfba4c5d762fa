// crates/kconform-config/src/lib.rs
// ============================================================================
// Module: kconform Config Library
// Description: Harness configuration model, loading, and validation.
// Purpose: Provide a single fail-closed source of harness tunables.
// Dependencies: serde, thiserror, toml
// ============================================================================

//! ## Overview
//! `kconform-config` owns the [`HarnessConfig`] model consumed by the
//! orchestration engine. Configuration is read from an optional TOML file and
//! then overridden by `KCONFORM_*` environment variables.
//! Invariants:
//! - Loading is fail-closed: oversized, non-UTF-8 or unknown-key inputs are rejected.
//! - [`HarnessConfig::validate`] runs after every override is applied.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod overrides;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::CheckpointConfig;
pub use config::ColorMode;
pub use config::ConfigError;
pub use config::DeviceConfig;
pub use config::HarnessConfig;
pub use config::MAX_CONFIG_FILE_BYTES;
pub use config::OutputConfig;
pub use config::PathsConfig;
pub use config::SupervisorConfig;
pub use config::TimeoutConfig;
pub use overrides::CONFIG_PATH_ENV;
pub use overrides::EnvOverrides;
