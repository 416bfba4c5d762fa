//! Environment override tests for kconform-config.
// crates/kconform-config/tests/override_validation.rs
// =============================================================================
// Module: Environment Override Tests
// Description: Validate KCONFORM_* overrides and post-override validation.
// Purpose: Ensure malformed overrides fail closed and valid ones take effect.
// =============================================================================

use std::path::PathBuf;

use kconform_config::ColorMode;
use kconform_config::ConfigError;
use kconform_config::EnvOverrides;
use kconform_config::HarnessConfig;

type TestResult = Result<(), String>;

fn apply(pairs: &[(&str, &str)]) -> Result<HarnessConfig, ConfigError> {
    let mut config = HarnessConfig::default();
    EnvOverrides::from_pairs(pairs.iter().copied()).apply(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn assert_invalid(result: Result<HarnessConfig, ConfigError>, needle: &str) -> TestResult {
    match result {
        Err(error) => {
            let message = error.to_string();
            if message.contains(needle) {
                Ok(())
            } else {
                Err(format!("error {message} did not contain {needle}"))
            }
        }
        Ok(_) => Err("expected invalid override".to_string()),
    }
}

#[test]
fn timeout_multiplier_override_applies() -> TestResult {
    let config = apply(&[("KCONFORM_TIMEOUT_MUL", "3")]).map_err(|err| err.to_string())?;
    if (config.timeout.multiplier - 3.0).abs() > f64::EPSILON {
        return Err(format!("unexpected multiplier {}", config.timeout.multiplier));
    }
    Ok(())
}

#[test]
fn timeout_multiplier_below_one_rejected() -> TestResult {
    assert_invalid(apply(&[("KCONFORM_TIMEOUT_MUL", "0.5")]), "timeout.multiplier")
}

#[test]
fn timeout_multiplier_garbage_rejected() -> TestResult {
    assert_invalid(apply(&[("KCONFORM_TIMEOUT_MUL", "fast")]), "invalid KCONFORM_TIMEOUT_MUL")
}

#[test]
fn empty_values_are_ignored() -> TestResult {
    let config = apply(&[("KCONFORM_TIMEOUT_MUL", ""), ("KCONFORM_DEV", "")])
        .map_err(|err| err.to_string())?;
    if config != HarnessConfig::default() {
        return Err("empty overrides must not change the config".to_string());
    }
    Ok(())
}

#[test]
fn device_overrides_apply() -> TestResult {
    let config = apply(&[
        ("KCONFORM_DEV", "/dev/vdb"),
        ("KCONFORM_DEV_FS_TYPE", "ext4"),
        ("KCONFORM_SINGLE_FS_TYPE", "xfs"),
    ])
    .map_err(|err| err.to_string())?;
    if config.device.path != Some(PathBuf::from("/dev/vdb")) {
        return Err("device path override missing".to_string());
    }
    if config.device.fs_type != "ext4" {
        return Err("device fs override missing".to_string());
    }
    if config.device.single_fs_type.as_deref() != Some("xfs") {
        return Err("single fs override missing".to_string());
    }
    Ok(())
}

#[test]
fn relative_device_path_rejected() -> TestResult {
    assert_invalid(apply(&[("KCONFORM_DEV", "vdb")]), "device.path must be an absolute path")
}

#[test]
fn relative_tmpdir_rejected() -> TestResult {
    assert_invalid(apply(&[("TMPDIR", "scratch")]), "paths.tmpdir must be an absolute path")
}

#[test]
fn colorize_flag_accepts_numeric_labels() -> TestResult {
    let config = apply(&[("KCONFORM_COLORIZE_OUTPUT", "1")]).map_err(|err| err.to_string())?;
    if config.output.color != ColorMode::Always {
        return Err("expected always colour".to_string());
    }
    assert_invalid(apply(&[("KCONFORM_COLORIZE_OUTPUT", "rainbow")]), "KCONFORM_COLORIZE_OUTPUT")
}

#[test]
fn invalid_single_fs_name_rejected() -> TestResult {
    assert_invalid(
        apply(&[("KCONFORM_SINGLE_FS_TYPE", "../ext4")]),
        "device.single_fs_type contains invalid characters",
    )
}
