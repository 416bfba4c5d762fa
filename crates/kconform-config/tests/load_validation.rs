//! Config load validation tests for kconform-config.
// crates/kconform-config/tests/load_validation.rs
// =============================================================================
// Module: Config Load Validation Tests
// Description: Validate config loading guards (path, size, encoding, keys).
// Purpose: Ensure config input handling is strict and fail-closed.
// =============================================================================

use std::io::Write;
use std::path::Path;

use kconform_config::ColorMode;
use kconform_config::ConfigError;
use kconform_config::HarnessConfig;
use tempfile::NamedTempFile;

type TestResult = Result<(), String>;

fn assert_invalid<T>(result: Result<T, ConfigError>, needle: &str) -> TestResult {
    match result {
        Err(error) => {
            let message = error.to_string();
            if message.contains(needle) {
                Ok(())
            } else {
                Err(format!("error {message} did not contain {needle}"))
            }
        }
        Ok(_) => Err("expected invalid config".to_string()),
    }
}

fn write_config(contents: &[u8]) -> Result<NamedTempFile, String> {
    let mut file = NamedTempFile::new().map_err(|err| err.to_string())?;
    file.write_all(contents).map_err(|err| err.to_string())?;
    Ok(file)
}

#[test]
fn defaults_are_valid() -> TestResult {
    HarnessConfig::default().validate().map_err(|err| err.to_string())
}

#[test]
fn from_file_rejects_path_too_long() -> TestResult {
    let long_path = "a".repeat(5_000);
    assert_invalid(HarnessConfig::from_file(Path::new(&long_path)), "config path exceeds max length")
}

#[test]
fn from_file_rejects_path_component_too_long() -> TestResult {
    let long_component = "a".repeat(300);
    assert_invalid(
        HarnessConfig::from_file(Path::new(&long_component)),
        "config path component too long",
    )
}

#[test]
fn from_file_rejects_oversized_file() -> TestResult {
    let file = write_config(&vec![b'#'; 1_048_577])?;
    assert_invalid(HarnessConfig::from_file(file.path()), "config file exceeds size limit")
}

#[test]
fn from_file_rejects_non_utf8_file() -> TestResult {
    let file = write_config(&[0xFF, 0xFE, 0xFF])?;
    assert_invalid(HarnessConfig::from_file(file.path()), "config file must be utf-8")
}

#[test]
fn from_file_rejects_unknown_keys() -> TestResult {
    let file = write_config(b"[timeout]\nmultiplier = 2.0\nbogus = 1\n")?;
    assert_invalid(HarnessConfig::from_file(file.path()), "config parse error")
}

#[test]
fn from_file_reads_sections() -> TestResult {
    let file = write_config(
        b"[timeout]\ndefault_secs = 60\nmultiplier = 2.5\n\n[device]\nfilesystems = [\"ext4\", \"tmpfs\"]\n\n[output]\ncolor = \"never\"\n",
    )?;
    let config = HarnessConfig::from_file(file.path()).map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    if config.timeout.default_secs != 60 {
        return Err(format!("unexpected default_secs {}", config.timeout.default_secs));
    }
    if (config.timeout.multiplier - 2.5).abs() > f64::EPSILON {
        return Err(format!("unexpected multiplier {}", config.timeout.multiplier));
    }
    if config.device.filesystems != vec!["ext4".to_string(), "tmpfs".to_string()] {
        return Err(format!("unexpected filesystems {}", config.device.filesystems.join(",")));
    }
    if config.output.color != ColorMode::Never {
        return Err("expected colour to be disabled".to_string());
    }
    if config.checkpoint.default_timeout_ms != 10_000 {
        return Err("unspecified sections must keep defaults".to_string());
    }
    Ok(())
}

#[test]
fn load_with_explicit_path_validates() -> TestResult {
    let file = write_config(b"[timeout]\nmultiplier = 0.5\n")?;
    assert_invalid(HarnessConfig::load(Some(file.path())), "timeout.multiplier must be between")
}
