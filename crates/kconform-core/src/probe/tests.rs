// crates/kconform-core/src/probe/tests.rs
// ============================================================================
// Module: System Probe Unit Tests
// Description: Version parsing and host probe reads over a fake procfs.
// Purpose: Keep prerequisite discovery deterministic.
// Dependencies: kconform-core, kconform-config, tempfile
// ============================================================================

//! ## Overview
//! Points [`super::HostProbe`] at temporary trees shaped like procfs.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::fs;

use kconform_config::PathsConfig;

use super::HostProbe;
use super::KernelVersion;
use super::ProbeError;
use super::SystemProbe;
use super::module_name;
use super::parse_kconfig_line;

fn fake_host() -> (tempfile::TempDir, HostProbe) {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    fs::create_dir_all(proc_root.join("sys/kernel")).unwrap();
    fs::write(proc_root.join("meminfo"), "MemTotal: 8000000 kB\nMemAvailable: 2097152 kB\n").unwrap();
    fs::write(proc_root.join("sys/kernel/tainted"), "4096\n").unwrap();
    fs::write(proc_root.join("filesystems"), "nodev\tsysfs\nnodev\ttmpfs\n\text4\n").unwrap();
    fs::write(proc_root.join("modules"), "loop 40960 0 - Live 0x0\n").unwrap();
    let kconfig = dir.path().join("config");
    fs::write(&kconfig, "CONFIG_USER_NS=y\n# CONFIG_KASAN is not set\nCONFIG_HZ=250\nCONFIG_DEBUG=n\n")
        .unwrap();
    let paths = PathsConfig {
        proc_root,
        sys_root: dir.path().join("sys"),
        kconfig: Some(kconfig),
        ..PathsConfig::default()
    };
    let probe = HostProbe::new(&paths);
    (dir, probe)
}

#[test]
fn kernel_versions_parse_and_order() {
    let distro = KernelVersion::parse("5.15.0-91-generic").unwrap();
    assert_eq!(
        distro,
        KernelVersion {
            major: 5,
            minor: 15,
            patch: 0,
        }
    );
    let short = KernelVersion::parse("6.1").unwrap();
    assert_eq!(short.patch, 0);
    assert!(short > distro);
    assert_eq!(KernelVersion::parse("4.19.12rc1").unwrap().patch, 12);
    assert!(KernelVersion::parse("linux").is_none());
    assert_eq!(distro.to_string(), "5.15.0");
}

#[test]
fn kconfig_lines_parse() {
    assert_eq!(parse_kconfig_line("CONFIG_HZ=250", "CONFIG_HZ"), Some("250"));
    assert_eq!(parse_kconfig_line("# CONFIG_KASAN is not set", "CONFIG_KASAN"), Some("n"));
    assert_eq!(parse_kconfig_line("CONFIG_HZ_250=y", "CONFIG_HZ"), None);
    assert_eq!(parse_kconfig_line("# comment", "CONFIG_HZ"), None);
}

#[test]
fn module_names_strip_paths_and_suffixes() {
    assert_eq!(module_name("kernel/fs/xfs/xfs.ko.zst"), "xfs");
    assert_eq!(module_name("kernel/drivers/block/zram/zram.ko"), "zram");
    assert_eq!(module_name("kernel/net/can-raw.ko"), "can_raw");
}

#[test]
fn host_probe_reads_fake_proc() {
    let (_dir, probe) = fake_host();
    assert_eq!(probe.mem_available_mb().unwrap(), 2_048);
    assert_eq!(probe.tainted().unwrap(), 4_096);
    assert!(probe.has_driver("loop"));
    assert!(probe.filesystem_supported("tmpfs"));
    assert!(!probe.filesystem_supported("kconformfs"));
}

#[test]
fn host_probe_reads_kconfig_values() {
    let (_dir, probe) = fake_host();
    assert_eq!(probe.kconfig("CONFIG_USER_NS").unwrap().as_deref(), Some("y"));
    assert_eq!(probe.kconfig("CONFIG_HZ").unwrap().as_deref(), Some("250"));
    assert_eq!(probe.kconfig("CONFIG_KASAN").unwrap(), None);
    assert_eq!(probe.kconfig("CONFIG_DEBUG").unwrap(), None);
    assert_eq!(probe.kconfig("CONFIG_MISSING").unwrap(), None);
}

#[test]
fn missing_sources_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        proc_root: dir.path().to_path_buf(),
        kconfig: Some(dir.path().join("absent")),
        ..PathsConfig::default()
    };
    let probe = HostProbe::new(&paths);
    assert!(matches!(probe.tainted(), Err(ProbeError::Unreadable { .. })));
    assert!(matches!(probe.mem_available_mb(), Err(ProbeError::Unreadable { .. })));
    assert!(probe.kconfig("CONFIG_HZ").is_err());
}

#[test]
fn commands_are_found_on_path() {
    let (_dir, probe) = fake_host();
    assert!(probe.has_command("sh"));
    assert!(!probe.has_command("kconform-no-such-command"));
}
