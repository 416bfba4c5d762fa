// crates/kconform-core/src/provision/cgroup/tests.rs
// ============================================================================
// Module: Cgroup Unit Tests
// Description: Mount parsing, hierarchy selection, and group lifecycle.
// Purpose: Validate discovery without touching the host cgroup tree.
// Dependencies: kconform-core, tempfile
// ============================================================================

//! ## Overview
//! Lifecycle tests point the factory at a fake procfs whose mounts file
//! places a unified hierarchy inside a temporary directory.

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
use std::path::PathBuf;

use nix::unistd::getpid;

use super::CgroupFactory;
use super::CgroupMounts;
use super::CgroupRoot;
use crate::descriptor::CgroupRequest;
use crate::descriptor::CgroupVersion;
use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::Provisioner;

const HYBRID_MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
cgroup2 /sys/fs/cgroup/unified cgroup2 rw,nosuid,nodev,noexec,relatime,nsdelegate 0 0
cgroup /sys/fs/cgroup/systemd cgroup rw,nosuid,nodev,noexec,relatime,xattr,name=systemd 0 0
cgroup /sys/fs/cgroup/memory cgroup rw,nosuid,nodev,noexec,relatime,memory 0 0
cgroup /sys/fs/cgroup/cpu,cpuacct cgroup rw,nosuid,nodev,noexec,relatime,cpu,cpuacct 0 0
";

fn controllers(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

#[test]
fn parse_finds_unified_and_legacy_hierarchies() {
    let mounts = CgroupMounts::parse(HYBRID_MOUNTS);
    assert_eq!(mounts.unified, Some(PathBuf::from("/sys/fs/cgroup/unified")));
    assert_eq!(mounts.legacy.len(), 3);
    assert!(mounts.legacy[0].controllers.is_empty(), "name=systemd is not a controller");
    assert_eq!(mounts.legacy[2].controllers, controllers(&["cpu", "cpuacct"]));
}

#[test]
fn legacy_selection_groups_controllers_by_hierarchy() {
    let mounts = CgroupMounts::parse(HYBRID_MOUNTS);
    let selected = mounts.select(CgroupVersion::V1, &controllers(&["cpu", "memory", "cpuacct"]));
    assert_eq!(
        selected,
        Some(CgroupRoot::V1(vec![PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"), PathBuf::from("/sys/fs/cgroup/memory")]))
    );
    assert_eq!(mounts.select(CgroupVersion::V1, &controllers(&["pids"])), None);
}

#[test]
fn unified_selection_checks_available_controllers() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("cgroup.controllers"), "cpuset cpu io memory pids\n").unwrap();
    let mounts = CgroupMounts::parse(&format!("cgroup2 {} cgroup2 rw 0 0\n", root.path().display()));
    assert_eq!(
        mounts.select(CgroupVersion::Any, &controllers(&["memory", "pids"])),
        Some(CgroupRoot::V2(root.path().to_path_buf()))
    );
    assert_eq!(mounts.select(CgroupVersion::V2, &controllers(&["hugetlb"])), None);
    assert_eq!(mounts.select(CgroupVersion::V1, &[]), None);
}

#[test]
fn factory_creates_and_removes_test_group() {
    let proc_root = tempfile::tempdir().unwrap();
    let cgroup_root = tempfile::tempdir().unwrap();
    fs::create_dir(proc_root.path().join("self")).unwrap();
    fs::write(
        proc_root.path().join("self/mounts"),
        format!("cgroup2 {} cgroup2 rw 0 0\n", cgroup_root.path().display()),
    )
    .unwrap();
    let factory = CgroupFactory::new(proc_root.path(), CgroupRequest::default());
    let mut provisioner = Provisioner::new();
    let acquired = provisioner.acquire(&factory).unwrap();
    let test_dir = cgroup_root.path().join(format!("kconform/test-{}", getpid()));
    assert_eq!(
        acquired,
        AcquiredResource::Cgroup {
            test_dir: test_dir.clone(),
        }
    );
    assert!(test_dir.is_dir());
    assert!(cgroup_root.path().join("kconform/drain").is_dir());
    assert_eq!(provisioner.state().cgroup_dir, Some(test_dir.clone()));

    assert!(provisioner.teardown().is_empty());
    assert!(!cgroup_root.path().join("kconform").exists());
    assert_eq!(provisioner.state().cgroup_dir, None);
}

#[test]
fn factory_reports_missing_hierarchy_as_unavailable() {
    let proc_root = tempfile::tempdir().unwrap();
    fs::create_dir(proc_root.path().join("self")).unwrap();
    fs::write(proc_root.path().join("self/mounts"), "proc /proc proc rw 0 0\n").unwrap();
    let request = CgroupRequest {
        version: CgroupVersion::V2,
        controllers: Vec::new(),
    };
    let mut provisioner = Provisioner::new();
    let err = provisioner.acquire(&CgroupFactory::new(proc_root.path(), request)).unwrap_err();
    assert!(matches!(err, ProvisionError::Unavailable { .. }));
}
