// crates/kconform-core/src/provision/files/tests.rs
// ============================================================================
// Module: Resource File Unit Tests
// Description: Scratch directory lifecycle and resource file copies.
// Purpose: Validate the filesystem-only resources end to end.
// Dependencies: kconform-core, tempfile
// ============================================================================

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
use std::os::unix::fs::PermissionsExt;

use super::ResourceFilesFactory;
use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::Provisioner;
use crate::provision::scratch::ScratchDirFactory;

#[test]
fn scratch_dir_is_world_writable_and_removed() {
    let parent = tempfile::tempdir().unwrap();
    let mut provisioner = Provisioner::new();
    let acquired = provisioner.acquire(&ScratchDirFactory::new(parent.path(), "open01")).unwrap();
    let AcquiredResource::ScratchDir(dir) = &acquired else {
        panic!("unexpected resource {acquired:?}");
    };
    assert!(dir.starts_with(parent.path()));
    assert!(dir.file_name().unwrap().to_string_lossy().starts_with("open01_"));
    assert_eq!(fs::metadata(dir).unwrap().permissions().mode() & 0o777, 0o777);
    fs::write(dir.join("leftover"), "x").unwrap();

    assert!(provisioner.teardown().is_empty());
    assert!(!dir.exists());
    assert_eq!(provisioner.state().scratch_dir, None);
}

#[test]
fn resource_files_are_copied_and_removed() {
    let parent = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let data = sources.path().join("payload.bin");
    fs::write(&data, "payload").unwrap();

    let mut provisioner = Provisioner::new();
    provisioner.acquire(&ScratchDirFactory::new(parent.path(), "read02")).unwrap();
    let scratch = provisioner.state().scratch_dir.clone().unwrap();
    let acquired = provisioner.acquire(&ResourceFilesFactory::new(vec![data])).unwrap();
    let copy = scratch.join("payload.bin");
    assert_eq!(acquired, AcquiredResource::ResourceFiles(vec![copy.clone()]));
    assert_eq!(fs::read_to_string(&copy).unwrap(), "payload");

    let mark = 1;
    assert!(provisioner.release_to(mark).is_empty());
    assert!(!copy.exists());
    assert!(scratch.is_dir());
}

#[test]
fn missing_resource_file_rolls_back_copies() {
    let parent = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let present = sources.path().join("present");
    fs::write(&present, "here").unwrap();

    let mut provisioner = Provisioner::new();
    provisioner.acquire(&ScratchDirFactory::new(parent.path(), "read03")).unwrap();
    let scratch = provisioner.state().scratch_dir.clone().unwrap();
    let factory = ResourceFilesFactory::new(vec![present, sources.path().join("absent")]);
    let err = provisioner.acquire(&factory).unwrap_err();
    assert!(matches!(err, ProvisionError::Failed { .. }));
    assert!(!scratch.join("present").exists());
    assert_eq!(provisioner.mark(), 1);
}
