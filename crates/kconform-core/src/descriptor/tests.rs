// crates/kconform-core/src/descriptor/tests.rs
// ============================================================================
// Module: Descriptor Unit Tests
// Description: Builder validation and resource normalization.
// Purpose: Reject inconsistent declarations before any fork.
// Dependencies: kconform-core
// ============================================================================

//! ## Overview
//! Exercises [`super::TestDescriptorBuilder::build`].

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

use std::path::PathBuf;

use super::DescriptorError;
use super::DeviceRequest;
use super::FormatRequest;
use super::MountRequest;
use super::OptionSpec;
use super::ProvisionScope;
use super::ResourceRequest;
use super::TestBody;
use super::TestDescriptor;
use super::TimeoutSetting;

fn indexed() -> TestBody {
    TestBody::per_case(|_, _| Ok(()))
}

fn single() -> TestBody {
    TestBody::single(|_| Ok(()))
}

fn invalid_message(result: Result<TestDescriptor, DescriptorError>) -> String {
    match result {
        Err(DescriptorError::Invalid(message)) => message,
        Ok(_) => panic!("expected an invalid descriptor"),
    }
}

#[test]
fn indexed_body_requires_cases() {
    let message = invalid_message(TestDescriptor::builder("open01", indexed()).build());
    assert!(message.contains("tcnt > 0"));
    let descriptor = TestDescriptor::builder("open01", indexed()).tcnt(3).build().unwrap();
    assert_eq!(descriptor.tcnt(), 3);
    assert_eq!(descriptor.variants(), 1);
}

#[test]
fn single_body_rejects_cases() {
    let message = invalid_message(TestDescriptor::builder("fork01", single()).tcnt(2).build());
    assert!(message.contains("only valid for an indexed body"));
}

#[test]
fn zero_variants_rejected() {
    let message = invalid_message(TestDescriptor::builder("v", single()).variants(0).build());
    assert!(message.contains("variants"));
}

#[test]
fn zero_second_timeout_rejected() {
    let message =
        invalid_message(TestDescriptor::builder("t", single()).timeout(TimeoutSetting::Secs(0)).build());
    assert!(message.contains("timeout"));
}

#[test]
fn reserved_and_duplicate_options_rejected() {
    let iterations = OptionSpec {
        short: 'i',
        name: "iterations",
        help: "clashes",
        takes_value: true,
    };
    let message = invalid_message(TestDescriptor::builder("o", single()).option(iterations).build());
    assert!(message.contains("reserved"));

    let size = OptionSpec {
        short: 's',
        name: "size",
        help: "buffer size",
        takes_value: true,
    };
    let message =
        invalid_message(TestDescriptor::builder("o", single()).option(size.clone()).option(size).build());
    assert!(message.contains("declared twice"));
}

#[test]
fn bad_kernel_version_rejected() {
    let message = invalid_message(TestDescriptor::builder("k", single()).min_kver("five").build());
    assert!(message.contains("min_kver"));
}

#[test]
fn mount_point_must_be_relative() {
    let message = invalid_message(
        TestDescriptor::builder("m", single()).mount_device(MountRequest::at("/mnt")).build(),
    );
    assert!(message.contains("plain relative path"));
    let message =
        invalid_message(TestDescriptor::builder("m", single()).needs_rofs("../escape").build());
    assert!(message.contains("plain relative path"));
}

#[test]
fn mount_device_implies_scratch_device_and_format() {
    let descriptor = TestDescriptor::builder("m", single())
        .mount_device(MountRequest::at("mntpoint"))
        .build()
        .unwrap();
    let kinds: Vec<&str> = descriptor.resources().iter().map(ResourceRequest::label).collect();
    assert_eq!(kinds, vec!["scratch directory", "block device", "format", "mount"]);
}

#[test]
fn declared_order_is_kept_after_implied_requests() {
    let descriptor = TestDescriptor::builder("d", single())
        .resource_files(["data.bin"])
        .device(DeviceRequest {
            min_size_mb: Some(512),
            fs_type: Some("ext4".to_string()),
        })
        .format_device(FormatRequest::default())
        .build()
        .unwrap();
    assert_eq!(
        descriptor.resources(),
        &[
            ResourceRequest::ScratchDir,
            ResourceRequest::ResourceFiles(vec![PathBuf::from("data.bin")]),
            ResourceRequest::Device(DeviceRequest {
                min_size_mb: Some(512),
                fs_type: Some("ext4".to_string()),
            }),
            ResourceRequest::Format(FormatRequest::default()),
        ]
    );
}

#[test]
fn duplicate_device_rejected() {
    let message = invalid_message(
        TestDescriptor::builder("d", single())
            .device(DeviceRequest::default())
            .device(DeviceRequest::default())
            .build(),
    );
    assert!(message.contains("declared more than once"));
}

#[test]
fn filesystem_requests_are_sub_run_scoped_when_iterating() {
    let mount = ResourceRequest::Mount(MountRequest::at("mnt"));
    assert_eq!(mount.scope(true), ProvisionScope::SubRun);
    assert_eq!(mount.scope(false), ProvisionScope::Run);
    assert_eq!(ResourceRequest::Capabilities(Vec::new()).scope(false), ProvisionScope::Process);
    assert_eq!(ResourceRequest::ScratchDir.scope(true), ProvisionScope::Run);
}

#[test]
fn plain_descriptor_has_no_resources() {
    let descriptor = TestDescriptor::builder("getpid01", single()).build().unwrap();
    assert!(descriptor.resources().is_empty());
    let descriptor = TestDescriptor::builder("tmp", single()).needs_scratch_dir().build().unwrap();
    assert_eq!(descriptor.resources(), &[ResourceRequest::ScratchDir]);
}
