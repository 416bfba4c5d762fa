// crates/kconform-core/src/descriptor.rs
// ============================================================================
// Module: Test Descriptor
// Description: Immutable declaration of a test, built and validated once.
// Purpose: Describe what a test needs; the driver decides how to provide it.
// Dependencies: nix, thiserror, crate::context
// ============================================================================

//! ## Overview
//! A [`TestDescriptor`] is assembled with [`TestDescriptorBuilder`] and never
//! mutated afterwards. It names the body, the sub-case count, prerequisites,
//! and resource requests in declaration order.
//! Invariants:
//! - Exactly one body kind; `tcnt > 0` only for an indexed body.
//! - Resource requests keep declaration order; implied requests (scratch
//!   directory, device, format) are inserted ahead of the request implying them.
//! - `variants >= 1`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use nix::mount::MsFlags;
use thiserror::Error;

use crate::context::TestContext;
use crate::error::TestResult;
use crate::probe::KernelVersion;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Descriptor validation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The descriptor is inconsistent.
    #[error("invalid test descriptor: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Entry Points
// ============================================================================

/// Indexed body invoked once per sub-case.
pub type CaseFn = dyn Fn(&mut TestContext<'_>, u32) -> TestResult + Send + Sync;
/// Setup, cleanup, or single body.
pub type StepFn = dyn Fn(&mut TestContext<'_>) -> TestResult + Send + Sync;

/// Test body; exactly one kind per descriptor.
pub enum TestBody {
    /// Invoked for every sub-case `0..tcnt`.
    PerCase(Box<CaseFn>),
    /// Invoked once.
    Single(Box<StepFn>),
}

impl TestBody {
    /// Wraps an indexed body.
    #[must_use]
    pub fn per_case<F>(body: F) -> Self
    where
        F: Fn(&mut TestContext<'_>, u32) -> TestResult + Send + Sync + 'static,
    {
        Self::PerCase(Box::new(body))
    }

    /// Wraps a single body.
    #[must_use]
    pub fn single<F>(body: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> TestResult + Send + Sync + 'static,
    {
        Self::Single(Box::new(body))
    }
}

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Test-specific command line option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    /// Short flag letter.
    pub short: char,
    /// Long name, also the lookup key.
    pub name: &'static str,
    /// Help text.
    pub help: &'static str,
    /// Whether the option takes a value.
    pub takes_value: bool,
}

/// Timeout declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutSetting {
    /// Use `timeout.default_secs`.
    #[default]
    Default,
    /// Explicit nominal timeout in seconds.
    Secs(u64),
    /// No deadline.
    Disabled,
}

/// Cgroup hierarchy version requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CgroupVersion {
    /// Either version.
    #[default]
    Any,
    /// Legacy per-controller hierarchies.
    V1,
    /// Unified hierarchy.
    V2,
}

/// Cgroup request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CgroupRequest {
    /// Required hierarchy version.
    pub version: CgroupVersion,
    /// Controllers that must be available.
    pub controllers: Vec<String>,
}

/// Linux capability number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Capability(pub u8);

impl Capability {
    /// `CAP_CHOWN`.
    pub const CHOWN: Self = Self(0);
    /// `CAP_DAC_OVERRIDE`.
    pub const DAC_OVERRIDE: Self = Self(1);
    /// `CAP_DAC_READ_SEARCH`.
    pub const DAC_READ_SEARCH: Self = Self(2);
    /// `CAP_FOWNER`.
    pub const FOWNER: Self = Self(3);
    /// `CAP_KILL`.
    pub const KILL: Self = Self(5);
    /// `CAP_SETGID`.
    pub const SETGID: Self = Self(6);
    /// `CAP_SETUID`.
    pub const SETUID: Self = Self(7);
    /// `CAP_NET_ADMIN`.
    pub const NET_ADMIN: Self = Self(12);
    /// `CAP_NET_RAW`.
    pub const NET_RAW: Self = Self(13);
    /// `CAP_IPC_LOCK`.
    pub const IPC_LOCK: Self = Self(14);
    /// `CAP_SYS_CHROOT`.
    pub const SYS_CHROOT: Self = Self(18);
    /// `CAP_SYS_PTRACE`.
    pub const SYS_PTRACE: Self = Self(19);
    /// `CAP_SYS_ADMIN`.
    pub const SYS_ADMIN: Self = Self(21);
    /// `CAP_SYS_NICE`.
    pub const SYS_NICE: Self = Self(23);
    /// `CAP_SYS_RESOURCE`.
    pub const SYS_RESOURCE: Self = Self(24);
    /// `CAP_SYS_TIME`.
    pub const SYS_TIME: Self = Self(25);
    /// `CAP_MKNOD`.
    pub const MKNOD: Self = Self(27);

    /// Returns the bit of this capability in a 64-bit set.
    #[must_use]
    pub const fn mask(self) -> u64 {
        if self.0 < 64 { 1_u64 << self.0 } else { 0 }
    }
}

/// Capability adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityAction {
    /// Skip the test unless the capability is permitted.
    Require(Capability),
    /// Remove from the effective set while the test runs.
    Drop(Capability),
    /// Add to the effective set while the test runs.
    Add(Capability),
}

/// Whether a huge page shortfall is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugePagePolicy {
    /// Use whatever could be reserved.
    #[default]
    Try,
    /// UNSUPPORTED unless the full count is reserved.
    Require,
}

/// Huge page reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugePageRequest {
    /// Pages to add to the pool.
    pub count: u64,
    /// Shortfall policy.
    pub policy: HugePagePolicy,
}

/// Block device request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceRequest {
    /// Minimal size in MiB; `device.default_size_mb` when unset.
    pub min_size_mb: Option<u64>,
    /// Filesystem for formatting; `device.fs_type` when unset.
    pub fs_type: Option<String>,
}

/// mkfs invocation details.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormatRequest {
    /// Options passed before the device.
    pub mkfs_opts: Vec<String>,
    /// Arguments passed after the device.
    pub mkfs_extra: Vec<String>,
}

/// Mount request, relative to the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Mount point relative to the scratch directory.
    pub mount_point: PathBuf,
    /// mount(2) flags.
    pub flags: MsFlags,
    /// Filesystem-specific data.
    pub data: Option<String>,
}

impl MountRequest {
    /// Mount request for `mount_point` with no flags.
    #[must_use]
    pub fn at(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            flags: MsFlags::empty(),
            data: None,
        }
    }
}

/// Scope in which a resource is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionScope {
    /// Once by the driver for the whole run.
    Run,
    /// Once per (variant, filesystem) sub-run, by the driver.
    SubRun,
    /// Inside each test process.
    Process,
}

/// One resource request, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRequest {
    /// Private scratch directory.
    ScratchDir,
    /// Files copied into the scratch directory.
    ResourceFiles(Vec<PathBuf>),
    /// Block device.
    Device(DeviceRequest),
    /// mkfs on the device.
    Format(FormatRequest),
    /// Mount of the device (or tmpfs).
    Mount(MountRequest),
    /// Read-only filesystem at a mount point.
    ReadOnlyFs(PathBuf),
    /// Control group for the test.
    Cgroup(CgroupRequest),
    /// Effective capability changes.
    Capabilities(Vec<CapabilityAction>),
    /// Huge page reservation.
    HugePages(HugePageRequest),
}

impl ResourceRequest {
    /// Returns the acquisition scope of the request.
    #[must_use]
    pub const fn scope(&self, all_filesystems: bool) -> ProvisionScope {
        match self {
            Self::Format(_) | Self::Mount(_) if all_filesystems => ProvisionScope::SubRun,
            Self::Capabilities(_) => ProvisionScope::Process,
            _ => ProvisionScope::Run,
        }
    }

    /// Short label used in diagnostics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ScratchDir => "scratch directory",
            Self::ResourceFiles(_) => "resource files",
            Self::Device(_) => "block device",
            Self::Format(_) => "format",
            Self::Mount(_) => "mount",
            Self::ReadOnlyFs(_) => "read-only filesystem",
            Self::Cgroup(_) => "cgroup",
            Self::Capabilities(_) => "capabilities",
            Self::HugePages(_) => "huge pages",
        }
    }
}

// ============================================================================
// SECTION: Descriptor
// ============================================================================

/// Immutable test declaration.
///
/// # Invariants
/// - Validated by [`TestDescriptorBuilder::build`]; never mutated.
pub struct TestDescriptor {
    /// Test identifier.
    pub(crate) tid: String,
    /// Sub-case count for indexed bodies.
    pub(crate) tcnt: u32,
    /// Test body.
    pub(crate) body: TestBody,
    /// Optional setup, run once per sub-run.
    pub(crate) setup: Option<Box<StepFn>>,
    /// Optional cleanup, run once per sub-run.
    pub(crate) cleanup: Option<Box<StepFn>>,
    /// Test-specific options.
    pub(crate) options: Vec<OptionSpec>,
    /// Minimal kernel version.
    pub(crate) min_kver: Option<KernelVersion>,
    /// Architectures the test supports; empty means all.
    pub(crate) supported_archs: Vec<String>,
    /// Requires effective uid 0.
    pub(crate) needs_root: bool,
    /// Test forks children.
    pub(crate) forks_child: bool,
    /// Region must be reachable by exec'd helpers.
    pub(crate) needs_checkpoints: bool,
    /// Iterate over every supported filesystem.
    pub(crate) all_filesystems: bool,
    /// Filesystems skipped during iteration.
    pub(crate) skip_filesystems: Vec<String>,
    /// Filesystem for the device when not iterating.
    pub(crate) dev_fs_type: Option<String>,
    /// Minimal online CPUs.
    pub(crate) min_cpus: u32,
    /// Minimal available memory in MiB.
    pub(crate) min_mem_avail_mb: u64,
    /// Taint flags checked before and after the run.
    pub(crate) taint_check: Option<u64>,
    /// Number of variants.
    pub(crate) variants: u32,
    /// Timeout declaration.
    pub(crate) timeout: TimeoutSetting,
    /// Nominal runtime of one sub-run.
    pub(crate) runtime: Option<Duration>,
    /// Required drivers.
    pub(crate) drivers: Vec<String>,
    /// Required kernel config entries (`CONFIG_X` or `CONFIG_X=value`).
    pub(crate) kconfigs: Vec<String>,
    /// Required commands.
    pub(crate) cmds: Vec<String>,
    /// Unconditional skip reason.
    pub(crate) unsupported_reason: Option<String>,
    /// Resource requests in acquisition order.
    pub(crate) resources: Vec<ResourceRequest>,
}

impl TestDescriptor {
    /// Starts building a descriptor.
    #[must_use]
    pub fn builder(tid: impl Into<String>, body: TestBody) -> TestDescriptorBuilder {
        TestDescriptorBuilder::new(tid.into(), body)
    }

    /// Test identifier.
    #[must_use]
    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// Sub-case count (0 for a single body).
    #[must_use]
    pub const fn tcnt(&self) -> u32 {
        self.tcnt
    }

    /// Number of variants.
    #[must_use]
    pub const fn variants(&self) -> u32 {
        self.variants
    }

    /// Test-specific options.
    #[must_use]
    pub fn options(&self) -> &[OptionSpec] {
        &self.options
    }

    /// Resource requests in acquisition order.
    #[must_use]
    pub fn resources(&self) -> &[ResourceRequest] {
        &self.resources
    }

    /// True when the test iterates over filesystems.
    #[must_use]
    pub const fn all_filesystems(&self) -> bool {
        self.all_filesystems
    }

    /// True when the test forks children.
    #[must_use]
    pub const fn forks_child(&self) -> bool {
        self.forks_child
    }

    /// Returns true when a request of the matching kind exists.
    pub(crate) fn has_request(&self, matches: impl Fn(&ResourceRequest) -> bool) -> bool {
        self.resources.iter().any(matches)
    }
}

// ============================================================================
// SECTION: Builder
// ============================================================================

/// Option letters reserved by the harness.
const RESERVED_OPTIONS: [char; 3] = ['h', 'i', 'I'];

/// Builder for [`TestDescriptor`].
pub struct TestDescriptorBuilder {
    /// Descriptor under construction.
    descriptor: TestDescriptor,
    /// Raw minimal kernel version.
    min_kver: Option<String>,
    /// Whether a scratch directory was requested explicitly.
    wants_scratch: bool,
}

impl TestDescriptorBuilder {
    /// Creates a builder with defaults.
    fn new(tid: String, body: TestBody) -> Self {
        Self {
            descriptor: TestDescriptor {
                tid,
                tcnt: 0,
                body,
                setup: None,
                cleanup: None,
                options: Vec::new(),
                min_kver: None,
                supported_archs: Vec::new(),
                needs_root: false,
                forks_child: false,
                needs_checkpoints: false,
                all_filesystems: false,
                skip_filesystems: Vec::new(),
                dev_fs_type: None,
                min_cpus: 0,
                min_mem_avail_mb: 0,
                taint_check: None,
                variants: 1,
                timeout: TimeoutSetting::Default,
                runtime: None,
                drivers: Vec::new(),
                kconfigs: Vec::new(),
                cmds: Vec::new(),
                unsupported_reason: None,
                resources: Vec::new(),
            },
            min_kver: None,
            wants_scratch: false,
        }
    }

    /// Sets the sub-case count of an indexed body.
    #[must_use]
    pub const fn tcnt(mut self, tcnt: u32) -> Self {
        self.descriptor.tcnt = tcnt;
        self
    }

    /// Sets the setup entry point.
    #[must_use]
    pub fn setup<F>(mut self, setup: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> TestResult + Send + Sync + 'static,
    {
        self.descriptor.setup = Some(Box::new(setup));
        self
    }

    /// Sets the cleanup entry point.
    #[must_use]
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> TestResult + Send + Sync + 'static,
    {
        self.descriptor.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Adds a test-specific option.
    #[must_use]
    pub fn option(mut self, option: OptionSpec) -> Self {
        self.descriptor.options.push(option);
        self
    }

    /// Requires at least kernel `version` (for example `"5.10"`).
    #[must_use]
    pub fn min_kver(mut self, version: &str) -> Self {
        self.min_kver = Some(version.to_string());
        self
    }

    /// Restricts the test to the given architectures.
    #[must_use]
    pub fn supported_archs(mut self, archs: &[&str]) -> Self {
        self.descriptor.supported_archs = archs.iter().map(ToString::to_string).collect();
        self
    }

    /// Requires root.
    #[must_use]
    pub const fn needs_root(mut self) -> Self {
        self.descriptor.needs_root = true;
        self
    }

    /// Declares that the test forks children.
    #[must_use]
    pub const fn forks_child(mut self) -> Self {
        self.descriptor.forks_child = true;
        self
    }

    /// Exports the shared region for exec'd checkpoint users.
    #[must_use]
    pub const fn needs_checkpoints(mut self) -> Self {
        self.descriptor.needs_checkpoints = true;
        self
    }

    /// Requests a scratch directory.
    #[must_use]
    pub const fn needs_scratch_dir(mut self) -> Self {
        self.wants_scratch = true;
        self
    }

    /// Copies files into the scratch directory.
    #[must_use]
    pub fn resource_files<P: Into<PathBuf>>(mut self, files: impl IntoIterator<Item = P>) -> Self {
        let files = files.into_iter().map(Into::into).collect();
        self.descriptor.resources.push(ResourceRequest::ResourceFiles(files));
        self
    }

    /// Requests a block device.
    #[must_use]
    pub fn device(mut self, request: DeviceRequest) -> Self {
        self.descriptor.dev_fs_type.clone_from(&request.fs_type);
        self.descriptor.resources.push(ResourceRequest::Device(request));
        self
    }

    /// Formats the device.
    #[must_use]
    pub fn format_device(mut self, request: FormatRequest) -> Self {
        self.descriptor.resources.push(ResourceRequest::Format(request));
        self
    }

    /// Formats (unless already requested) and mounts the device.
    #[must_use]
    pub fn mount_device(mut self, request: MountRequest) -> Self {
        if !self.descriptor.has_request(|r| matches!(r, ResourceRequest::Format(_))) {
            self.descriptor.resources.push(ResourceRequest::Format(FormatRequest::default()));
        }
        self.descriptor.resources.push(ResourceRequest::Mount(request));
        self
    }

    /// Mounts a read-only filesystem at `mount_point`.
    #[must_use]
    pub fn needs_rofs(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.descriptor.resources.push(ResourceRequest::ReadOnlyFs(mount_point.into()));
        self
    }

    /// Runs every sub-run once per supported filesystem, minus `skip`.
    #[must_use]
    pub fn all_filesystems(mut self, skip: &[&str]) -> Self {
        self.descriptor.all_filesystems = true;
        self.descriptor.skip_filesystems = skip.iter().map(ToString::to_string).collect();
        self
    }

    /// Requires at least `count` online CPUs.
    #[must_use]
    pub const fn min_cpus(mut self, count: u32) -> Self {
        self.descriptor.min_cpus = count;
        self
    }

    /// Requires at least `mb` MiB of available memory.
    #[must_use]
    pub const fn min_mem_avail_mb(mut self, mb: u64) -> Self {
        self.descriptor.min_mem_avail_mb = mb;
        self
    }

    /// Reserves huge pages.
    #[must_use]
    pub fn hugepages(mut self, request: HugePageRequest) -> Self {
        self.descriptor.resources.push(ResourceRequest::HugePages(request));
        self
    }

    /// Checks the kernel taint flags in `mask` before and after the run.
    #[must_use]
    pub const fn taint_check(mut self, mask: u64) -> Self {
        self.descriptor.taint_check = Some(mask);
        self
    }

    /// Runs the sub-case matrix `count` times with different variant indices.
    #[must_use]
    pub const fn variants(mut self, count: u32) -> Self {
        self.descriptor.variants = count;
        self
    }

    /// Overrides the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutSetting) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    /// Sets the nominal runtime of one sub-run.
    #[must_use]
    pub const fn runtime(mut self, runtime: Duration) -> Self {
        self.descriptor.runtime = Some(runtime);
        self
    }

    /// Requires drivers.
    #[must_use]
    pub fn needs_drivers(mut self, drivers: &[&str]) -> Self {
        self.descriptor.drivers.extend(drivers.iter().map(ToString::to_string));
        self
    }

    /// Requires kernel config entries.
    #[must_use]
    pub fn needs_kconfigs(mut self, kconfigs: &[&str]) -> Self {
        self.descriptor.kconfigs.extend(kconfigs.iter().map(ToString::to_string));
        self
    }

    /// Requires commands on `PATH`.
    #[must_use]
    pub fn needs_cmds(mut self, cmds: &[&str]) -> Self {
        self.descriptor.cmds.extend(cmds.iter().map(ToString::to_string));
        self
    }

    /// Adjusts or requires capabilities.
    #[must_use]
    pub fn caps(mut self, actions: &[CapabilityAction]) -> Self {
        self.descriptor.resources.push(ResourceRequest::Capabilities(actions.to_vec()));
        self
    }

    /// Requests a control group.
    #[must_use]
    pub fn cgroup(mut self, request: CgroupRequest) -> Self {
        self.descriptor.resources.push(ResourceRequest::Cgroup(request));
        self
    }

    /// Marks the test unsupported unconditionally.
    #[must_use]
    pub fn unsupported(mut self, reason: impl Into<String>) -> Self {
        self.descriptor.unsupported_reason = Some(reason.into());
        self
    }

    /// Validates and returns the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Invalid`] when the declaration is inconsistent.
    pub fn build(self) -> Result<TestDescriptor, DescriptorError> {
        let Self {
            mut descriptor,
            min_kver,
            wants_scratch,
        } = self;
        if let Some(version) = min_kver {
            descriptor.min_kver = Some(KernelVersion::parse(&version).ok_or_else(|| {
                DescriptorError::Invalid(format!("min_kver '{version}' is not a kernel version"))
            })?);
        }
        validate_identity(&descriptor)?;
        validate_options(&descriptor.options)?;
        validate_resources(&descriptor.resources)?;
        descriptor.resources = normalize_resources(descriptor.resources, wants_scratch);
        Ok(descriptor)
    }
}

// ============================================================================
// SECTION: Validation
// ============================================================================

/// Checks the id, body kind, and counts.
fn validate_identity(descriptor: &TestDescriptor) -> Result<(), DescriptorError> {
    if descriptor.tid.trim().is_empty() {
        return Err(DescriptorError::Invalid("tid must not be empty".to_string()));
    }
    match (&descriptor.body, descriptor.tcnt) {
        (TestBody::PerCase(_), 0) => {
            return Err(DescriptorError::Invalid("indexed body requires tcnt > 0".to_string()));
        }
        (TestBody::Single(_), tcnt) if tcnt > 0 => {
            return Err(DescriptorError::Invalid("tcnt is only valid for an indexed body".to_string()));
        }
        _ => {}
    }
    if descriptor.variants == 0 {
        return Err(DescriptorError::Invalid("variants must be at least 1".to_string()));
    }
    if matches!(descriptor.timeout, TimeoutSetting::Secs(0)) {
        return Err(DescriptorError::Invalid("timeout must be at least 1 second".to_string()));
    }
    Ok(())
}

/// Checks option letters and names.
fn validate_options(options: &[OptionSpec]) -> Result<(), DescriptorError> {
    for (index, option) in options.iter().enumerate() {
        if RESERVED_OPTIONS.contains(&option.short) {
            return Err(DescriptorError::Invalid(format!(
                "option -{} is reserved by the harness",
                option.short
            )));
        }
        if !option.short.is_ascii_alphanumeric() || option.name.is_empty() {
            return Err(DescriptorError::Invalid(format!("option '{}' is malformed", option.name)));
        }
        if options[.. index].iter().any(|other| other.short == option.short || other.name == option.name) {
            return Err(DescriptorError::Invalid(format!("option -{} declared twice", option.short)));
        }
    }
    Ok(())
}

/// Checks mount points, duplicates, and request parameters.
fn validate_resources(resources: &[ResourceRequest]) -> Result<(), DescriptorError> {
    let mut seen = Vec::new();
    for request in resources {
        let label = request.label();
        let unique = !matches!(request, ResourceRequest::ResourceFiles(_));
        if unique && seen.contains(&label) {
            return Err(DescriptorError::Invalid(format!("{label} declared more than once")));
        }
        seen.push(label);
        match request {
            ResourceRequest::Mount(mount) => validate_mount_point(&mount.mount_point)?,
            ResourceRequest::ReadOnlyFs(mount_point) => validate_mount_point(mount_point)?,
            ResourceRequest::HugePages(pages) if pages.count == 0 => {
                return Err(DescriptorError::Invalid("hugepages count must be positive".to_string()));
            }
            ResourceRequest::Device(DeviceRequest {
                min_size_mb: Some(0),
                ..
            }) => {
                return Err(DescriptorError::Invalid("device size must be positive".to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Mount points are non-empty relative paths without `..`.
fn validate_mount_point(mount_point: &Path) -> Result<(), DescriptorError> {
    if mount_point.as_os_str().is_empty() {
        return Err(DescriptorError::Invalid("mount point must not be empty".to_string()));
    }
    if mount_point.components().any(|component| !matches!(component, Component::Normal(_))) {
        return Err(DescriptorError::Invalid(format!(
            "mount point {} must be a plain relative path",
            mount_point.display()
        )));
    }
    Ok(())
}

/// Inserts implied requests ahead of the requests implying them.
fn normalize_resources(resources: Vec<ResourceRequest>, wants_scratch: bool) -> Vec<ResourceRequest> {
    let needs_device = resources.iter().any(|r| matches!(r, ResourceRequest::Format(_)));
    let has_device = resources.iter().any(|r| matches!(r, ResourceRequest::Device(_)));
    let needs_scratch = wants_scratch
        || resources.iter().any(|r| {
            matches!(
                r,
                ResourceRequest::ResourceFiles(_)
                    | ResourceRequest::Device(_)
                    | ResourceRequest::Format(_)
                    | ResourceRequest::Mount(_)
                    | ResourceRequest::ReadOnlyFs(_)
            )
        });
    let mut normalized = Vec::with_capacity(resources.len() + 2);
    if needs_scratch {
        normalized.push(ResourceRequest::ScratchDir);
    }
    let mut device_inserted = has_device;
    for request in resources {
        if !device_inserted && matches!(request, ResourceRequest::Format(_)) && needs_device {
            normalized.push(ResourceRequest::Device(DeviceRequest::default()));
            device_inserted = true;
        }
        normalized.push(request);
    }
    normalized
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
