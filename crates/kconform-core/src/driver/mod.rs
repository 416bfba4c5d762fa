// crates/kconform-core/src/driver/mod.rs
// ============================================================================
// Module: Test Driver
// Description: Validates, checks prerequisites, provisions, and runs the
//              variant x filesystem matrix.
// Purpose: Turn a test descriptor into a run report and exit code.
// Dependencies: kconform-config, nix, crate::*
// ============================================================================

//! ## Overview
//! [`Driver::run`] creates the shared region, checks prerequisites, acquires
//! run-scoped resources, then forks one test process per sub-run. Sub-run
//! resources are acquired before each fork and released after it. The
//! verdict is folded from the shared tally once everything is released.
//! Invariants:
//! - Nothing is acquired when a prerequisite is unmet.
//! - Resources are released in reverse order on every path.
//! - A timeout or interruption stops scheduling further sub-runs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use kconform_config::HarnessConfig;
use kconform_config::OutputConfig;
use nix::sys::prctl;
use serde::Serialize;

use crate::channel::JsonLogSink;
use crate::channel::Location;
use crate::channel::ResultChannel;
use crate::channel::ResultSink;
use crate::channel::TextSink;
use crate::context::SubRunEnv;
use crate::descriptor::ProvisionScope;
use crate::descriptor::ResourceRequest;
use crate::descriptor::TestDescriptor;
use crate::descriptor::TimeoutSetting;
use crate::error::HarnessError;
use crate::governor::Governor;
use crate::governor::ScaledTimeout;
use crate::governor::TimeoutPolicy;
use crate::probe::HostProbe;
use crate::probe::SystemProbe;
use crate::provision::Provisioner;
use crate::provision::ReleaseFailure;
use crate::provision::ResourceFactory;
use crate::provision::caps::CapabilitiesFactory;
use crate::provision::cgroup::CgroupFactory;
use crate::provision::device::DeviceFactory;
use crate::provision::files::ResourceFilesFactory;
use crate::provision::hugepages::HugePagesFactory;
use crate::provision::mount::FormatFactory;
use crate::provision::mount::MountFactory;
use crate::provision::mount::ReadOnlyFsFactory;
use crate::provision::scratch::ScratchDirFactory;
use crate::severity::Severity;
use crate::severity::TallySnapshot;
use crate::severity::Verdict;
use crate::shm::SharedRegion;
use crate::supervisor::ChildExit;

mod entry;
mod matrix;
mod prereq;
mod process;

pub use entry::run_main;

use self::matrix::SubRun;
use self::process::Repeat;
use self::process::TestProcess;

// ============================================================================
// SECTION: Reports
// ============================================================================

/// How one sub-run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRunStatus {
    /// The test process exited normally.
    Completed,
    /// A sub-run resource could not be provisioned; the test process never ran.
    Skipped(Severity),
    /// The test process died on its own.
    Crashed(ChildExit),
    /// The run deadline expired and the test process group was killed.
    TimedOut,
    /// SIGINT or SIGTERM stopped the run.
    Interrupted,
}

/// Outcome of one (variant, filesystem) sub-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRunOutcome {
    /// Variant index.
    pub variant: u32,
    /// Filesystem, when one was selected.
    pub filesystem: Option<String>,
    /// How the sub-run ended.
    pub status: SubRunStatus,
    /// Results recorded during the sub-run.
    pub tally: TallySnapshot,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Final tally.
    pub tally: TallySnapshot,
    /// Verdict folded from the tally.
    pub verdict: Verdict,
    /// Process exit code for the verdict.
    pub exit_code: u8,
    /// Sub-runs in execution order.
    #[serde(skip)]
    pub sub_runs: Vec<SubRunOutcome>,
}

// ============================================================================
// SECTION: Factories
// ============================================================================

/// Builds the factory serving `request`.
pub(crate) fn factory_for(request: &ResourceRequest, config: &HarnessConfig, tid: &str) -> Box<dyn ResourceFactory> {
    match request {
        ResourceRequest::ScratchDir => Box::new(ScratchDirFactory::new(&config.paths.tmpdir, tid)),
        ResourceRequest::ResourceFiles(files) => Box::new(ResourceFilesFactory::new(files.clone())),
        ResourceRequest::Device(device) => Box::new(DeviceFactory::new(
            config.device.path.clone(),
            device.min_size_mb.unwrap_or(config.device.default_size_mb),
        )),
        ResourceRequest::Format(format) => Box::new(FormatFactory::new(format.clone())),
        ResourceRequest::Mount(mount) => Box::new(MountFactory::new(mount.clone())),
        ResourceRequest::ReadOnlyFs(mount_point) => Box::new(ReadOnlyFsFactory::new(mount_point.clone())),
        ResourceRequest::Cgroup(cgroup) => Box::new(CgroupFactory::new(&config.paths.proc_root, cgroup.clone())),
        ResourceRequest::Capabilities(actions) => Box::new(CapabilitiesFactory::new(actions.clone())),
        ResourceRequest::HugePages(pages) => Box::new(HugePagesFactory::new(&config.paths.proc_root, *pages)),
    }
}

/// Builds the sinks named by the output configuration.
fn default_sinks(output: &OutputConfig) -> Result<Vec<Box<dyn ResultSink>>, HarnessError> {
    let mut sinks: Vec<Box<dyn ResultSink>> = vec![Box::new(TextSink::stderr(output.color))];
    if let Some(path) = &output.json_log {
        sinks.push(Box::new(JsonLogSink::open(path)?));
    }
    Ok(sinks)
}

/// Formats a duration as `XhYYmZZs`.
fn format_timeout(timeout: Option<Duration>) -> String {
    timeout.map_or_else(
        || "disabled".to_string(),
        |timeout| {
            let secs = timeout.as_secs();
            format!("{}h {:02}m {:02}s", secs / 3_600, (secs / 60) % 60, secs % 60)
        },
    )
}

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Runs one test descriptor.
pub struct Driver {
    /// Test declaration.
    descriptor: TestDescriptor,
    /// Harness configuration.
    config: HarnessConfig,
    /// Host facts.
    probe: Box<dyn SystemProbe>,
    /// Sinks overriding the configured ones.
    sinks: Option<Vec<Box<dyn ResultSink>>>,
    /// Parsed test-specific options.
    options: BTreeMap<String, String>,
    /// Repetition settings.
    repeat: Repeat,
    /// Timeout policy overriding [`ScaledTimeout`].
    policy: Option<Box<dyn TimeoutPolicy>>,
}

impl Driver {
    /// Creates a driver probing the running host.
    #[must_use]
    pub fn new(descriptor: TestDescriptor, config: HarnessConfig) -> Self {
        let probe = Box::new(HostProbe::new(&config.paths));
        Self {
            descriptor,
            config,
            probe,
            sinks: None,
            options: BTreeMap::new(),
            repeat: Repeat::default(),
            policy: None,
        }
    }

    /// Replaces the host probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces the configured sinks.
    #[must_use]
    pub fn with_sinks(mut self, sinks: Vec<Box<dyn ResultSink>>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    /// Sets parsed test-specific options; flags map to an empty string.
    #[must_use]
    pub fn with_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.options = options;
        self
    }

    /// Repeats the sub-case loop `iterations` times per sub-run.
    #[must_use]
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.repeat.iterations = iterations.max(1);
        self
    }

    /// Repeats the sub-case loop for `duration` per sub-run.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.repeat.duration = Some(duration);
        self
    }

    /// Replaces the timeout policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Box<dyn TimeoutPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Executes the run.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError`] when the shared region or a sink cannot be
    /// created, or the test process cannot be forked.
    pub fn run(mut self) -> Result<RunReport, HarnessError> {
        let sinks = match self.sinks.take() {
            Some(sinks) => sinks,
            None => default_sinks(&self.config.output)?,
        };
        let region = Rc::new(SharedRegion::create(
            &self.config.paths.shm_dir,
            &self.descriptor.tid,
            self.descriptor.needs_checkpoints,
        )?);
        let channel = ResultChannel::new(Rc::clone(&region), sinks);
        if self.config.supervisor.reap_orphans {
            let _ = prctl::set_child_subreaper(true);
        }
        let policy = self
            .policy
            .take()
            .unwrap_or_else(|| Box::new(ScaledTimeout::from_config(&self.config.timeout)));
        let sub_runs = self.execute(&channel, &region, policy)?;
        let tally = region.tally_snapshot();
        let verdict = tally.verdict();
        Ok(RunReport {
            tally,
            verdict,
            exit_code: verdict.exit_code(),
            sub_runs,
        })
    }

    /// Prerequisites, provisioning, and the sub-run loop.
    fn execute(
        &self,
        channel: &ResultChannel,
        region: &Rc<SharedRegion>,
        policy: Box<dyn TimeoutPolicy>,
    ) -> Result<Vec<SubRunOutcome>, HarnessError> {
        let location = Location::caller();
        let descriptor = &self.descriptor;
        let probe = self.probe.as_ref();
        let unmet = prereq::check(descriptor, probe)
            .and_then(|()| prereq::taint_baseline(descriptor, probe))
            .and_then(|taint| {
                matrix::filesystems(descriptor, &self.config.device, probe, channel).map(|fs| (taint, fs))
            });
        let (taint_mask, filesystems) = match unmet {
            Ok(resolved) => resolved,
            Err(prereq::Unmet(reason)) => {
                channel.report(Severity::Unsupported, location, &reason);
                return Ok(Vec::new());
            }
        };
        let matrix = matrix::sub_runs(descriptor.variants, &filesystems);
        let governor = self.governor(region, policy, matrix.len());
        channel.report(
            Severity::Info,
            location,
            &format!("timeout per run is {}", format_timeout(governor.effective_timeout())),
        );
        governor.arm();

        let mut provisioner = Provisioner::new();
        if !descriptor.all_filesystems {
            provisioner.set_fs_type(filesystems.first().cloned().flatten());
        }
        let skip_device = matrix::device_unneeded(&filesystems);
        for request in &descriptor.resources {
            if request.scope(descriptor.all_filesystems) != ProvisionScope::Run
                || (skip_device && matches!(request, ResourceRequest::Device(_)))
            {
                continue;
            }
            let factory = factory_for(request, &self.config, &descriptor.tid);
            if let Err(err) = provisioner.acquire(factory.as_ref()) {
                channel.report(err.severity(), location, &err.to_string());
                report_release_failures(channel, provisioner.teardown());
                return Ok(Vec::new());
            }
        }

        let mut outcomes = Vec::with_capacity(matrix.len());
        for sub_run in matrix {
            let outcome = self.run_sub_run(channel, &governor, &mut provisioner, sub_run)?;
            let stop = matches!(outcome.status, SubRunStatus::TimedOut | SubRunStatus::Interrupted);
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        report_release_failures(channel, provisioner.teardown());

        if let Some(mask) = taint_mask {
            match probe.tainted() {
                Ok(tainted) if tainted & mask != 0 => {
                    channel.report(
                        Severity::Fail,
                        location,
                        &format!("kernel became tainted during the run ({:#x})", tainted & mask),
                    );
                }
                Ok(_) => {}
                Err(err) => channel.report(Severity::Warn, location, &err.to_string()),
            }
        }
        Ok(outcomes)
    }

    /// Builds and extends the governor for `sub_runs` sub-runs.
    fn governor(&self, region: &Rc<SharedRegion>, policy: Box<dyn TimeoutPolicy>, sub_runs: usize) -> Governor {
        let nominal = match self.descriptor.timeout {
            TimeoutSetting::Default => Some(Duration::from_secs(self.config.timeout.default_secs)),
            TimeoutSetting::Secs(secs) => Some(Duration::from_secs(secs)),
            TimeoutSetting::Disabled => None,
        };
        let timeout = nominal.map(|timeout| timeout + self.repeat.duration.unwrap_or_default());
        let mut governor = Governor::new(Rc::clone(region), policy, timeout, self.descriptor.runtime);
        governor.extend(u32::try_from(sub_runs).unwrap_or(u32::MAX));
        governor
    }

    /// Provisions, runs, and releases one sub-run.
    fn run_sub_run(
        &self,
        channel: &ResultChannel,
        governor: &Governor,
        provisioner: &mut Provisioner,
        sub_run: SubRun,
    ) -> Result<SubRunOutcome, HarnessError> {
        let location = Location::caller();
        let descriptor = &self.descriptor;
        let SubRun {
            variant,
            filesystem,
        } = sub_run;
        channel.region().set_variant(variant);
        let before = channel.snapshot();
        let mark = provisioner.mark();
        if descriptor.all_filesystems {
            if let Some(fs_type) = &filesystem {
                channel.report(Severity::Info, location, &format!("=== testing on {fs_type} ==="));
            }
            provisioner.set_fs_type(filesystem.clone());
        }
        let mut status = None;
        for request in &descriptor.resources {
            if request.scope(descriptor.all_filesystems) != ProvisionScope::SubRun {
                continue;
            }
            let factory = factory_for(request, &self.config, &descriptor.tid);
            if let Err(err) = provisioner.acquire(factory.as_ref()) {
                channel.report(err.severity(), location, &err.to_string());
                status = Some(SubRunStatus::Skipped(err.severity()));
                break;
            }
        }
        let status = match status {
            Some(skipped) => skipped,
            None => {
                let env = SubRunEnv {
                    variant,
                    filesystem: filesystem.clone(),
                    resources: provisioner.state().clone(),
                    options: self.options.clone(),
                    checkpoint_timeout: Some(Duration::from_millis(self.config.checkpoint.default_timeout_ms)),
                };
                TestProcess {
                    descriptor,
                    config: &self.config,
                    channel,
                    governor,
                    env: &env,
                    repeat: self.repeat,
                }
                .run()?
            }
        };
        report_release_failures(channel, provisioner.release_to(mark));
        Ok(SubRunOutcome {
            variant,
            filesystem,
            status,
            tally: channel.snapshot().since(&before),
        })
    }
}

/// Reports release failures as WARN.
#[track_caller]
fn report_release_failures(channel: &ResultChannel, failures: Vec<ReleaseFailure>) {
    let location = Location::caller();
    for failure in failures {
        channel.report(Severity::Warn, location, &failure.error.to_string());
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
