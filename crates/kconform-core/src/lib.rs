// crates/kconform-core/src/lib.rs
// ============================================================================
// Module: kconform Core Library
// Description: Orchestration engine for kernel syscall conformance tests.
// Purpose: Run declared tests in supervised processes and report a verdict.
// Dependencies: clap, kconform-config, libc, nix, serde, thiserror, time
// ============================================================================

//! ## Overview
//! A test program declares a [`TestDescriptor`] and hands it to
//! [`run_main`]. The [`Driver`] checks host prerequisites, provisions
//! resources, forks a supervised test process per (variant, filesystem)
//! sub-run, and folds every reported result into a [`Verdict`].
//! Invariants:
//! - Results from every process land in one shared tally.
//! - Every forked process is reaped before the run returns.
//! - Acquired resources are released in reverse order.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod channel;
pub mod checkpoint;
pub mod context;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod governor;
pub mod probe;
pub mod provision;
pub mod severity;
pub mod shm;
pub mod supervisor;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use channel::JsonLogSink;
pub use channel::Location;
pub use channel::ResultChannel;
pub use channel::ResultRecord;
pub use channel::ResultSink;
pub use channel::TextSink;
pub use checkpoint::CheckpointError;
pub use checkpoint::Checkpoints;
pub use context::SubRunEnv;
pub use context::TestContext;
pub use descriptor::Capability;
pub use descriptor::CapabilityAction;
pub use descriptor::CgroupRequest;
pub use descriptor::CgroupVersion;
pub use descriptor::DescriptorError;
pub use descriptor::DeviceRequest;
pub use descriptor::FormatRequest;
pub use descriptor::HugePagePolicy;
pub use descriptor::HugePageRequest;
pub use descriptor::MountRequest;
pub use descriptor::OptionSpec;
pub use descriptor::ResourceRequest;
pub use descriptor::TestBody;
pub use descriptor::TestDescriptor;
pub use descriptor::TestDescriptorBuilder;
pub use descriptor::TimeoutSetting;
pub use driver::Driver;
pub use driver::RunReport;
pub use driver::SubRunOutcome;
pub use driver::SubRunStatus;
pub use driver::run_main;
pub use error::HarnessError;
pub use error::TestAbort;
pub use error::TestResult;
pub use governor::Governor;
pub use governor::ScaledTimeout;
pub use governor::TimeoutPolicy;
pub use probe::HostProbe;
pub use probe::KernelVersion;
pub use probe::SystemProbe;
pub use severity::Severity;
pub use severity::TallySnapshot;
pub use severity::Verdict;
pub use shm::IPC_PATH_ENV;
pub use shm::SharedRegion;
pub use supervisor::ChildExit;
pub use supervisor::ChildKind;
pub use supervisor::ForkRole;
pub use supervisor::ProcessSupervisor;
pub use supervisor::exit_child;
