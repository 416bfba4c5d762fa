// crates/kconform-core/src/context.rs
// ============================================================================
// Module: Test Context
// Description: Explicit per-process handle passed to setup, body, and cleanup.
// Purpose: Give test code reporting, synchronization, forking, and budget
//          queries without process-global state.
// Dependencies: nix, crate::{channel, checkpoint, supervisor, governor}
// ============================================================================

//! ## Overview
//! A [`TestContext`] lives inside one test process (or one of its children)
//! and borrows the run's [`ResultChannel`]. Reporting helpers capture the
//! caller's `file:line`. Aborting helpers report first and return a
//! [`TestAbort`] token that test code propagates with `?`.
//! Invariants:
//! - Every [`TestAbort`] handed out has already been reported.
//! - Children forked through the context exit through `_exit` with the
//!   severity code of their result; they never return into the caller.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use nix::unistd::getpid;

use crate::channel::Location;
use crate::channel::ResultChannel;
use crate::checkpoint::Checkpoints;
use crate::error::TestAbort;
use crate::error::TestResult;
use crate::governor;
use crate::provision::ProvisionState;
use crate::severity::Severity;
use crate::supervisor::ChildExit;
use crate::supervisor::ChildKind;
use crate::supervisor::ForkRole;
use crate::supervisor::ProcessSupervisor;
use crate::supervisor::exit_child;

// ============================================================================
// SECTION: Sub-Run Environment
// ============================================================================

/// What the driver resolved for one sub-run.
#[derive(Debug, Clone, Default)]
pub struct SubRunEnv {
    /// Variant index.
    pub variant: u32,
    /// Filesystem under test, when the test formats or iterates filesystems.
    pub filesystem: Option<String>,
    /// Provisioned resources visible to the test.
    pub resources: ProvisionState,
    /// Parsed test-specific options; flags map to an empty string.
    pub options: BTreeMap<String, String>,
    /// Default checkpoint timeout.
    pub checkpoint_timeout: Option<Duration>,
}

// ============================================================================
// SECTION: Context
// ============================================================================

/// Handle threaded through test entry points.
pub struct TestContext<'run> {
    /// Result channel of the run.
    channel: &'run ResultChannel,
    /// Checkpoints in the shared region.
    checkpoints: Checkpoints,
    /// Children of this process.
    supervisor: ProcessSupervisor,
    /// Sub-run environment.
    env: &'run SubRunEnv,
    /// Pid of the test process that created the context.
    main_pid: Pid,
}

impl<'run> TestContext<'run> {
    /// Creates the context for a test process.
    pub(crate) fn new(channel: &'run ResultChannel, env: &'run SubRunEnv, forks_allowed: bool) -> Self {
        Self {
            channel,
            checkpoints: Checkpoints::new(Rc::clone(channel.region())),
            supervisor: ProcessSupervisor::new(forks_allowed).draining_untracked(),
            env,
            main_pid: getpid(),
        }
    }

    /// True in a child forked from the test process through this context.
    pub(crate) fn in_forked_child(&self) -> bool {
        getpid() != self.main_pid
    }

    /// Returns the result channel.
    pub(crate) const fn channel(&self) -> &'run ResultChannel {
        self.channel
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    /// Records a result and continues.
    #[track_caller]
    pub fn report(&self, severity: Severity, message: impl AsRef<str>) {
        self.channel.report(severity, Location::caller(), message.as_ref());
    }

    /// Records a PASS.
    #[track_caller]
    pub fn pass(&self, message: impl AsRef<str>) {
        self.report(Severity::Pass, message);
    }

    /// Records a FAIL.
    #[track_caller]
    pub fn fail(&self, message: impl AsRef<str>) {
        self.report(Severity::Fail, message);
    }

    /// Records a WARN.
    #[track_caller]
    pub fn warn(&self, message: impl AsRef<str>) {
        self.report(Severity::Warn, message);
    }

    /// Records an INFO note.
    #[track_caller]
    pub fn info(&self, message: impl AsRef<str>) {
        self.report(Severity::Info, message);
    }

    /// Records `severity` and returns the abort token.
    ///
    /// Only PASS, FAIL, BROKEN and UNSUPPORTED can abort; anything else is
    /// reported as BROKEN.
    #[track_caller]
    pub fn abort(&self, severity: Severity, message: impl AsRef<str>) -> TestAbort {
        self.channel.abort(severity, Location::caller(), message.as_ref())
    }

    /// Records BROKEN and returns the abort token.
    #[track_caller]
    pub fn broken(&self, message: impl AsRef<str>) -> TestAbort {
        self.abort(Severity::Broken, message)
    }

    /// Records UNSUPPORTED and returns the abort token.
    #[track_caller]
    pub fn unsupported(&self, message: impl AsRef<str>) -> TestAbort {
        self.abort(Severity::Unsupported, message)
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Waits on checkpoint `id` with the default timeout.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN on timeout or an invalid id.
    #[track_caller]
    pub fn checkpoint_wait(&self, id: usize) -> TestResult {
        self.checkpoint_wait_timeout(id, self.env.checkpoint_timeout)
    }

    /// Waits on checkpoint `id`; `None` waits forever.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN on timeout or an invalid id.
    #[track_caller]
    pub fn checkpoint_wait_timeout(&self, id: usize, timeout: Option<Duration>) -> TestResult {
        let location = Location::caller();
        self.checkpoints
            .wait(id, timeout)
            .map_err(|err| self.channel.abort(Severity::Broken, location, &err.to_string()))
    }

    /// Wakes one waiter on checkpoint `id`.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN when no waiter consumes the wake in time.
    #[track_caller]
    pub fn checkpoint_wake(&self, id: usize) -> TestResult {
        self.checkpoint_wake_n(id, 1)
    }

    /// Wakes `count` waiters on checkpoint `id`.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN when fewer than `count` waiters consume in time.
    #[track_caller]
    pub fn checkpoint_wake_n(&self, id: usize, count: u32) -> TestResult {
        let location = Location::caller();
        self.checkpoints
            .wake(id, count, self.env.checkpoint_timeout)
            .map_err(|err| self.channel.abort(Severity::Broken, location, &err.to_string()))
    }

    /// Wakes one waiter on `id`, then waits on `id` itself.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN when either half times out.
    #[track_caller]
    pub fn checkpoint_wake_and_wait(&self, id: usize) -> TestResult {
        let location = Location::caller();
        self.checkpoints
            .wake_and_wait(id, self.env.checkpoint_timeout)
            .map_err(|err| self.channel.abort(Severity::Broken, location, &err.to_string()))
    }

    // ------------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------------

    /// Forks a tracked child and returns the role of the caller.
    ///
    /// The child should finish with [`TestContext::exit`]. A child that
    /// returns from the test entry point instead is exited with the severity
    /// code of its result and never runs cleanup or further sub-cases.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN when forking is not declared or fails.
    #[track_caller]
    pub fn fork_child(&mut self, kind: ChildKind) -> TestResult<ForkRole> {
        let location = Location::caller();
        self.supervisor
            .guarded_fork(kind)
            .map_err(|err| self.channel.abort(Severity::Broken, location, &err.to_string()))
    }

    /// Runs `child` in a tracked child process and returns its pid.
    ///
    /// The child reaps its own descendants and exits with the severity code
    /// of `child`'s result, 0 on success. A panic is reported BROKEN.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN when forking is not declared or fails.
    #[track_caller]
    pub fn spawn<F>(&mut self, kind: ChildKind, child: F) -> TestResult<Pid>
    where
        F: FnOnce(&mut TestContext<'_>) -> TestResult,
    {
        let location = Location::caller();
        match self.fork_child(kind)? {
            ForkRole::Parent(pid) => Ok(pid),
            ForkRole::Child => {
                let result = match catch_unwind(AssertUnwindSafe(|| child(self))) {
                    Ok(result) => result,
                    Err(_) => Err(self.channel.abort(Severity::Broken, location, "child panicked")),
                };
                self.exit(result)
            }
        }
    }

    /// Ends a forked child: reaps its descendants and exits with the
    /// severity code of `result`.
    pub fn exit(&mut self, result: TestResult) -> ! {
        if result.is_err() {
            self.supervisor.kill_all();
        }
        let _ = self.supervisor.reap_all(self.channel);
        let code = result.err().map_or(0, TestAbort::exit_code);
        exit_child(i32::from(code))
    }

    /// Waits for every outstanding child, reporting abnormal terminations.
    #[track_caller]
    pub fn reap_children(&mut self) {
        let _ = self.supervisor.reap_all(self.channel);
    }

    /// Waits for one child and returns how it terminated.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN for unknown pids or wait failures.
    #[track_caller]
    pub fn wait_child(&mut self, pid: Pid) -> TestResult<ChildExit> {
        let location = Location::caller();
        self.supervisor
            .wait_child(pid)
            .map_err(|err| self.channel.abort(Severity::Broken, location, &err.to_string()))
    }

    /// Declares that `pid` is expected to die from `signal`.
    ///
    /// # Errors
    ///
    /// Aborts with BROKEN for unknown pids.
    #[track_caller]
    pub fn expect_signal(&mut self, pid: Pid, signal: Signal) -> TestResult {
        let location = Location::caller();
        self.supervisor
            .expect_signal(pid, signal)
            .map_err(|err| self.channel.abort(Severity::Broken, location, &err.to_string()))
    }

    /// SIGKILLs and reaps every outstanding child.
    pub fn kill_children(&mut self) {
        self.supervisor.kill_all();
    }

    // ------------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------------

    /// Time left until the run deadline; `None` when disabled.
    #[must_use]
    pub fn remaining_timeout(&self) -> Option<Duration> {
        governor::remaining_timeout(self.channel.region())
    }

    /// Runtime left in this sub-run's window.
    #[must_use]
    pub fn remaining_runtime(&self) -> Duration {
        governor::remaining_runtime(self.channel.region())
    }

    // ------------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------------

    /// Current variant index.
    #[must_use]
    pub const fn variant(&self) -> u32 {
        self.env.variant
    }

    /// Filesystem under test.
    #[must_use]
    pub fn filesystem(&self) -> Option<&str> {
        self.env.filesystem.as_deref()
    }

    /// Scratch directory, also the working directory of the test process.
    #[must_use]
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.env.resources.scratch_dir.as_deref()
    }

    /// Block device node.
    #[must_use]
    pub fn device(&self) -> Option<&Path> {
        self.env.resources.device.as_deref()
    }

    /// Mounted filesystem location.
    #[must_use]
    pub fn mount_point(&self) -> Option<&Path> {
        self.env.resources.mount_point.as_deref()
    }

    /// Test cgroup directory.
    #[must_use]
    pub fn cgroup_dir(&self) -> Option<&Path> {
        self.env.resources.cgroup_dir.as_deref()
    }

    /// Huge pages reserved for the test.
    #[must_use]
    pub const fn hugepages(&self) -> u64 {
        self.env.resources.hugepages
    }

    /// Path of the shared region when exported to exec'd helpers.
    #[must_use]
    pub fn ipc_path(&self) -> Option<&Path> {
        let region = self.channel.region();
        region.is_exported().then(|| region.path())
    }

    /// Value of a test-specific option.
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&str> {
        self.env.options.get(name).map(String::as_str)
    }

    /// True when a test-specific flag or option was given.
    #[must_use]
    pub fn option_flag(&self, name: &str) -> bool {
        self.env.options.contains_key(name)
    }
}
