// crates/kconform-core/src/driver/process.rs
// ============================================================================
// Module: Test Process
// Description: Forks one test process per sub-run and supervises it.
// Purpose: Run setup, the sub-case loop, and cleanup in an isolated process
//          group that the driver can always kill and sweep.
// Dependencies: nix, crate::context
// ============================================================================

//! ## Overview
//! The test process leads its own process group and dies with the driver.
//! The driver polls it, enforces the run deadline with SIGKILL to the whole
//! group, and reaps everything left in the group afterwards.
//! Invariants:
//! - Cleanup runs once per sub-run after setup was attempted, even when the
//!   body aborted.
//! - A sub-case that reported nothing yields BROKEN.
//! - Children are killed before reaping when a sub-case aborts.

#![allow(unsafe_code, reason = "Forking the test process and installing signal handlers need libc calls.")]

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use kconform_config::HarnessConfig;
use kconform_config::SupervisorConfig;
use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::sys::signal::killpg;
use nix::sys::signal::sigaction;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use nix::unistd::fork;
use nix::unistd::setpgid;

use crate::channel::Location;
use crate::channel::ResultChannel;
use crate::context::SubRunEnv;
use crate::context::TestContext;
use crate::descriptor::ProvisionScope;
use crate::descriptor::TestBody;
use crate::descriptor::TestDescriptor;
use crate::driver::SubRunStatus;
use crate::driver::factory_for;
use crate::error::HarnessError;
use crate::error::TestResult;
use crate::governor::Governor;
use crate::provision::Provisioner;
use crate::severity::Severity;
use crate::shm::IPC_PATH_ENV;
use crate::supervisor::ChildExit;
use crate::supervisor::exit_child;

/// Set by SIGINT/SIGTERM in the driver process.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Handler for SIGINT and SIGTERM.
extern "C" fn request_stop(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Makes SIGINT and SIGTERM stop the run instead of killing the driver.
pub(crate) fn install_stop_handlers() {
    let action = SigAction::new(SigHandler::Handler(request_stop), SaFlags::SA_RESTART, SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic flag.
        let _ = unsafe { sigaction(signal, &action) };
    }
}

/// Restores default SIGINT and SIGTERM dispositions in a test process.
fn reset_stop_handlers() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: installing the default disposition has no handler code.
        let _ = unsafe { sigaction(signal, &action) };
    }
}

/// Returns true once SIGINT or SIGTERM was received.
pub(crate) fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

// ============================================================================
// SECTION: Repetition
// ============================================================================

/// How often the sub-case loop repeats inside one test process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Repeat {
    /// Number of passes (`-i`).
    pub(crate) iterations: u32,
    /// Wall-clock duration (`-I`); wins over `iterations`.
    pub(crate) duration: Option<Duration>,
}

impl Default for Repeat {
    fn default() -> Self {
        Self {
            iterations: 1,
            duration: None,
        }
    }
}

// ============================================================================
// SECTION: Test Process
// ============================================================================

/// Everything a test process needs for one sub-run.
pub(crate) struct TestProcess<'a> {
    /// Test declaration.
    pub(crate) descriptor: &'a TestDescriptor,
    /// Harness configuration.
    pub(crate) config: &'a HarnessConfig,
    /// Result channel.
    pub(crate) channel: &'a ResultChannel,
    /// Run-wide time budget.
    pub(crate) governor: &'a Governor,
    /// Resolved sub-run environment.
    pub(crate) env: &'a SubRunEnv,
    /// Repetition settings.
    pub(crate) repeat: Repeat,
}

impl TestProcess<'_> {
    /// Forks the test process and supervises it until it is gone.
    pub(crate) fn run(&self) -> Result<SubRunStatus, HarnessError> {
        // SAFETY: the child runs only harness and test code and leaves
        // through `_exit`.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => self.child_main(),
            Ok(ForkResult::Parent {
                child,
            }) => child,
            Err(errno) => return Err(HarnessError::Fork(errno.to_string())),
        };
        let _ = setpgid(child, child);
        let status = self.supervise(child);
        sweep_group(child);
        Ok(status)
    }

    /// Entry point of the forked test process.
    fn child_main(&self) -> ! {
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
        let _ = prctl::set_pdeathsig(Signal::SIGKILL);
        reset_stop_handlers();
        let region = self.channel.region();
        if region.is_exported() {
            // SAFETY: the freshly forked test process has a single thread.
            unsafe { std::env::set_var(IPC_PATH_ENV, region.path()) };
        }
        if let Some(dir) = &self.env.resources.scratch_dir {
            let _ = std::env::set_current_dir(dir);
        }
        let location = Location::caller();
        if catch_unwind(AssertUnwindSafe(|| self.test_main())).is_err() {
            self.channel.set_cleanup(false);
            self.channel.report(Severity::Broken, location, "test process panicked");
        }
        exit_child(0)
    }

    /// Process-scoped resources, setup, the repeated body, and cleanup.
    fn test_main(&self) {
        let location = Location::caller();
        let mut provisioner = Provisioner::new();
        let all_filesystems = self.descriptor.all_filesystems;
        for request in &self.descriptor.resources {
            if request.scope(all_filesystems) != ProvisionScope::Process {
                continue;
            }
            let factory = factory_for(request, self.config, &self.descriptor.tid);
            if let Err(err) = provisioner.acquire(factory.as_ref()) {
                self.channel.report(err.severity(), location, &err.to_string());
                return;
            }
        }
        let mut ctx = TestContext::new(self.channel, self.env, self.descriptor.forks_child);
        let setup_result = match &self.descriptor.setup {
            Some(setup) => run_step(&mut ctx, setup.as_ref()),
            None => Ok(()),
        };
        if setup_result.is_ok() {
            self.governor.start_runtime();
            self.repeat_body(&mut ctx);
        }
        self.channel.set_cleanup(true);
        if let Some(cleanup) = &self.descriptor.cleanup {
            let _ = run_step(&mut ctx, cleanup.as_ref());
        }
        ctx.kill_children();
        ctx.reap_children();
        self.channel.set_cleanup(false);
        for failure in provisioner.teardown() {
            self.channel.report(Severity::Warn, location, &failure.error.to_string());
        }
    }

    /// Repeats the sub-case loop per `-i`/`-I`; an abort ends repetition.
    fn repeat_body(&self, ctx: &mut TestContext<'_>) {
        let started = Instant::now();
        let mut passes = 0_u32;
        loop {
            if self.run_cases(ctx).is_err() {
                return;
            }
            passes = passes.saturating_add(1);
            let finished = match self.repeat.duration {
                Some(duration) => started.elapsed() >= duration,
                None => passes >= self.repeat.iterations,
            };
            if finished {
                return;
            }
        }
    }

    /// Runs every sub-case once.
    fn run_cases(&self, ctx: &mut TestContext<'_>) -> TestResult {
        match &self.descriptor.body {
            TestBody::PerCase(body) => {
                for case in 0 .. self.descriptor.tcnt {
                    run_case(ctx, |ctx| body(ctx, case))?;
                }
                Ok(())
            }
            TestBody::Single(body) => run_case(ctx, body.as_ref()),
        }
    }

    /// Polls the test process until it exits, times out, or the run stops.
    fn supervise(&self, child: Pid) -> SubRunStatus {
        let location = Location::caller();
        let supervisor = &self.config.supervisor;
        let poll = Duration::from_millis(supervisor.poll_interval_ms);
        loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, 0)) => return SubRunStatus::Completed,
                Ok(WaitStatus::Exited(_, code)) => {
                    self.channel.report(Severity::Broken, location, &format!("test process exited with {code}"));
                    return SubRunStatus::Crashed(ChildExit::Exited(code));
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.channel.report(
                        Severity::Broken,
                        location,
                        &format!("test process killed by {}", signal.as_str()),
                    );
                    return SubRunStatus::Crashed(ChildExit::Signaled(signal));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => {
                    self.channel.report(Severity::Broken, location, &format!("waitpid on test process: {errno}"));
                    kill_group(child, supervisor);
                    return SubRunStatus::Crashed(ChildExit::Signaled(Signal::SIGKILL));
                }
            }
            if stop_requested() {
                let killed = kill_group(child, supervisor);
                self.channel.report(Severity::Broken, location, &kill_message("interrupted, test process killed", killed));
                return SubRunStatus::Interrupted;
            }
            if self.governor.expired() {
                let killed = kill_group(child, supervisor);
                self.channel.report(
                    Severity::Broken,
                    location,
                    &kill_message("test killed, timeout? Raise KCONFORM_TIMEOUT_MUL if the system is slow", killed),
                );
                return SubRunStatus::TimedOut;
            }
            thread::sleep(poll);
        }
    }
}

/// Appends a note when the test process survived every SIGKILL.
fn kill_message(message: &str, killed: bool) -> String {
    if killed { message.to_string() } else { format!("{message}; test process did not die after SIGKILL") }
}

/// Runs setup or cleanup; an abort kills and reaps the step's children.
///
/// A forked child returning from the step exits here.
fn run_step(ctx: &mut TestContext<'_>, step: impl FnOnce(&mut TestContext<'_>) -> TestResult) -> TestResult {
    let result = step(ctx);
    if ctx.in_forked_child() {
        ctx.exit(result);
    }
    if result.is_err() {
        ctx.kill_children();
        ctx.reap_children();
    }
    result
}

/// Runs one sub-case, reaps its children, and flags silent sub-cases.
///
/// A forked child returning from the sub-case exits here.
fn run_case(ctx: &mut TestContext<'_>, case: impl FnOnce(&mut TestContext<'_>) -> TestResult) -> TestResult {
    let location = Location::caller();
    let before = ctx.channel().snapshot();
    let result = case(ctx);
    if ctx.in_forked_child() {
        ctx.exit(result);
    }
    if result.is_err() {
        ctx.kill_children();
    }
    ctx.reap_children();
    if !ctx.channel().snapshot().has_new_results_since(&before) {
        ctx.channel().report(Severity::Broken, location, "test did not report any results");
    }
    result
}

/// SIGKILLs the test process group until the leader is reaped.
fn kill_group(leader: Pid, supervisor: &SupervisorConfig) -> bool {
    let interval = Duration::from_millis(supervisor.kill_retry_interval_ms);
    for _ in 0 ..= supervisor.kill_retries {
        if killpg(leader, Signal::SIGKILL).is_err() {
            let _ = kill(leader, Signal::SIGKILL);
        }
        let deadline = Instant::now() + interval;
        loop {
            match waitpid(leader, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
                _ => return true,
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
    false
}

/// Kills whatever is left in the group and reaps members reparented to us.
fn sweep_group(pgid: Pid) {
    let _ = killpg(pgid, Signal::SIGKILL);
    let group = Pid::from_raw(-pgid.as_raw());
    while matches!(waitpid(group, None), Ok(_) | Err(Errno::EINTR)) {}
}
