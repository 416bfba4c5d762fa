// crates/kconform-core/src/supervisor.rs
// ============================================================================
// Module: Process Supervisor
// Description: Guarded fork, reaping, and abnormal-termination accounting.
// Purpose: Make every child a tracked record whose failure reaches the tally.
// Dependencies: libc, nix, thiserror, crate::channel
// ============================================================================

//! ## Overview
//! A [`ProcessSupervisor`] belongs to one process and tracks the children it
//! forked. [`ProcessSupervisor::reap_all`] waits for all of them, classifies
//! their termination and reports abnormal ones through the result channel.
//! Invariants:
//! - Forking is refused unless the test declared that it forks children.
//! - A child exiting with a severity exit code already reported its result
//!   and is not counted again.
//! - Stopped children are killed and reaped, never left behind.

// ============================================================================
// SECTION: Imports
// ============================================================================

#![allow(unsafe_code, reason = "fork(2) and _exit(2) are raw process-lifecycle calls.")]

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use nix::unistd::fork;
use thiserror::Error;

use crate::channel::Location;
use crate::channel::ResultChannel;
use crate::severity::Severity;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Supervisor errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// The test did not declare that it forks children.
    #[error("test forks children but does not declare forks_child")]
    ForksNotDeclared,
    /// fork(2) failed.
    #[error("fork failed: {0}")]
    Fork(Errno),
    /// waitpid(2) failed.
    #[error("waitpid({pid}) failed: {errno}")]
    Wait {
        /// Waited pid.
        pid: i32,
        /// Error number.
        errno: Errno,
    },
    /// The pid is not a tracked child.
    #[error("pid {0} is not a supervised child")]
    UnknownChild(i32),
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// How a child participates in result accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Abnormal termination is a FAIL.
    Supervised,
    /// Termination is only noted at INFO.
    Orphan,
}

/// Result of a guarded fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    /// Returned in the parent with the child's pid.
    Parent(Pid),
    /// Returned in the child.
    Child,
}

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Stopped by a signal; the supervisor killed and reaped it afterwards.
    Stopped(Signal),
}

/// Lifecycle of a tracked child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Forked and not yet waited for.
    Running,
    /// Waited for with the given termination.
    Reaped(ChildExit),
}

/// One tracked child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    /// Child pid.
    pub pid: Pid,
    /// Accounting kind.
    pub kind: ChildKind,
    /// Signal the test expects to terminate the child.
    pub expected_signal: Option<Signal>,
    /// Lifecycle state.
    pub state: ChildState,
}

/// How a reaped child was accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildVerdict {
    /// Clean exit or expected signal.
    Clean,
    /// Exited with a severity code; its result is already in the tally.
    ReportedByChild(Severity),
    /// Terminated abnormally; a result was raised for it.
    Abnormal(Severity),
}

// ============================================================================
// SECTION: Supervisor
// ============================================================================

/// Tracks and reaps the children of one process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    /// Whether forking is permitted.
    forks_allowed: bool,
    /// Whether `reap_all` also drains untracked children.
    drain_untracked: bool,
    /// Tracked children in fork order.
    children: Vec<ChildRecord>,
}

impl ProcessSupervisor {
    /// Creates a supervisor; `forks_allowed` mirrors the test's declaration.
    #[must_use]
    pub const fn new(forks_allowed: bool) -> Self {
        Self {
            forks_allowed,
            drain_untracked: false,
            children: Vec::new(),
        }
    }

    /// Makes `reap_all` drain every child of the process, tracked or not.
    ///
    /// Only valid in single-threaded processes that own all their children.
    #[must_use]
    pub const fn draining_untracked(mut self) -> Self {
        self.drain_untracked = true;
        self
    }

    /// Returns the tracked children.
    #[must_use]
    pub fn children(&self) -> &[ChildRecord] {
        &self.children
    }

    /// Returns the number of children not yet reaped.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.children.iter().filter(|child| child.state == ChildState::Running).count()
    }

    /// Forks a tracked child.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::ForksNotDeclared`] when forking is not
    /// permitted, or [`SupervisorError::Fork`] when fork(2) fails.
    pub fn guarded_fork(&mut self, kind: ChildKind) -> Result<ForkRole, SupervisorError> {
        if !self.forks_allowed {
            return Err(SupervisorError::ForksNotDeclared);
        }
        // SAFETY: the child only continues into test code of this crate and
        // leaves through `_exit`; it never returns into a caller's threads.
        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Parent {
                child,
            } => {
                self.children.push(ChildRecord {
                    pid: child,
                    kind,
                    expected_signal: None,
                    state: ChildState::Running,
                });
                Ok(ForkRole::Parent(child))
            }
            ForkResult::Child => {
                self.children.clear();
                self.drain_untracked = true;
                Ok(ForkRole::Child)
            }
        }
    }

    /// Declares that `pid` is expected to die from `signal`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownChild`] for untracked pids.
    pub fn expect_signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SupervisorError> {
        let child = self.record_mut(pid)?;
        child.expected_signal = Some(signal);
        Ok(())
    }

    /// Reaps one specific child and returns how it terminated.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] when the pid is unknown or waitpid fails.
    pub fn wait_child(&mut self, pid: Pid) -> Result<ChildExit, SupervisorError> {
        let record = self.record_mut(pid)?;
        if let ChildState::Reaped(exit) = record.state {
            return Ok(exit);
        }
        let exit = wait_one(pid)?;
        record.state = ChildState::Reaped(exit);
        Ok(exit)
    }

    /// Waits for every outstanding child and reports abnormal terminations.
    ///
    /// With [`ProcessSupervisor::draining_untracked`], children that were not
    /// forked through the supervisor are drained as supervised children.
    #[track_caller]
    pub fn reap_all(&mut self, channel: &ResultChannel) -> Vec<(Pid, ChildVerdict)> {
        let location = Location::caller();
        let mut verdicts = Vec::new();
        let pending: Vec<Pid> = self
            .children
            .iter()
            .filter(|child| child.state == ChildState::Running)
            .map(|child| child.pid)
            .collect();
        for pid in pending {
            match self.wait_child(pid) {
                Ok(_) => {
                    if let Ok(record) = self.record_mut(pid) {
                        let record = record.clone();
                        verdicts.push((pid, account(&record, channel, location)));
                    }
                }
                Err(err) => {
                    channel.report(Severity::Broken, location, &err.to_string());
                    if let Ok(record) = self.record_mut(pid) {
                        record.state = ChildState::Reaped(ChildExit::Signaled(Signal::SIGKILL));
                    }
                }
            }
        }
        if !self.drain_untracked {
            return verdicts;
        }
        loop {
            match waitpid(None, Some(WaitPidFlag::WUNTRACED)) {
                Ok(status) => {
                    let Some((pid, exit)) = classify(status) else {
                        continue;
                    };
                    let exit = finish_stopped(pid, exit);
                    let record = ChildRecord {
                        pid,
                        kind: ChildKind::Supervised,
                        expected_signal: None,
                        state: ChildState::Reaped(exit),
                    };
                    verdicts.push((pid, account(&record, channel, location)));
                }
                Err(Errno::EINTR) => {}
                Err(_) => break,
            }
        }
        verdicts
    }

    /// Kills every outstanding child with SIGKILL and reaps it.
    pub fn kill_all(&mut self) {
        for child in &mut self.children {
            if child.state != ChildState::Running {
                continue;
            }
            let _ = kill(child.pid, Signal::SIGKILL);
            let exit = wait_one(child.pid).unwrap_or(ChildExit::Signaled(Signal::SIGKILL));
            child.state = ChildState::Reaped(exit);
        }
    }

    /// Returns the record for `pid`.
    fn record_mut(&mut self, pid: Pid) -> Result<&mut ChildRecord, SupervisorError> {
        self.children
            .iter_mut()
            .find(|child| child.pid == pid)
            .ok_or(SupervisorError::UnknownChild(pid.as_raw()))
    }
}

// ============================================================================
// SECTION: Wait Helpers
// ============================================================================

/// Maps a wait status to a child exit, ignoring non-terminal states.
fn classify(status: WaitStatus) -> Option<(Pid, ChildExit)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, ChildExit::Exited(code))),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, ChildExit::Signaled(signal))),
        WaitStatus::Stopped(pid, signal) => Some((pid, ChildExit::Stopped(signal))),
        _ => None,
    }
}

/// Terminates the calling child without running exit handlers or
/// flushing stdio buffers inherited from the parent.
pub fn exit_child(code: i32) -> ! {
    // SAFETY: `_exit` only ends the calling process; it touches no memory
    // shared with other threads of this process.
    unsafe { libc::_exit(code) }
}

/// Kills and reaps a stopped child; other exits pass through.
fn finish_stopped(pid: Pid, exit: ChildExit) -> ChildExit {
    if matches!(exit, ChildExit::Stopped(_)) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = kill(pid, Signal::SIGCONT);
        while matches!(waitpid(pid, None), Err(Errno::EINTR)) {}
    }
    exit
}

/// Waits for `pid` to terminate or stop.
fn wait_one(pid: Pid) -> Result<ChildExit, SupervisorError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(status) => {
                if let Some((_, exit)) = classify(status) {
                    return Ok(finish_stopped(pid, exit));
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => {
                return Err(SupervisorError::Wait {
                    pid: pid.as_raw(),
                    errno,
                });
            }
        }
    }
}

/// Classifies a reaped child and reports abnormal terminations.
fn account(record: &ChildRecord, channel: &ResultChannel, location: Location) -> ChildVerdict {
    let ChildState::Reaped(exit) = record.state else {
        return ChildVerdict::Clean;
    };
    let pid = record.pid;
    let problem = match exit {
        ChildExit::Exited(0) => return ChildVerdict::Clean,
        ChildExit::Exited(code) => match Severity::from_exit_code(code) {
            Some(severity) => return ChildVerdict::ReportedByChild(severity),
            None => format!("child {pid} exited with invalid code {code}"),
        },
        ChildExit::Signaled(signal) if record.expected_signal == Some(signal) => {
            return ChildVerdict::Clean;
        }
        ChildExit::Signaled(signal) => format!("child {pid} killed by {}", signal.as_str()),
        ChildExit::Stopped(signal) => format!("child {pid} stopped by {}", signal.as_str()),
    };
    let severity = match record.kind {
        ChildKind::Supervised => Severity::Fail,
        ChildKind::Orphan => Severity::Info,
    };
    channel.report(severity, location, &problem);
    ChildVerdict::Abnormal(severity)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
