// crates/kconform-core/src/supervisor/tests.rs
// ============================================================================
// Module: Supervisor Unit Tests
// Description: Fork gating, termination classification, kill and reap.
// Purpose: Ensure child failures reach the tally exactly once.
// Dependencies: kconform-core, nix, tempfile
// ============================================================================

//! ## Overview
//! Forks short-lived children and checks how [`super::ProcessSupervisor`]
//! accounts for them. Children only call async-signal-safe functions.

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

use std::rc::Rc;

use nix::sys::signal::Signal;
use nix::sys::signal::raise;
use nix::unistd::Pid;
use nix::unistd::pause;

use super::ChildExit;
use super::ChildKind;
use super::ChildVerdict;
use super::ForkRole;
use super::ProcessSupervisor;
use super::SupervisorError;
use super::exit_child;
use crate::channel::ResultChannel;
use crate::severity::Severity;
use crate::shm::SharedRegion;

fn channel() -> (tempfile::TempDir, ResultChannel) {
    let dir = tempfile::tempdir().unwrap();
    let region = SharedRegion::create(dir.path(), "supervisor", false).unwrap();
    (dir, ResultChannel::new(Rc::new(region), Vec::new()))
}

fn fork_exiting(supervisor: &mut ProcessSupervisor, kind: ChildKind, code: i32) -> Pid {
    match supervisor.guarded_fork(kind).unwrap() {
        ForkRole::Child => exit_child(code),
        ForkRole::Parent(pid) => pid,
    }
}

fn fork_raising(supervisor: &mut ProcessSupervisor, signal: Signal) -> Pid {
    match supervisor.guarded_fork(ChildKind::Supervised).unwrap() {
        ForkRole::Child => {
            let _ = raise(signal);
            exit_child(0)
        }
        ForkRole::Parent(pid) => pid,
    }
}

#[test]
fn fork_without_declaration_is_refused() {
    let mut supervisor = ProcessSupervisor::new(false);
    assert_eq!(
        supervisor.guarded_fork(ChildKind::Supervised).unwrap_err(),
        SupervisorError::ForksNotDeclared
    );
    assert!(supervisor.children().is_empty());
}

#[test]
fn severity_exit_codes_are_not_counted_twice() {
    let (_dir, channel) = channel();
    let mut supervisor = ProcessSupervisor::new(true);
    let clean = fork_exiting(&mut supervisor, ChildKind::Supervised, 0);
    let broken = fork_exiting(&mut supervisor, ChildKind::Supervised, 2);
    let verdicts = supervisor.reap_all(&channel);
    assert!(verdicts.contains(&(clean, ChildVerdict::Clean)));
    assert!(verdicts.contains(&(broken, ChildVerdict::ReportedByChild(Severity::Broken))));
    assert_eq!(channel.snapshot().result_records(), 0);
    assert_eq!(supervisor.outstanding(), 0);
}

#[test]
fn invalid_exit_code_is_a_failure() {
    let (_dir, channel) = channel();
    let mut supervisor = ProcessSupervisor::new(true);
    let pid = fork_exiting(&mut supervisor, ChildKind::Supervised, 7);
    let verdicts = supervisor.reap_all(&channel);
    assert_eq!(verdicts, vec![(pid, ChildVerdict::Abnormal(Severity::Fail))]);
    assert_eq!(channel.snapshot().count(Severity::Fail), 1);
}

#[test]
fn orphan_abnormal_exit_is_informational() {
    let (_dir, channel) = channel();
    let mut supervisor = ProcessSupervisor::new(true);
    fork_exiting(&mut supervisor, ChildKind::Orphan, 7);
    supervisor.reap_all(&channel);
    let tally = channel.snapshot();
    assert_eq!(tally.count(Severity::Info), 1);
    assert_eq!(tally.count(Severity::Fail), 0);
}

#[test]
fn unexpected_signal_fails_and_expected_signal_is_clean() {
    let (_dir, channel) = channel();
    let mut supervisor = ProcessSupervisor::new(true);
    let expected = fork_raising(&mut supervisor, Signal::SIGUSR1);
    supervisor.expect_signal(expected, Signal::SIGUSR1).unwrap();
    let unexpected = fork_raising(&mut supervisor, Signal::SIGUSR2);
    let verdicts = supervisor.reap_all(&channel);
    assert!(verdicts.contains(&(expected, ChildVerdict::Clean)));
    assert!(verdicts.contains(&(unexpected, ChildVerdict::Abnormal(Severity::Fail))));
    assert_eq!(channel.snapshot().count(Severity::Fail), 1);
}

#[test]
fn stopped_child_is_killed_and_failed() {
    let (_dir, channel) = channel();
    let mut supervisor = ProcessSupervisor::new(true);
    let pid = fork_raising(&mut supervisor, Signal::SIGSTOP);
    let verdicts = supervisor.reap_all(&channel);
    assert_eq!(verdicts, vec![(pid, ChildVerdict::Abnormal(Severity::Fail))]);
    assert_eq!(supervisor.outstanding(), 0);
    assert!(nix::sys::wait::waitpid(pid, None).is_err(), "child must already be reaped");
}

#[test]
fn wait_child_returns_exit_status() {
    let mut supervisor = ProcessSupervisor::new(true);
    let pid = fork_exiting(&mut supervisor, ChildKind::Supervised, 32);
    assert_eq!(supervisor.wait_child(pid).unwrap(), ChildExit::Exited(32));
    assert_eq!(supervisor.wait_child(pid).unwrap(), ChildExit::Exited(32));
    assert!(matches!(
        supervisor.wait_child(Pid::from_raw(1)),
        Err(SupervisorError::UnknownChild(1))
    ));
}

#[test]
fn kill_all_reaps_blocked_children() {
    let mut supervisor = ProcessSupervisor::new(true);
    for _ in 0 .. 3 {
        if supervisor.guarded_fork(ChildKind::Supervised).unwrap() == ForkRole::Child {
            loop {
                pause();
            }
        }
    }
    assert_eq!(supervisor.outstanding(), 3);
    supervisor.kill_all();
    assert_eq!(supervisor.outstanding(), 0);
    for child in supervisor.children() {
        assert_eq!(child.state, super::ChildState::Reaped(ChildExit::Signaled(Signal::SIGKILL)));
    }
}
