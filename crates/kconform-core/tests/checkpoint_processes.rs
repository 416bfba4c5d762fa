// crates/kconform-core/tests/checkpoint_processes.rs
// ============================================================================
// Module: Checkpoint Cross-Process Tests
// Description: Wake and wait between forked processes over a shared region.
// Purpose: Verify token accounting when waiters live in other processes.
// ============================================================================

//! Cross-process checkpoint tests.

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
    unsafe_code,
    reason = "Test-only assertions, helpers, and raw fork are permitted."
)]

use std::rc::Rc;
use std::sync::Mutex;
use std::time::Duration;

use kconform_core::CheckpointError;
use kconform_core::Checkpoints;
use kconform_core::SharedRegion;
use kconform_core::exit_child;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use nix::unistd::fork;

/// Serializes forking tests.
static FORK_LOCK: Mutex<()> = Mutex::new(());

const GENEROUS: Duration = Duration::from_secs(10);

fn spawn_waiters(checkpoints: &Checkpoints, id: usize, count: usize) -> Vec<Pid> {
    (0 .. count)
        .map(|_| {
            // SAFETY: the child only touches the shared mapping and exits.
            match unsafe { fork() }.unwrap() {
                ForkResult::Child => {
                    let code = i32::from(checkpoints.wait(id, Some(GENEROUS)).is_err());
                    exit_child(code)
                }
                ForkResult::Parent {
                    child,
                } => child,
            }
        })
        .collect()
}

fn exit_codes(children: Vec<Pid>) -> Vec<i32> {
    children
        .into_iter()
        .map(|child| match waitpid(child, None).unwrap() {
            WaitStatus::Exited(_, code) => code,
            other => panic!("unexpected child status {other:?}"),
        })
        .collect()
}

#[test]
fn wake_releases_exactly_the_requested_waiters() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let region = Rc::new(SharedRegion::create(dir.path(), "cp_wake", false).unwrap());
    let checkpoints = Checkpoints::new(Rc::clone(&region));
    let children = spawn_waiters(&checkpoints, 4, 3);
    checkpoints.wake(4, 3, Some(GENEROUS)).unwrap();
    assert_eq!(exit_codes(children), vec![0, 0, 0]);
    assert_eq!(checkpoints.counters(4).unwrap(), (3, 3));
}

#[test]
fn waking_more_than_waiting_times_out() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let region = Rc::new(SharedRegion::create(dir.path(), "cp_over", false).unwrap());
    let checkpoints = Checkpoints::new(Rc::clone(&region));
    let children = spawn_waiters(&checkpoints, 7, 2);
    let err = checkpoints.wake(7, 3, Some(Duration::from_millis(500))).unwrap_err();
    assert_eq!(
        err,
        CheckpointError::Timeout {
            id: 7,
            operation: "wake",
        }
    );
    assert_eq!(exit_codes(children), vec![0, 0]);
    assert!(checkpoints.wait(7, Some(Duration::from_millis(20))).is_err());
    assert_eq!(checkpoints.counters(7).unwrap(), (3, 3));
}

#[test]
fn wake_and_wait_ping_pongs_between_processes() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let region = Rc::new(SharedRegion::create(dir.path(), "cp_pong", false).unwrap());
    let checkpoints = Checkpoints::new(Rc::clone(&region));
    // SAFETY: the child only touches the shared mapping and exits.
    let child = match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let ok = checkpoints.wait(0, Some(GENEROUS)).is_ok() && checkpoints.wake(1, 1, Some(GENEROUS)).is_ok();
            exit_child(i32::from(!ok))
        }
        ForkResult::Parent {
            child,
        } => child,
    };
    checkpoints.wake(0, 1, Some(GENEROUS)).unwrap();
    checkpoints.wait(1, Some(GENEROUS)).unwrap();
    assert_eq!(exit_codes(vec![child]), vec![0]);
}
