// crates/kconform-core/examples/getppid.rs
// ============================================================================
// Module: getppid Conformance Example
// Description: Small syscall test declared with a descriptor and run_main.
// Purpose: Show sub-cases, supervised children, checkpoints, and signals.
// Dependencies: kconform-core, nix
// ============================================================================

//! ## Overview
//! Case 0 checks that a forked child sees its parent through `getppid(2)`.
//! Case 1 parks a child on a checkpoint and expects it to die from SIGUSR1.

use std::io::Write;
use std::process::ExitCode;

use kconform_core::ChildKind;
use kconform_core::TestBody;
use kconform_core::TestContext;
use kconform_core::TestDescriptor;
use kconform_core::TestResult;
use kconform_core::run_main;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::getpid;
use nix::unistd::getppid;

/// Child reports whether `getppid` returns the forking process.
fn parent_is_visible(ctx: &mut TestContext<'_>) -> TestResult {
    let parent = getpid();
    let child = ctx.spawn(ChildKind::Supervised, move |child| {
        let seen = getppid();
        if seen == parent {
            child.pass(format!("getppid() returned {seen}"));
        } else {
            child.fail(format!("getppid() returned {seen}, expected {parent}"));
        }
        Ok(())
    })?;
    ctx.wait_child(child)?;
    Ok(())
}

/// Child waits on checkpoint 0 until it is killed.
fn signal_terminates_child(ctx: &mut TestContext<'_>) -> TestResult {
    let child = ctx.spawn(ChildKind::Supervised, |child| {
        child.checkpoint_wake(0)?;
        child.checkpoint_wait_timeout(1, None)
    })?;
    ctx.checkpoint_wait(0)?;
    ctx.expect_signal(child, Signal::SIGUSR1)?;
    if let Err(errno) = kill(child, Signal::SIGUSR1) {
        return Err(ctx.broken(format!("kill(SIGUSR1) failed: {errno}")));
    }
    ctx.reap_children();
    ctx.pass("child terminated by SIGUSR1");
    Ok(())
}

/// Declares the test and hands it to the driver.
fn main() -> ExitCode {
    let descriptor = TestDescriptor::builder(
        "getppid01",
        TestBody::per_case(|ctx, case| match case {
            0 => parent_is_visible(ctx),
            _ => signal_terminates_child(ctx),
        }),
    )
    .tcnt(2)
    .forks_child()
    .build();
    match descriptor {
        Ok(descriptor) => run_main(descriptor, std::env::args_os()),
        Err(err) => {
            let _ = writeln!(std::io::stderr(), "getppid01: {err}");
            ExitCode::from(2)
        }
    }
}
