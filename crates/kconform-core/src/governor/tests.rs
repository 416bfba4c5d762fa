// crates/kconform-core/src/governor/tests.rs
// ============================================================================
// Module: Governor Unit Tests
// Description: Deadline arming, runtime countdown, and policy arithmetic.
// Purpose: Keep time budgets predictable across scaling factors.
// Dependencies: kconform-core, tempfile
// ============================================================================

//! ## Overview
//! Exercises [`super::Governor`] and [`super::ScaledTimeout`].

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
use std::time::Duration;

use super::Governor;
use super::ScaledTimeout;
use super::TimeBudget;
use super::TimeoutPolicy;
use crate::shm::SharedRegion;

fn region() -> (tempfile::TempDir, Rc<SharedRegion>) {
    let dir = tempfile::tempdir().unwrap();
    let region = SharedRegion::create(dir.path(), "governor", false).unwrap();
    (dir, Rc::new(region))
}

#[test]
fn scaled_timeout_applies_every_factor() {
    let policy = ScaledTimeout::new(2.0, 1.5);
    let budget = TimeBudget {
        timeout: Some(Duration::from_secs(10)),
        runtime: Some(Duration::from_secs(4)),
        factor: 3,
    };
    // (10s + 4s * 1.5) * 3 * 2 = 96s
    assert_eq!(policy.effective_timeout(&budget), Some(Duration::from_secs(96)));
    assert_eq!(policy.effective_runtime(Duration::from_secs(4)), Duration::from_secs(6));
}

#[test]
fn disabled_timeout_stays_disabled() {
    let policy = ScaledTimeout::new(5.0, 1.0);
    let budget = TimeBudget {
        timeout: None,
        runtime: Some(Duration::from_secs(1)),
        factor: 4,
    };
    assert_eq!(policy.effective_timeout(&budget), None);
}

#[test]
fn extend_multiplies_the_factor() {
    let (_dir, region) = region();
    let mut governor = Governor::new(
        region,
        Box::new(ScaledTimeout::new(1.0, 1.0)),
        Some(Duration::from_secs(2)),
        None,
    );
    governor.extend(5);
    assert_eq!(governor.budget().factor, 5);
    assert_eq!(governor.effective_timeout(), Some(Duration::from_secs(10)));
}

#[test]
fn armed_deadline_counts_down() {
    let (_dir, region) = region();
    let governor = Governor::new(
        Rc::clone(&region),
        Box::new(ScaledTimeout::new(1.0, 1.0)),
        Some(Duration::from_secs(60)),
        None,
    );
    assert_eq!(governor.remaining_timeout(), None);
    governor.arm();
    let left = governor.remaining_timeout().unwrap();
    assert!(left <= Duration::from_secs(60));
    assert!(left > Duration::from_secs(50));
    assert!(!governor.expired());
}

#[test]
fn zero_timeout_expires_immediately() {
    let (_dir, region) = region();
    let governor =
        Governor::new(region, Box::new(ScaledTimeout::new(1.0, 1.0)), Some(Duration::ZERO), None);
    governor.arm();
    std::thread::sleep(Duration::from_millis(2));
    assert!(governor.expired());
}

#[test]
fn runtime_without_window_is_zero() {
    let (_dir, region) = region();
    let governor =
        Governor::new(region, Box::new(ScaledTimeout::new(1.0, 1.0)), None, None);
    governor.start_runtime();
    assert_eq!(governor.remaining_runtime(), Duration::ZERO);
}

#[test]
fn runtime_window_counts_down_to_zero() {
    let (_dir, region) = region();
    let governor = Governor::new(
        region,
        Box::new(ScaledTimeout::new(1.0, 1.0)),
        None,
        Some(Duration::from_millis(50)),
    );
    governor.start_runtime();
    let first = governor.remaining_runtime();
    assert!(first <= Duration::from_millis(50));
    assert!(first > Duration::from_millis(30));
    std::thread::sleep(Duration::from_millis(10));
    let second = governor.remaining_runtime();
    assert!(second <= first);
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(governor.remaining_runtime(), Duration::ZERO);
}
