// crates/kconform-core/tests/proptest_budget.rs
// ============================================================================
// Module: Budget and Verdict Property-Based Tests
// Description: Property tests for timeout scaling and verdict folding.
// Purpose: Detect ordering or overflow mistakes across wide input ranges.
// ============================================================================

//! Property-based tests for timeout scaling and verdict precedence.

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
    reason = "Test-only assertions and helpers are permitted."
)]

use std::time::Duration;

use kconform_core::ScaledTimeout;
use kconform_core::Severity;
use kconform_core::TallySnapshot;
use kconform_core::TimeoutPolicy;
use kconform_core::Verdict;
use kconform_core::governor::TimeBudget;
use kconform_core::severity::SEVERITY_COUNT;
use proptest::prelude::*;

fn budget(timeout_secs: u64, runtime_secs: Option<u64>, factor: u32) -> TimeBudget {
    TimeBudget {
        timeout: Some(Duration::from_secs(timeout_secs)),
        runtime: runtime_secs.map(Duration::from_secs),
        factor,
    }
}

proptest! {
    #[test]
    fn scaled_timeout_never_shrinks(
        timeout_secs in 1_u64 .. 100_000,
        runtime_secs in proptest::option::of(0_u64 .. 10_000),
        factor in 1_u32 .. 64,
        multiplier in 1.0_f64 .. 16.0,
    ) {
        let policy = ScaledTimeout::new(multiplier, 1.0);
        let scaled = policy.effective_timeout(&budget(timeout_secs, runtime_secs, factor)).unwrap();
        let nominal = Duration::from_secs(timeout_secs + runtime_secs.unwrap_or(0));
        prop_assert!(scaled >= nominal);
    }

    #[test]
    fn scaled_timeout_is_monotonic_in_factor(
        timeout_secs in 1_u64 .. 100_000,
        factor in 1_u32 .. 1_000,
        multiplier in 1.0_f64 .. 16.0,
    ) {
        let policy = ScaledTimeout::new(multiplier, 1.0);
        let lower = policy.effective_timeout(&budget(timeout_secs, None, factor)).unwrap();
        let higher = policy.effective_timeout(&budget(timeout_secs, None, factor + 1)).unwrap();
        prop_assert!(higher >= lower);
    }

    #[test]
    fn runtime_scaling_is_monotonic(
        runtime_ms in 0_u64 .. 10_000_000,
        extra_ms in 0_u64 .. 10_000,
        runtime_multiplier in 0.1_f64 .. 16.0,
    ) {
        let policy = ScaledTimeout::new(1.0, runtime_multiplier);
        let shorter = policy.effective_runtime(Duration::from_millis(runtime_ms));
        let longer = policy.effective_runtime(Duration::from_millis(runtime_ms + extra_ms));
        prop_assert!(longer >= shorter);
    }

    #[test]
    fn verdict_follows_precedence(counts in proptest::array::uniform6(0_u32 .. 4)) {
        let counts: [u32; SEVERITY_COUNT] = counts;
        let tally = TallySnapshot::from_counts(counts);
        let pass = tally.count(Severity::Pass);
        let expected = if tally.count(Severity::Broken) > 0 {
            Verdict::Broken
        } else if tally.count(Severity::Fail) > 0 {
            Verdict::Fail
        } else if pass > 0 {
            Verdict::Pass
        } else if tally.count(Severity::Unsupported) > 0 {
            Verdict::Unsupported
        } else {
            Verdict::Broken
        };
        prop_assert_eq!(tally.verdict(), expected);
        prop_assert_eq!(tally.verdict().exit_code(), match expected {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
            Verdict::Broken => 2,
            Verdict::Unsupported => 32,
        });
    }
}
