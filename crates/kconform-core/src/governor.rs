// crates/kconform-core/src/governor.rs
// ============================================================================
// Module: Timeout and Runtime Governor
// Description: Run deadline, runtime window, and pluggable timeout scaling.
// Purpose: Bound total run time and give bodies a live countdown.
// Dependencies: nix, crate::shm
// ============================================================================

//! ## Overview
//! The governor turns the nominal timeout and runtime of a descriptor into
//! an absolute monotonic deadline stored in the shared region. Any process
//! can then ask how much of the budget remains.
//! Invariants:
//! - `remaining_runtime` is monotonically non-increasing and saturates at zero.
//! - A disabled timeout is stored as deadline 0 and reported as `None`.
//! - The effective timeout is computed by a [`TimeoutPolicy`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::rc::Rc;
use std::time::Duration;

use kconform_config::TimeoutConfig;
use nix::time::ClockId;
use nix::time::clock_gettime;

use crate::shm::SharedRegion;

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Returns the monotonic clock in milliseconds.
#[must_use]
pub fn monotonic_ms() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC).map_or(0, |now| {
        let secs = u64::try_from(now.tv_sec()).unwrap_or(0);
        let nanos = u64::try_from(now.tv_nsec()).unwrap_or(0);
        secs.saturating_mul(1_000).saturating_add(nanos / 1_000_000)
    })
}

/// Converts a duration to whole milliseconds, saturating.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Nominal time budget of a run before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    /// Nominal timeout; `None` disables the deadline.
    pub timeout: Option<Duration>,
    /// Nominal runtime window of one sub-run.
    pub runtime: Option<Duration>,
    /// Number of sub-runs sharing the deadline.
    pub factor: u32,
}

/// Computes the effective timeout and runtime from a nominal budget.
pub trait TimeoutPolicy {
    /// Returns the effective run timeout; `None` disables the deadline.
    fn effective_timeout(&self, budget: &TimeBudget) -> Option<Duration>;

    /// Returns the effective runtime window of one sub-run.
    fn effective_runtime(&self, runtime: Duration) -> Duration;
}

/// Default policy: `(timeout + runtime * runtime_mul) * factor * timeout_mul`.
///
/// # Invariants
/// - Multipliers are at least 1 for the timeout (validated by configuration).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledTimeout {
    /// Global timeout multiplier.
    multiplier: f64,
    /// Runtime multiplier.
    runtime_multiplier: f64,
}

impl ScaledTimeout {
    /// Creates a policy with explicit multipliers.
    #[must_use]
    pub const fn new(multiplier: f64, runtime_multiplier: f64) -> Self {
        Self {
            multiplier,
            runtime_multiplier,
        }
    }

    /// Creates a policy from the timeout configuration section.
    #[must_use]
    pub const fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(config.multiplier, config.runtime_multiplier)
    }
}

/// Converts a non-negative millisecond float to a duration, saturating.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "Value is rounded and clamped to the u64 range before conversion."
)]
fn ms_to_duration(ms: f64) -> Duration {
    let ms = ms.round();
    if !ms.is_finite() || ms <= 0.0 {
        return Duration::ZERO;
    }
    if ms >= u64::MAX as f64 {
        return Duration::from_millis(u64::MAX);
    }
    Duration::from_millis(ms as u64)
}

/// Converts a duration to float milliseconds.
#[allow(clippy::cast_precision_loss, reason = "Millisecond budgets are far below 2^52.")]
fn duration_to_ms(duration: Duration) -> f64 {
    duration_ms(duration) as f64
}

impl TimeoutPolicy for ScaledTimeout {
    fn effective_timeout(&self, budget: &TimeBudget) -> Option<Duration> {
        let timeout = budget.timeout?;
        let runtime = budget.runtime.map_or(0.0, duration_to_ms) * self.runtime_multiplier;
        let nominal = duration_to_ms(timeout) + runtime;
        Some(ms_to_duration(nominal * f64::from(budget.factor.max(1)) * self.multiplier))
    }

    fn effective_runtime(&self, runtime: Duration) -> Duration {
        ms_to_duration(duration_to_ms(runtime) * self.runtime_multiplier)
    }
}

// ============================================================================
// SECTION: Governor
// ============================================================================

/// Run-wide time budget backed by the shared region.
pub struct Governor {
    /// Region holding the deadline and runtime words.
    region: Rc<SharedRegion>,
    /// Scaling policy.
    policy: Box<dyn TimeoutPolicy>,
    /// Nominal budget.
    budget: TimeBudget,
}

impl Governor {
    /// Creates a governor for the nominal `timeout` and `runtime`.
    #[must_use]
    pub fn new(
        region: Rc<SharedRegion>,
        policy: Box<dyn TimeoutPolicy>,
        timeout: Option<Duration>,
        runtime: Option<Duration>,
    ) -> Self {
        Self {
            region,
            policy,
            budget: TimeBudget {
                timeout,
                runtime,
                factor: 1,
            },
        }
    }

    /// Multiplies the nominal timeout by `factor` (number of sub-runs).
    pub fn extend(&mut self, factor: u32) {
        self.budget.factor = self.budget.factor.saturating_mul(factor.max(1));
    }

    /// Returns the nominal budget.
    #[must_use]
    pub const fn budget(&self) -> &TimeBudget {
        &self.budget
    }

    /// Returns the effective timeout according to the policy.
    #[must_use]
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.policy.effective_timeout(&self.budget)
    }

    /// Stores the deadline derived from the effective timeout.
    pub fn arm(&self) {
        let deadline = self
            .effective_timeout()
            .map_or(0, |timeout| monotonic_ms().saturating_add(duration_ms(timeout)).max(1));
        self.region.set_deadline_ms(deadline);
    }

    /// Time left until the run deadline; `None` when disabled.
    #[must_use]
    pub fn remaining_timeout(&self) -> Option<Duration> {
        remaining_timeout(&self.region)
    }

    /// Returns true once an armed deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.remaining_timeout().is_some_and(|left| left.is_zero())
    }

    /// Starts the runtime window of the current sub-run.
    pub fn start_runtime(&self) {
        let runtime =
            self.budget.runtime.map_or(Duration::ZERO, |runtime| self.policy.effective_runtime(runtime));
        self.region.set_runtime_window(monotonic_ms(), duration_ms(runtime));
    }

    /// Runtime left in the current sub-run, saturating at zero.
    #[must_use]
    pub fn remaining_runtime(&self) -> Duration {
        remaining_runtime(&self.region)
    }
}

/// Time left until the deadline stored in `region`.
#[must_use]
pub fn remaining_timeout(region: &SharedRegion) -> Option<Duration> {
    match region.deadline_ms() {
        0 => None,
        deadline => Some(Duration::from_millis(deadline.saturating_sub(monotonic_ms()))),
    }
}

/// Runtime left in the window stored in `region`.
#[must_use]
pub fn remaining_runtime(region: &SharedRegion) -> Duration {
    let (start, length) = region.runtime_window();
    let elapsed = monotonic_ms().saturating_sub(start);
    Duration::from_millis(length.saturating_sub(elapsed))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
