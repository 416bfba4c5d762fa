// crates/kconform-core/src/severity.rs
// ============================================================================
// Module: Result Severities and Verdicts
// Description: Severity tags, tally snapshots, verdict precedence, exit codes.
// Purpose: Define the stable vocabulary shared by every result producer.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every observation made by a test is tagged with a [`Severity`]. The shared
//! tally counts observations per severity, and [`TallySnapshot::verdict`]
//! folds a tally into the final [`Verdict`] using the precedence
//! BROKEN > FAIL > UNSUPPORTED > PASS.
//! Invariants:
//! - Exit codes are stable; downstream automation depends on them.
//! - WARN and INFO never influence the verdict.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Severity
// ============================================================================

/// Number of distinct severities tracked by the tally.
pub const SEVERITY_COUNT: usize = 6;

/// Severity of a single reported observation.
///
/// # Invariants
/// - Variants are stable for serialization and exit-code mapping.
/// - [`Severity::index`] is a dense `0..SEVERITY_COUNT` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Observed behaviour matched the expectation.
    Pass,
    /// Observed behaviour contradicted the expectation.
    Fail,
    /// The harness or environment could not exercise the condition.
    Broken,
    /// A precondition is not met on this system.
    Unsupported,
    /// Suspicious but informational.
    Warn,
    /// Informational.
    Info,
}

impl Severity {
    /// All severities in tally order.
    pub const ALL: [Self; SEVERITY_COUNT] =
        [Self::Pass, Self::Fail, Self::Broken, Self::Unsupported, Self::Warn, Self::Info];

    /// Returns the dense tally index.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Broken => 2,
            Self::Unsupported => 3,
            Self::Warn => 4,
            Self::Info => 5,
        }
    }

    /// Returns the four-letter tag printed in result lines.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Broken => "BROK",
            Self::Unsupported => "CONF",
            Self::Warn => "WARN",
            Self::Info => "INFO",
        }
    }

    /// Returns the process exit code associated with the severity.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Broken => 2,
            Self::Warn => 4,
            Self::Info => 16,
            Self::Unsupported => 32,
        }
    }

    /// Maps an exit code back to the severity that produced it.
    #[must_use]
    pub const fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Pass),
            1 => Some(Self::Fail),
            2 => Some(Self::Broken),
            4 => Some(Self::Warn),
            16 => Some(Self::Info),
            32 => Some(Self::Unsupported),
            _ => None,
        }
    }

    /// Returns true when the severity may terminate a test through [`crate::channel::ResultChannel::abort`].
    #[must_use]
    pub const fn can_abort(self) -> bool {
        matches!(self, Self::Pass | Self::Fail | Self::Broken | Self::Unsupported)
    }

    /// Returns the severity recorded while cleanup is running.
    #[must_use]
    pub const fn in_cleanup(self) -> Self {
        match self {
            Self::Broken => Self::Warn,
            other => other,
        }
    }
}

// ============================================================================
// SECTION: Verdict
// ============================================================================

/// Aggregate outcome of a run.
///
/// # Invariants
/// - Exit codes match [`Severity::exit_code`] of the corresponding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Passed.
    Pass,
    /// At least one failure.
    Fail,
    /// At least one broken result, or no results at all.
    Broken,
    /// Only unsupported results.
    Unsupported,
}

impl Verdict {
    /// Returns the stable process exit code.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Pass => Severity::Pass.exit_code(),
            Self::Fail => Severity::Fail.exit_code(),
            Self::Broken => Severity::Broken.exit_code(),
            Self::Unsupported => Severity::Unsupported.exit_code(),
        }
    }

    /// Returns a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Broken => "broken",
            Self::Unsupported => "unsupported",
        }
    }
}

// ============================================================================
// SECTION: Tally Snapshot
// ============================================================================

/// Point-in-time copy of the shared tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySnapshot {
    /// Counter values indexed by [`Severity::index`].
    counts: [u32; SEVERITY_COUNT],
}

impl TallySnapshot {
    /// Builds a snapshot from raw counters.
    #[must_use]
    pub const fn from_counts(counts: [u32; SEVERITY_COUNT]) -> Self {
        Self {
            counts,
        }
    }

    /// Returns the counter for `severity`.
    #[must_use]
    pub const fn count(&self, severity: Severity) -> u32 {
        self.counts[severity.index()]
    }

    /// Number of verdict-bearing records (everything except INFO).
    #[must_use]
    pub fn result_records(&self) -> u32 {
        Severity::ALL
            .iter()
            .filter(|severity| **severity != Severity::Info)
            .map(|severity| self.count(*severity))
            .sum()
    }

    /// Returns true when PASS, FAIL, BROKEN or UNSUPPORTED moved since `earlier`.
    #[must_use]
    pub const fn has_new_results_since(&self, earlier: &Self) -> bool {
        self.count(Severity::Pass) != earlier.count(Severity::Pass)
            || self.count(Severity::Fail) != earlier.count(Severity::Fail)
            || self.count(Severity::Broken) != earlier.count(Severity::Broken)
            || self.count(Severity::Unsupported) != earlier.count(Severity::Unsupported)
    }

    /// Counts recorded after `earlier` was taken.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        let mut counts = [0; SEVERITY_COUNT];
        for (index, count) in counts.iter_mut().enumerate() {
            *count = self.counts[index].saturating_sub(earlier.counts[index]);
        }
        Self {
            counts,
        }
    }

    /// Folds the tally into a verdict.
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        if self.count(Severity::Broken) > 0 {
            Verdict::Broken
        } else if self.count(Severity::Fail) > 0 {
            Verdict::Fail
        } else if self.count(Severity::Unsupported) > 0 && self.count(Severity::Pass) == 0 {
            Verdict::Unsupported
        } else if self.count(Severity::Pass) > 0 {
            Verdict::Pass
        } else {
            Verdict::Broken
        }
    }
}
