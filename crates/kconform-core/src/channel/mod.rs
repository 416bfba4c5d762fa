// crates/kconform-core/src/channel/mod.rs
// ============================================================================
// Module: Result Channel
// Description: Severity-tagged reporting into the shared tally and sinks.
// Purpose: Collect results from every process of a run into one verdict.
// Dependencies: nix, thiserror, crate::shm
// ============================================================================

//! ## Overview
//! The [`ResultChannel`] is the only way results enter a run. `report`
//! increments one tally counter in the shared region and renders the record
//! to every sink; `abort` reports and hands back a [`TestAbort`] token.
//! Invariants:
//! - `report(S)` increments exactly the counter of `S`.
//! - Only PASS, FAIL, BROKEN and UNSUPPORTED may abort; anything else is
//!   recorded as BROKEN.
//! - While cleanup runs, BROKEN is downgraded to WARN.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use nix::unistd::getpid;
use thiserror::Error;

use crate::error::TestAbort;
use crate::severity::Severity;
use crate::severity::TallySnapshot;
use crate::shm::SharedRegion;

pub mod sink;

pub use sink::JsonLogSink;
pub use sink::ResultRecord;
pub use sink::ResultSink;
pub use sink::TextSink;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Result channel errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A sink failed to write.
    #[error("result sink error: {0}")]
    Sink(String),
}

// ============================================================================
// SECTION: Location
// ============================================================================

/// Source location attached to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Source file.
    file: &'static str,
    /// Source line.
    line: u32,
}

impl Location {
    /// Creates a location from explicit parts.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file,
            line,
        }
    }

    /// Captures the location of the caller.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self::new(location.file(), location.line())
    }

    /// Returns the source file.
    #[must_use]
    pub const fn file(&self) -> &'static str {
        self.file
    }

    /// Returns the source line.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

// ============================================================================
// SECTION: Result Channel
// ============================================================================

/// Reporting front-end shared by the driver and every test process.
///
/// # Invariants
/// - The tally lives in the shared region; sinks are per process.
pub struct ResultChannel {
    /// Shared run state.
    region: Rc<SharedRegion>,
    /// Record renderers.
    sinks: Vec<Box<dyn ResultSink>>,
    /// True while cleanup runs in this process.
    in_cleanup: Cell<bool>,
}

impl ResultChannel {
    /// Creates a channel over `region` writing to `sinks`.
    #[must_use]
    pub fn new(region: Rc<SharedRegion>, sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self {
            region,
            sinks,
            in_cleanup: Cell::new(false),
        }
    }

    /// Returns the shared region.
    #[must_use]
    pub fn region(&self) -> &Rc<SharedRegion> {
        &self.region
    }

    /// Marks the start or end of cleanup in this process.
    pub fn set_cleanup(&self, in_cleanup: bool) {
        self.in_cleanup.set(in_cleanup);
    }

    /// Returns true while cleanup runs.
    #[must_use]
    pub fn in_cleanup(&self) -> bool {
        self.in_cleanup.get()
    }

    /// Records one result and renders it to every sink.
    pub fn report(&self, severity: Severity, location: Location, message: &str) {
        let severity = if self.in_cleanup.get() { severity.in_cleanup() } else { severity };
        self.region.tally_add(severity);
        let record = ResultRecord {
            severity,
            file: location.file(),
            line: location.line(),
            message,
            pid: getpid().as_raw(),
            variant: self.region.variant(),
        };
        for sink in &self.sinks {
            let _ = sink.write_record(&record);
        }
    }

    /// Reports a terminating result and returns the abort token.
    pub fn abort(&self, severity: Severity, location: Location, message: &str) -> TestAbort {
        if !severity.can_abort() {
            let message = format!("abort with {} is not allowed: {message}", severity.tag());
            return self.abort(Severity::Broken, location, &message);
        }
        let effective = if self.in_cleanup.get() { severity.in_cleanup() } else { severity };
        self.report(severity, location, message);
        TestAbort::reported(effective)
    }

    /// Copies the current tally.
    #[must_use]
    pub fn snapshot(&self) -> TallySnapshot {
        self.region.tally_snapshot()
    }
}

// ============================================================================
// SECTION: Summary
// ============================================================================

/// Writes the end-of-run summary block.
///
/// # Errors
///
/// Returns the writer's error when output fails.
pub fn write_summary(mut out: impl Write, tally: &TallySnapshot) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Summary:")?;
    writeln!(out, "passed   {}", tally.count(Severity::Pass))?;
    writeln!(out, "failed   {}", tally.count(Severity::Fail))?;
    writeln!(out, "broken   {}", tally.count(Severity::Broken))?;
    writeln!(out, "skipped  {}", tally.count(Severity::Unsupported))?;
    writeln!(out, "warnings {}", tally.count(Severity::Warn))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
