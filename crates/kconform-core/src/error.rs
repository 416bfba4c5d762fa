// crates/kconform-core/src/error.rs
// ============================================================================
// Module: Harness Errors
// Description: Run-fatal harness errors and the test abort token.
// Purpose: Separate harness failures from test-level early termination.
// Dependencies: thiserror, kconform-config
// ============================================================================

//! ## Overview
//! [`HarnessError`] covers conditions that stop a run before a verdict exists
//! (shared region creation, forking the test process, bad usage).
//! [`TestAbort`] is the token propagated with `?` when test code aborts.
//! Invariants:
//! - A [`TestAbort`] is only created after its result has been reported.

// ============================================================================
// SECTION: Imports
// ============================================================================

use kconform_config::ConfigError;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::descriptor::DescriptorError;
use crate::severity::Severity;
use crate::shm::ShmError;

// ============================================================================
// SECTION: Harness Errors
// ============================================================================

/// Run-fatal harness errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Descriptor is invalid.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// A result sink could not be opened.
    #[error(transparent)]
    Sink(#[from] ChannelError),
    /// Shared region could not be created.
    #[error(transparent)]
    Region(#[from] ShmError),
    /// Test process could not be forked.
    #[error("failed to fork test process: {0}")]
    Fork(String),
    /// Command line could not be parsed.
    #[error("usage error: {0}")]
    Usage(String),
}

// ============================================================================
// SECTION: Test Abort
// ============================================================================

/// Token returned by an abort; propagate it with `?`.
///
/// # Invariants
/// - The result carried by the token has already been reported.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("test aborted with {}", .severity.tag())]
pub struct TestAbort {
    /// Severity that ended the test.
    severity: Severity,
}

impl TestAbort {
    /// Creates a token for an already reported result.
    pub(crate) const fn reported(severity: Severity) -> Self {
        Self {
            severity,
        }
    }

    /// Returns the severity that ended the test.
    #[must_use]
    pub const fn severity(self) -> Severity {
        self.severity
    }

    /// Returns the exit code a child process should use.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        self.severity.exit_code()
    }
}

/// Result type used by setup, body, and cleanup entry points.
pub type TestResult<T = ()> = Result<T, TestAbort>;
