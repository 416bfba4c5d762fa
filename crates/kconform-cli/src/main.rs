// crates/kconform-cli/src/main.rs
// ============================================================================
// Module: kconform Checkpoint CLI Entry Point
// Description: `wait` and `wake` over the exported shared region.
// Purpose: Let exec'd helpers and shell scripts join test checkpoints.
// Dependencies: clap, kconform-core, thiserror
// ============================================================================

//! ## Overview
//! `kconform-checkpoint` attaches to the region named by `KCONFORM_IPC_PATH`
//! and performs one checkpoint operation. A zero timeout waits forever.
//! Exit status is 0 on success and 1 on timeout, usage or attach errors.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap::error::ErrorKind;
use kconform_core::CheckpointError;
use kconform_core::Checkpoints;
use kconform_core::SharedRegion;
use kconform_core::shm::ShmError;
use thiserror::Error;

// ============================================================================
// SECTION: Arguments
// ============================================================================

/// Checkpoint operations for processes outside the test's process tree.
#[derive(Debug, Parser)]
#[command(name = "kconform-checkpoint", version)]
struct Cli {
    /// Operation to perform.
    #[command(subcommand)]
    command: CheckpointCommand,
}

/// Supported operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum CheckpointCommand {
    /// Block until checkpoint ID is woken.
    Wait {
        /// Timeout in milliseconds; 0 waits forever.
        timeout_ms: u64,
        /// Checkpoint id.
        id: usize,
    },
    /// Wake COUNT waiters on checkpoint ID and wait until they consumed it.
    Wake {
        /// Timeout in milliseconds; 0 waits forever.
        timeout_ms: u64,
        /// Checkpoint id.
        id: usize,
        /// Number of waiters to release.
        #[arg(value_parser = clap::value_parser!(u32).range(1 ..))]
        count: u32,
    },
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI failures; every variant exits with status 1.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
enum CliError {
    /// The shared region could not be attached.
    #[error("cannot attach shared region: {0}")]
    Region(#[from] ShmError),
    /// The checkpoint operation failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// ============================================================================
// SECTION: Execution
// ============================================================================

/// Maps the command line timeout to an optional duration.
const fn timeout_from_ms(timeout_ms: u64) -> Option<Duration> {
    if timeout_ms == 0 { None } else { Some(Duration::from_millis(timeout_ms)) }
}

/// Runs `command` against `checkpoints`.
fn execute(command: CheckpointCommand, checkpoints: &Checkpoints) -> Result<(), CheckpointError> {
    match command {
        CheckpointCommand::Wait {
            timeout_ms,
            id,
        } => checkpoints.wait(id, timeout_from_ms(timeout_ms)),
        CheckpointCommand::Wake {
            timeout_ms,
            id,
            count,
        } => checkpoints.wake(id, count, timeout_from_ms(timeout_ms)),
    }
}

/// Attaches to the exported region and runs `command`.
fn run(command: CheckpointCommand) -> Result<(), CliError> {
    let region = SharedRegion::reattach_from_env()?;
    let checkpoints = Checkpoints::new(Rc::new(region));
    execute(command, &checkpoints)?;
    Ok(())
}

// ============================================================================
// SECTION: Output
// ============================================================================

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Reports an error and returns the failure status.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// Parses arguments and runs one checkpoint operation.
fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => emit_error(&format!("kconform-checkpoint: {err}")),
    }
}
