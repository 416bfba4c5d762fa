// crates/kconform-core/src/driver/entry.rs
// ============================================================================
// Module: Test Program Entry
// Description: Command line parsing and process exit for test programs.
// Purpose: Give every test binary the same `main` in one call.
// Dependencies: clap, kconform-config
// ============================================================================

//! ## Overview
//! [`run_main`] parses the harness options (`-i`, `-I`) and the descriptor's
//! own options, loads configuration, runs the driver, and maps the verdict to
//! an exit code. Usage and configuration errors exit with the BROKEN code.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::Command;
use clap::error::ErrorKind;
use kconform_config::HarnessConfig;

use crate::channel::write_summary;
use crate::descriptor::TestDescriptor;
use crate::driver::Driver;
use crate::driver::process::install_stop_handlers;
use crate::severity::Severity;

/// Arg id of the iteration count.
pub(super) const ITERATIONS_ARG: &str = "kconform-iterations";
/// Arg id of the duration.
pub(super) const DURATION_ARG: &str = "kconform-duration";

/// Builds the clap command for `descriptor`.
pub(super) fn command(descriptor: &TestDescriptor) -> Command {
    let mut command = Command::new(descriptor.tid().to_string())
        .arg(
            Arg::new(ITERATIONS_ARG)
                .short('i')
                .value_name("N")
                .help("Repeat the test body N times")
                .value_parser(clap::value_parser!(u32).range(1 ..)),
        )
        .arg(
            Arg::new(DURATION_ARG)
                .short('I')
                .value_name("SECS")
                .help("Repeat the test body for SECS seconds")
                .value_parser(clap::value_parser!(u64).range(1 ..)),
        );
    for option in descriptor.options() {
        let arg = Arg::new(option.name).short(option.short).long(option.name).help(option.help);
        let arg = if option.takes_value {
            arg.action(ArgAction::Set).value_name("VALUE")
        } else {
            arg.action(ArgAction::SetTrue)
        };
        command = command.arg(arg);
    }
    command
}

/// Collects the descriptor options present on the command line.
pub(super) fn collect_options(descriptor: &TestDescriptor, matches: &ArgMatches) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    for option in descriptor.options() {
        if option.takes_value {
            if let Some(value) = matches.get_one::<String>(option.name) {
                options.insert(option.name.to_string(), value.clone());
            }
        } else if matches.get_flag(option.name) {
            options.insert(option.name.to_string(), String::new());
        }
    }
    options
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Reports a harness error and returns the BROKEN exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::from(Severity::Broken.exit_code())
}

/// Runs `descriptor` with command line `args` (including the program name).
///
/// Exit codes: 0 pass, 1 fail, 2 broken, 32 unsupported.
pub fn run_main<I, T>(descriptor: TestDescriptor, args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = match command(&descriptor).try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(Severity::Broken.exit_code()),
            };
        }
    };
    let config = match HarnessConfig::load(None) {
        Ok(config) => config,
        Err(err) => return emit_error(&format!("kconform: {err}")),
    };
    let summary = config.output.summary;
    let options = collect_options(&descriptor, &matches);
    let mut driver = Driver::new(descriptor, config).with_options(options);
    if let Some(iterations) = matches.get_one::<u32>(ITERATIONS_ARG) {
        driver = driver.with_iterations(*iterations);
    }
    if let Some(secs) = matches.get_one::<u64>(DURATION_ARG) {
        driver = driver.with_duration(Duration::from_secs(*secs));
    }
    install_stop_handlers();
    let report = match driver.run() {
        Ok(report) => report,
        Err(err) => return emit_error(&format!("kconform: {err}")),
    };
    if summary {
        let _ = write_summary(std::io::stdout().lock(), &report.tally);
    }
    ExitCode::from(report.exit_code)
}
