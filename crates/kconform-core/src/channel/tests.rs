// crates/kconform-core/src/channel/tests.rs
// ============================================================================
// Module: Result Channel Unit Tests
// Description: Tally accounting, abort rules, cleanup downgrade, sinks.
// Purpose: Pin the reporting contract every test relies on.
// Dependencies: kconform-core, serde_json, tempfile
// ============================================================================

//! ## Overview
//! Exercises [`super::ResultChannel`] with in-memory and file sinks.

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

use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use super::JsonLogSink;
use super::Location;
use super::ResultChannel;
use super::ResultSink;
use super::TextSink;
use super::write_summary;
use crate::severity::Severity;
use crate::shm::SharedRegion;

// ============================================================================
// SECTION: Helpers
// ============================================================================

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn channel_with(sinks: Vec<Box<dyn ResultSink>>) -> (tempfile::TempDir, ResultChannel) {
    let dir = tempfile::tempdir().unwrap();
    let region = SharedRegion::create(dir.path(), "channel", false).unwrap();
    (dir, ResultChannel::new(Rc::new(region), sinks))
}

const HERE: Location = Location::new("tests.rs", 7);

// ============================================================================
// SECTION: Tally Tests
// ============================================================================

#[test]
fn report_increments_only_its_counter() {
    let (_dir, channel) = channel_with(Vec::new());
    for severity in Severity::ALL {
        let before = channel.snapshot();
        channel.report(severity, HERE, "observed");
        let after = channel.snapshot();
        for other in Severity::ALL {
            let expected = before.count(other) + u32::from(other == severity);
            assert_eq!(after.count(other), expected, "{} after {}", other.tag(), severity.tag());
        }
    }
}

#[test]
fn abort_with_warn_is_recorded_as_broken() {
    let (_dir, channel) = channel_with(Vec::new());
    let abort = channel.abort(Severity::Warn, HERE, "not terminating");
    assert_eq!(abort.severity(), Severity::Broken);
    let tally = channel.snapshot();
    assert_eq!(tally.count(Severity::Broken), 1);
    assert_eq!(tally.count(Severity::Warn), 0);
}

#[test]
fn cleanup_downgrades_broken_to_warn() {
    let (_dir, channel) = channel_with(Vec::new());
    channel.set_cleanup(true);
    channel.report(Severity::Broken, HERE, "umount failed");
    let abort = channel.abort(Severity::Broken, HERE, "cleanup gave up");
    channel.set_cleanup(false);
    assert_eq!(abort.severity(), Severity::Warn);
    let tally = channel.snapshot();
    assert_eq!(tally.count(Severity::Broken), 0);
    assert_eq!(tally.count(Severity::Warn), 2);
}

#[test]
fn location_caller_points_at_call_site() {
    let location = Location::caller();
    assert!(location.file().ends_with("tests.rs"));
    assert!(location.line() > 0);
}

// ============================================================================
// SECTION: Sink Tests
// ============================================================================

#[test]
fn text_sink_renders_tagged_lines() {
    let buffer = SharedBuffer::default();
    let (_dir, channel) = channel_with(vec![Box::new(TextSink::new(buffer.clone(), false))]);
    channel.report(Severity::Unsupported, Location::new("open01.rs", 12), "O_TMPFILE missing");
    channel.report(Severity::Broken, Location::new("open01.rs", 30), "setup failed");
    assert_eq!(
        buffer.text(),
        "open01.rs:12: CONF: O_TMPFILE missing\nopen01.rs:30: BROK: setup failed\n"
    );
}

#[test]
fn text_sink_colours_only_the_tag() {
    let buffer = SharedBuffer::default();
    let (_dir, channel) = channel_with(vec![Box::new(TextSink::new(buffer.clone(), true))]);
    channel.report(Severity::Pass, Location::new("a.rs", 1), "ok");
    assert_eq!(buffer.text(), "a.rs:1: \x1b[1;32mPASS\x1b[0m: ok\n");
}

#[test]
fn json_sink_appends_one_object_per_record() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("results.jsonl");
    let sink = JsonLogSink::open(&log).unwrap();
    let (_region_dir, channel) = channel_with(vec![Box::new(sink)]);
    channel.region().set_variant(2);
    channel.report(Severity::Fail, Location::new("b.rs", 9), "errno mismatch");
    channel.report(Severity::Info, Location::new("b.rs", 10), "note");
    let text = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["severity"], "fail");
    assert_eq!(first["file"], "b.rs");
    assert_eq!(first["line"], 9);
    assert_eq!(first["variant"], 2);
    assert_eq!(first["message"], "errno mismatch");
    assert_eq!(first["pid"], i64::from(std::process::id()));
    assert!(first["ts"].as_str().unwrap().contains('T'));
}

#[test]
fn summary_lists_counts() {
    let (_dir, channel) = channel_with(Vec::new());
    channel.report(Severity::Pass, HERE, "a");
    channel.report(Severity::Pass, HERE, "b");
    channel.report(Severity::Unsupported, HERE, "c");
    let mut out = Vec::new();
    write_summary(&mut out, &channel.snapshot()).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("passed   2\n"));
    assert!(text.contains("skipped  1\n"));
    assert!(text.contains("failed   0\n"));
}
