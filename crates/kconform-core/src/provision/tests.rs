// crates/kconform-core/src/provision/tests.rs
// ============================================================================
// Module: Provisioner Unit Tests
// Description: Stack ordering, marks, failures, and owner checks.
// Purpose: Prove teardown is exact reverse order and happens once.
// Dependencies: kconform-core, nix, tempfile
// ============================================================================

//! ## Overview
//! Drives [`super::Provisioner`] with recording test doubles.

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

#![allow(unsafe_code, reason = "Owner check test forks the test process.")]

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use nix::sys::wait::waitpid;
use nix::unistd::ForkResult;
use nix::unistd::fork;

use super::AcquiredResource;
use super::ProvisionError;
use super::ProvisionState;
use super::Provisioner;
use super::Resource;
use super::ResourceFactory;
use crate::severity::Severity;
use crate::supervisor::exit_child;

// ============================================================================
// SECTION: Doubles
// ============================================================================

#[derive(Clone)]
enum Journal {
    Memory(Rc<RefCell<Vec<String>>>),
    File(PathBuf),
}

impl Journal {
    fn record(&self, entry: String) {
        match self {
            Self::Memory(entries) => entries.borrow_mut().push(entry),
            Self::File(path) => {
                let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
                writeln!(file, "{entry}").unwrap();
            }
        }
    }
}

struct Recording {
    name: &'static str,
    journal: Journal,
    fail_acquire: bool,
    fail_release: bool,
}

struct RecordingResource {
    name: &'static str,
    journal: Journal,
    fail_release: bool,
}

impl ResourceFactory for Recording {
    fn acquire(&self, _state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        if self.fail_acquire {
            return Err(ProvisionError::unavailable("double", format!("{} missing", self.name)));
        }
        self.journal.record(format!("acquire {}", self.name));
        Ok(Box::new(RecordingResource {
            name: self.name,
            journal: self.journal.clone(),
            fail_release: self.fail_release,
        }))
    }
}

impl Resource for RecordingResource {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::Custom(self.name.to_string())
    }

    fn release(self: Box<Self>, _state: &mut ProvisionState) -> Result<(), ProvisionError> {
        self.journal.record(format!("release {}", self.name));
        if self.fail_release {
            return Err(ProvisionError::failed("double", "release", "busy"));
        }
        Ok(())
    }
}

fn recording(name: &'static str, journal: &Journal) -> Recording {
    Recording {
        name,
        journal: journal.clone(),
        fail_acquire: false,
        fail_release: false,
    }
}

fn memory_journal() -> (Rc<RefCell<Vec<String>>>, Journal) {
    let entries = Rc::new(RefCell::new(Vec::new()));
    (Rc::clone(&entries), Journal::Memory(entries))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn teardown_releases_in_exact_reverse_order() {
    let (entries, journal) = memory_journal();
    let mut provisioner = Provisioner::new();
    for name in ["scratch", "device", "mount", "cgroup"] {
        provisioner.acquire(&recording(name, &journal)).unwrap();
    }
    let seqs: Vec<u64> = provisioner.handles().map(|(seq, _)| seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert!(provisioner.teardown().is_empty());
    assert_eq!(
        *entries.borrow(),
        vec![
            "acquire scratch",
            "acquire device",
            "acquire mount",
            "acquire cgroup",
            "release cgroup",
            "release mount",
            "release device",
            "release scratch",
        ]
    );
    assert!(provisioner.teardown().is_empty());
    assert_eq!(entries.borrow().len(), 8, "second teardown releases nothing");
}

#[test]
fn failed_acquire_leaves_stack_unchanged() {
    let (entries, journal) = memory_journal();
    let mut provisioner = Provisioner::new();
    provisioner.acquire(&recording("scratch", &journal)).unwrap();
    let mut missing = recording("loop", &journal);
    missing.fail_acquire = true;
    let err = provisioner.acquire(&missing).unwrap_err();
    assert_eq!(err.severity(), Severity::Unsupported);
    assert_eq!(provisioner.mark(), 1);
    drop(provisioner);
    assert_eq!(*entries.borrow(), vec!["acquire scratch", "release scratch"]);
}

#[test]
fn release_to_mark_keeps_older_handles() {
    let (entries, journal) = memory_journal();
    let mut provisioner = Provisioner::new();
    provisioner.acquire(&recording("device", &journal)).unwrap();
    let mark = provisioner.mark();
    provisioner.acquire(&recording("format", &journal)).unwrap();
    provisioner.acquire(&recording("mount", &journal)).unwrap();
    assert!(provisioner.release_to(mark).is_empty());
    assert_eq!(provisioner.mark(), 1);
    provisioner.acquire(&recording("format", &journal)).unwrap();
    let seqs: Vec<u64> = provisioner.handles().map(|(seq, _)| seq).collect();
    assert_eq!(seqs, vec![1, 4]);
    assert!(provisioner.teardown().is_empty());
    assert_eq!(
        *entries.borrow(),
        vec![
            "acquire device",
            "acquire format",
            "acquire mount",
            "release mount",
            "release format",
            "acquire format",
            "release format",
            "release device",
        ]
    );
}

#[test]
fn release_failures_are_reported_and_teardown_continues() {
    let (entries, journal) = memory_journal();
    let mut provisioner = Provisioner::new();
    provisioner.acquire(&recording("scratch", &journal)).unwrap();
    let mut busy = recording("mount", &journal);
    busy.fail_release = true;
    provisioner.acquire(&busy).unwrap();
    let failures = provisioner.teardown();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].seq, 2);
    assert_eq!(failures[0].acquired, AcquiredResource::Custom("mount".to_string()));
    assert_eq!(failures[0].error.severity(), Severity::Broken);
    assert_eq!(entries.borrow().last().map(String::as_str), Some("release scratch"));
}

#[test]
fn forked_copies_never_release() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("journal");
    let journal = Journal::File(log.clone());
    let mut provisioner = Provisioner::new();
    provisioner.acquire(&recording("scratch", &journal)).unwrap();
    // SAFETY: the child only tears down the provisioner copy and exits.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let failures = provisioner.teardown();
            exit_child(i32::from(!failures.is_empty()));
        }
        ForkResult::Parent {
            child,
        } => {
            waitpid(child, None).unwrap();
        }
    }
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "acquire scratch\n");
    drop(provisioner);
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "acquire scratch\nrelease scratch\n");
}
