// crates/kconform-core/src/shm.rs
// ============================================================================
// Module: Shared Execution Region
// Description: File-backed MAP_SHARED region holding the tally and counters.
// Purpose: Give every process of a run one append-only view of run state.
// Dependencies: nix, thiserror
// ============================================================================

//! ## Overview
//! A [`SharedRegion`] is created by the driver before any fork. It is a small
//! file under `paths.shm_dir` mapped `MAP_SHARED`, so forked workers and
//! exec'd helpers (through [`IPC_PATH_ENV`]) observe the same words.
//! Invariants:
//! - After fork the region only sees tally appends and checkpoint increments.
//! - The backing file is removed by the creating process only.
//! - Attaching validates the size and magic word before any access.

// ============================================================================
// SECTION: Imports
// ============================================================================

#![allow(unsafe_code, reason = "Mapping shared memory requires mmap and raw pointer access.")]

use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::unistd::Pid;
use nix::unistd::getpid;
use thiserror::Error;

use crate::severity::SEVERITY_COUNT;
use crate::severity::Severity;
use crate::severity::TallySnapshot;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable carrying the region path to exec'd processes.
pub const IPC_PATH_ENV: &str = "KCONFORM_IPC_PATH";
/// Number of checkpoint slots in a region.
pub const CHECKPOINT_SLOTS: usize = 256;
/// Magic word written once the region is initialised.
const REGION_MAGIC: u64 = 0x6b63_6f6e_666f_726d;
/// Mapping granularity.
const PAGE_BYTES: usize = 4_096;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Shared region errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Backing file could not be created or opened.
    #[error("shared region io error: {0}")]
    Io(String),
    /// Mapping failed.
    #[error("shared region mmap failed: {0}")]
    Map(String),
    /// Attached file is not a region created by this harness.
    #[error("shared region invalid: {0}")]
    Invalid(String),
    /// No region path was exported.
    #[error("{IPC_PATH_ENV} is not set")]
    NotExported,
}

// ============================================================================
// SECTION: Layout
// ============================================================================

/// One checkpoint slot: increment-only wake and consumed counters.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CheckpointSlot {
    /// Tokens posted by wakers.
    pub(crate) wake: AtomicU32,
    /// Tokens taken by waiters.
    pub(crate) consumed: AtomicU32,
}

/// In-memory layout of the region.
#[repr(C)]
struct RegionLayout {
    /// Set to [`REGION_MAGIC`] after initialisation.
    magic: AtomicU64,
    /// Per-severity result counters.
    tally: [AtomicU32; SEVERITY_COUNT],
    /// Absolute monotonic deadline in milliseconds, 0 when disabled.
    deadline_ms: AtomicU64,
    /// Monotonic start of the runtime window in milliseconds.
    runtime_start_ms: AtomicU64,
    /// Runtime window length in milliseconds.
    runtime_ms: AtomicU64,
    /// Index of the variant being executed.
    variant: AtomicU32,
    /// Checkpoint slots.
    checkpoints: [CheckpointSlot; CHECKPOINT_SLOTS],
}

/// Returns the mapped length for the layout, rounded to whole pages.
const fn mapped_len() -> usize {
    let raw = size_of::<RegionLayout>();
    raw.div_ceil(PAGE_BYTES) * PAGE_BYTES
}

// ============================================================================
// SECTION: Shared Region
// ============================================================================

/// Handle to the shared run state.
///
/// # Invariants
/// - `ptr` points to a live `MAP_SHARED` mapping of `len` bytes until drop.
/// - Only `owner` removes the backing file.
#[derive(Debug)]
pub struct SharedRegion {
    /// Start of the mapping.
    ptr: NonNull<RegionLayout>,
    /// Mapping length in bytes.
    len: usize,
    /// Backing file path.
    path: PathBuf,
    /// Process that created the region, if this handle created it.
    owner: Option<Pid>,
    /// True when the backing file is still linked.
    linked: bool,
}

impl SharedRegion {
    /// Creates a new zeroed region under `dir`.
    ///
    /// When `export` is false the backing file is unlinked right after
    /// mapping, so only forked processes can reach the region.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError`] when the file cannot be created or mapped.
    pub fn create(dir: &Path, tag: &str, export: bool) -> Result<Self, ShmError> {
        let owner = getpid();
        let path = dir.join(format!("kconform_{tag}_{owner}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|err| ShmError::Io(format!("{}: {err}", path.display())))?;
        let len = mapped_len();
        let size = u64::try_from(len).map_err(|_| ShmError::Invalid("region too large".to_string()))?;
        if let Err(err) = file.set_len(size) {
            let _ = std::fs::remove_file(&path);
            return Err(ShmError::Io(format!("{}: {err}", path.display())));
        }
        let ptr = match map_file(&file, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        };
        let mut region = Self {
            ptr,
            len,
            path,
            owner: Some(owner),
            linked: true,
        };
        region.layout().magic.store(REGION_MAGIC, Ordering::Release);
        if !export {
            region.unlink();
        }
        Ok(region)
    }

    /// Attaches to an existing region file.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError`] when the file is missing, too small, or not initialised.
    pub fn attach(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| ShmError::Io(format!("{}: {err}", path.display())))?;
        let size = file
            .metadata()
            .map_err(|err| ShmError::Io(format!("{}: {err}", path.display())))?
            .len();
        let len = mapped_len();
        if usize::try_from(size).unwrap_or(0) < len {
            return Err(ShmError::Invalid(format!("{} is too small", path.display())));
        }
        let ptr = map_file(&file, len)?;
        let region = Self {
            ptr,
            len,
            path: path.to_path_buf(),
            owner: None,
            linked: true,
        };
        if region.layout().magic.load(Ordering::Acquire) != REGION_MAGIC {
            return Err(ShmError::Invalid(format!("{} has no region header", path.display())));
        }
        Ok(region)
    }

    /// Attaches to the region exported through [`IPC_PATH_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::NotExported`] when the variable is unset.
    pub fn reattach_from_env() -> Result<Self, ShmError> {
        let path = std::env::var_os(IPC_PATH_ENV).ok_or(ShmError::NotExported)?;
        Self::attach(Path::new(&path))
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while the backing file can be reattached by path.
    #[must_use]
    pub const fn is_exported(&self) -> bool {
        self.linked
    }

    /// Removes the backing file; existing mappings stay valid.
    pub fn unlink(&mut self) {
        if self.linked && self.owner == Some(getpid()) {
            let _ = std::fs::remove_file(&self.path);
            self.linked = false;
        }
    }

    /// Returns the mapped layout.
    fn layout(&self) -> &RegionLayout {
        // SAFETY: `ptr` is a live shared mapping of at least `size_of::<RegionLayout>()`
        // bytes for the lifetime of `self`, and every field is an atomic.
        unsafe { self.ptr.as_ref() }
    }

    // ------------------------------------------------------------------------
    // Tally
    // ------------------------------------------------------------------------

    /// Increments the counter of `severity` by one.
    pub fn tally_add(&self, severity: Severity) {
        self.layout().tally[severity.index()].fetch_add(1, Ordering::AcqRel);
    }

    /// Copies the current tally.
    #[must_use]
    pub fn tally_snapshot(&self) -> TallySnapshot {
        let tally = &self.layout().tally;
        let mut counts = [0_u32; SEVERITY_COUNT];
        for (slot, counter) in counts.iter_mut().zip(tally.iter()) {
            *slot = counter.load(Ordering::Acquire);
        }
        TallySnapshot::from_counts(counts)
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Returns the checkpoint slot `id`, if in range.
    #[must_use]
    pub fn checkpoint(&self, id: usize) -> Option<&CheckpointSlot> {
        self.layout().checkpoints.get(id)
    }

    // ------------------------------------------------------------------------
    // Timing Words
    // ------------------------------------------------------------------------

    /// Stores the absolute deadline (0 disables it).
    pub fn set_deadline_ms(&self, deadline_ms: u64) {
        self.layout().deadline_ms.store(deadline_ms, Ordering::Release);
    }

    /// Loads the absolute deadline.
    #[must_use]
    pub fn deadline_ms(&self) -> u64 {
        self.layout().deadline_ms.load(Ordering::Acquire)
    }

    /// Stores the runtime window.
    pub fn set_runtime_window(&self, start_ms: u64, length_ms: u64) {
        let layout = self.layout();
        layout.runtime_ms.store(length_ms, Ordering::Release);
        layout.runtime_start_ms.store(start_ms, Ordering::Release);
    }

    /// Loads the runtime window as `(start_ms, length_ms)`.
    #[must_use]
    pub fn runtime_window(&self) -> (u64, u64) {
        let layout = self.layout();
        (layout.runtime_start_ms.load(Ordering::Acquire), layout.runtime_ms.load(Ordering::Acquire))
    }

    /// Stores the current variant index.
    pub fn set_variant(&self, variant: u32) {
        self.layout().variant.store(variant, Ordering::Release);
    }

    /// Loads the current variant index.
    #[must_use]
    pub fn variant(&self) -> u32 {
        self.layout().variant.load(Ordering::Acquire)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.unlink();
        // SAFETY: the mapping was created by `map_file` with `self.len` bytes and
        // no reference derived from it outlives `self`.
        let _ = unsafe { munmap(self.ptr.cast(), self.len) };
    }
}

/// Maps `len` bytes of `file` read-write and shared.
fn map_file(file: &File, len: usize) -> Result<NonNull<RegionLayout>, ShmError> {
    let length = NonZeroUsize::new(len).ok_or_else(|| ShmError::Map("zero length".to_string()))?;
    // SAFETY: mapping a regular file we opened read-write; the kernel picks the
    // address, and the file was sized to at least `len` bytes beforehand.
    let ptr = unsafe {
        mmap(None, length, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, file, 0)
    }
    .map_err(|err| ShmError::Map(err.to_string()))?;
    Ok(ptr.cast())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
