// crates/kconform-core/src/checkpoint.rs
// ============================================================================
// Module: Checkpoint Synchronizer
// Description: Counted futex rendezvous between cooperating processes.
// Purpose: Order cross-process steps without sleeps or pipes.
// Dependencies: libc, thiserror, crate::shm
// ============================================================================

//! ## Overview
//! Each checkpoint slot lives in the shared region and carries two
//! increment-only counters. A waiter consumes one token once
//! `wake > consumed`; a waker posts `n` tokens, wakes up to `n` futex waiters
//! and then blocks until its tokens have been consumed.
//! Invariants:
//! - Counts, not flags: `wake(id, 5)` releases five waiters, a sixth blocks.
//! - A waker fails with [`CheckpointError::Timeout`] when its tokens are not
//!   consumed in time, and takes the unconsumed ones back.
//! - Slot ids outside the region are rejected.

// ============================================================================
// SECTION: Imports
// ============================================================================

#![allow(unsafe_code, reason = "Futex operations are only reachable through the raw syscall.")]

use std::rc::Rc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::shm::CHECKPOINT_SLOTS;
use crate::shm::CheckpointSlot;
use crate::shm::SharedRegion;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Poll interval used by wakers waiting for consumption.
const CONSUME_POLL: Duration = Duration::from_millis(1);
/// Upper bound of a single futex sleep when waiting forever.
const MAX_FUTEX_SLEEP: Duration = Duration::from_secs(1);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Checkpoint errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// Slot id out of range.
    #[error("checkpoint id {id} out of range (slots: {slots})")]
    InvalidId {
        /// Requested id.
        id: usize,
        /// Available slots.
        slots: usize,
    },
    /// Operation did not complete in time.
    #[error("checkpoint {id} {operation} timed out")]
    Timeout {
        /// Slot id.
        id: usize,
        /// `wait` or `wake`.
        operation: &'static str,
    },
    /// Futex syscall failed unexpectedly.
    #[error("checkpoint {id} futex error: {reason}")]
    Futex {
        /// Slot id.
        id: usize,
        /// OS error text.
        reason: String,
    },
}

// ============================================================================
// SECTION: Checkpoints
// ============================================================================

/// Checkpoint operations over a shared region.
#[derive(Debug, Clone)]
pub struct Checkpoints {
    /// Region holding the slots.
    region: Rc<SharedRegion>,
}

impl Checkpoints {
    /// Creates checkpoint operations over `region`.
    #[must_use]
    pub const fn new(region: Rc<SharedRegion>) -> Self {
        Self {
            region,
        }
    }

    /// Returns the slot for `id`.
    fn slot(&self, id: usize) -> Result<&CheckpointSlot, CheckpointError> {
        self.region.checkpoint(id).ok_or(CheckpointError::InvalidId {
            id,
            slots: CHECKPOINT_SLOTS,
        })
    }

    /// Blocks until a token is available on `id`, then consumes it.
    ///
    /// `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Timeout`] when no token arrives in time.
    pub fn wait(&self, id: usize, timeout: Option<Duration>) -> Result<(), CheckpointError> {
        let slot = self.slot(id)?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let consumed = slot.consumed.load(Ordering::Acquire);
            let posted = slot.wake.load(Ordering::Acquire);
            if posted > consumed {
                if slot
                    .consumed
                    .compare_exchange(consumed, consumed + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            let sleep = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(CheckpointError::Timeout {
                            id,
                            operation: "wait",
                        });
                    }
                    left.min(MAX_FUTEX_SLEEP)
                }
                None => MAX_FUTEX_SLEEP,
            };
            futex_wait(&slot.wake, posted, sleep).map_err(|reason| CheckpointError::Futex {
                id,
                reason,
            })?;
        }
    }

    /// Posts `count` tokens on `id` and blocks until they are consumed.
    ///
    /// On timeout the tokens no waiter took are withdrawn, so a later
    /// [`Checkpoints::wait`] still needs a fresh wake.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Timeout`] when the tokens are not consumed in time.
    pub fn wake(&self, id: usize, count: u32, timeout: Option<Duration>) -> Result<(), CheckpointError> {
        let slot = self.slot(id)?;
        if count == 0 {
            return Ok(());
        }
        let target = slot.wake.fetch_add(count, Ordering::AcqRel) + count;
        futex_wake(&slot.wake, count).map_err(|reason| CheckpointError::Futex {
            id,
            reason,
        })?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while slot.consumed.load(Ordering::Acquire) < target {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                retract(slot, count);
                return Err(CheckpointError::Timeout {
                    id,
                    operation: "wake",
                });
            }
            std::thread::sleep(CONSUME_POLL);
        }
        Ok(())
    }

    /// Wakes one waiter on `id`, then waits on the same slot.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] from either half.
    pub fn wake_and_wait(&self, id: usize, timeout: Option<Duration>) -> Result<(), CheckpointError> {
        self.wake(id, 1, timeout)?;
        self.wait(id, timeout)
    }

    /// Returns the `(posted, consumed)` counters of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidId`] for out-of-range ids.
    pub fn counters(&self, id: usize) -> Result<(u32, u32), CheckpointError> {
        let slot = self.slot(id)?;
        Ok((slot.wake.load(Ordering::Acquire), slot.consumed.load(Ordering::Acquire)))
    }
}

/// Consumes up to `count` still-pending tokens on behalf of a timed-out waker.
///
/// Shares the `consumed` CAS with waiters, so a token is taken either by one
/// waiter or by the waker, never both.
fn retract(slot: &CheckpointSlot, count: u32) {
    loop {
        let consumed = slot.consumed.load(Ordering::Acquire);
        let pending = slot.wake.load(Ordering::Acquire).saturating_sub(consumed).min(count);
        if pending == 0 {
            return;
        }
        if slot
            .consumed
            .compare_exchange(consumed, consumed + pending, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

// ============================================================================
// SECTION: Futex
// ============================================================================

/// Sleeps while `word == expected`, for at most `timeout`.
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> Result<(), String> {
    let ts = libc::timespec {
        tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::try_from(timeout.subsec_nanos()).unwrap_or(0),
    };
    // SAFETY: `word` is a live u32 in a shared mapping; FUTEX_WAIT only reads it
    // and `ts` outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &raw const ts,
            std::ptr::null::<u32>(),
            0_u32,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN | libc::EINTR | libc::ETIMEDOUT) => Ok(()),
        _ => Err(err.to_string()),
    }
}

/// Wakes up to `count` waiters sleeping on `word`.
fn futex_wake(word: &AtomicU32, count: u32) -> Result<(), String> {
    let count = libc::c_int::try_from(count).unwrap_or(libc::c_int::MAX);
    // SAFETY: `word` is a live u32 in a shared mapping; FUTEX_WAKE does not
    // dereference the remaining arguments.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0_u32,
        )
    };
    if rc < 0 { Err(std::io::Error::last_os_error().to_string()) } else { Ok(()) }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
