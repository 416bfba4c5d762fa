// crates/kconform-core/src/provision/hugepages.rs
// ============================================================================
// Module: Huge Pages
// Description: Raises the persistent huge page pool for a test.
// Purpose: Reserve default-size huge pages and restore the pool afterwards.
// Dependencies: std
// ============================================================================

//! ## Overview
//! The pool is grown through `<proc_root>/sys/vm/nr_hugepages` after
//! dropping caches and compacting memory. The kernel may grant fewer pages
//! than asked; the request policy decides whether that is acceptable.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::descriptor::HugePagePolicy;
use crate::descriptor::HugePageRequest;
use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label.
const RESOURCE: &str = "huge pages";

/// Reserves huge pages.
#[derive(Debug, Clone)]
pub struct HugePagesFactory {
    /// Procfs root.
    proc_root: PathBuf,
    /// Requested count and policy.
    request: HugePageRequest,
}

impl HugePagesFactory {
    /// Creates a factory operating on `<proc_root>/sys/vm`.
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>, request: HugePageRequest) -> Self {
        Self {
            proc_root: proc_root.into(),
            request,
        }
    }

    /// Path of the pool size knob.
    fn pool_path(&self) -> PathBuf {
        self.proc_root.join("sys/vm/nr_hugepages")
    }
}

/// Reads the current pool size.
fn read_pool(path: &Path) -> Result<u64, ProvisionError> {
    let text = fs::read_to_string(path)
        .map_err(|err| ProvisionError::unavailable(RESOURCE, format!("cannot read {}: {err}", path.display())))?;
    text.trim()
        .parse()
        .map_err(|_| ProvisionError::failed(RESOURCE, format!("parse {}", path.display()), text.trim()))
}

impl ResourceFactory for HugePagesFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let path = self.pool_path();
        let previous = read_pool(&path)?;
        let _ = fs::write(self.proc_root.join("sys/vm/drop_caches"), "3");
        let _ = fs::write(self.proc_root.join("sys/vm/compact_memory"), "1");
        let wanted = previous.saturating_add(self.request.count);
        let reserved = match fs::write(&path, wanted.to_string()) {
            Ok(()) => read_pool(&path)?.saturating_sub(previous),
            Err(err) if self.request.policy == HugePagePolicy::Require => {
                return Err(ProvisionError::unavailable(RESOURCE, format!("cannot grow pool: {err}")));
            }
            Err(_) => 0,
        };
        if reserved < self.request.count && self.request.policy == HugePagePolicy::Require {
            let _ = fs::write(&path, previous.to_string());
            return Err(ProvisionError::unavailable(
                RESOURCE,
                format!("only {reserved} of {} pages reserved", self.request.count),
            ));
        }
        state.hugepages = reserved;
        Ok(Box::new(HugePagePool {
            path,
            previous,
            reserved,
        }))
    }
}

/// Grown huge page pool.
struct HugePagePool {
    /// Pool size knob.
    path: PathBuf,
    /// Pool size before the change.
    previous: u64,
    /// Pages added.
    reserved: u64,
}

impl Resource for HugePagePool {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::HugePages {
            previous: self.previous,
            reserved: self.reserved,
        }
    }

    fn release(self: Box<Self>, state: &mut ProvisionState) -> Result<(), ProvisionError> {
        state.hugepages = 0;
        if self.reserved == 0 {
            return Ok(());
        }
        fs::write(&self.path, self.previous.to_string())
            .map_err(|err| ProvisionError::failed(RESOURCE, format!("restore {}", self.path.display()), err))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
