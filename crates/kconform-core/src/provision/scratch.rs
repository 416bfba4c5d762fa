// crates/kconform-core/src/provision/scratch.rs
// ============================================================================
// Module: Scratch Directory
// Description: Private temporary directory for a test run.
// Purpose: Give tests a writable working area removed on teardown.
// Dependencies: tempfile
// ============================================================================

//! ## Overview
//! Creates `<tmpdir>/<tid>_XXXXXX` with mode 0777 so unprivileged children
//! can use it, and removes it recursively on release.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label.
const RESOURCE: &str = "scratch directory";

/// Creates scratch directories under a parent directory.
#[derive(Debug, Clone)]
pub struct ScratchDirFactory {
    /// Parent directory (`paths.tmpdir`).
    parent: PathBuf,
    /// Name prefix.
    prefix: String,
}

impl ScratchDirFactory {
    /// Creates a factory placing directories under `parent`.
    #[must_use]
    pub fn new(parent: impl Into<PathBuf>, tid: &str) -> Self {
        Self {
            parent: parent.into(),
            prefix: format!("{tid}_"),
        }
    }
}

impl ResourceFactory for ScratchDirFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let dir = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.parent)
            .map_err(|err| ProvisionError::failed(RESOURCE, format!("create in {}", self.parent.display()), err))?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777))
            .map_err(|err| ProvisionError::failed(RESOURCE, "chmod", err))?;
        state.scratch_dir = Some(dir.path().to_path_buf());
        Ok(Box::new(ScratchDir {
            dir,
        }))
    }
}

/// Acquired scratch directory.
struct ScratchDir {
    /// Owned temporary directory.
    dir: TempDir,
}

impl Resource for ScratchDir {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::ScratchDir(self.dir.path().to_path_buf())
    }

    fn release(self: Box<Self>, state: &mut ProvisionState) -> Result<(), ProvisionError> {
        state.scratch_dir = None;
        let path = self.dir.path().display().to_string();
        self.dir.close().map_err(|err| ProvisionError::failed(RESOURCE, format!("remove {path}"), err))
    }
}
