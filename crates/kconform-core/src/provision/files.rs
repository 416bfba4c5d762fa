// crates/kconform-core/src/provision/files.rs
// ============================================================================
// Module: Resource Files
// Description: Copies auxiliary test files into the scratch directory.
// Purpose: Make data files and helpers reachable through relative paths.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Relative names are searched in the current directory and next to the
//! running executable; absolute names are used as given.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label.
const RESOURCE: &str = "resource files";

/// Copies a list of files into the scratch directory.
#[derive(Debug, Clone)]
pub struct ResourceFilesFactory {
    /// Files to copy.
    files: Vec<PathBuf>,
}

impl ResourceFilesFactory {
    /// Creates a factory for `files`.
    #[must_use]
    pub const fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
        }
    }
}

/// Finds a resource file on disk.
fn locate(file: &Path) -> Option<PathBuf> {
    if file.is_absolute() {
        return file.exists().then(|| file.to_path_buf());
    }
    let mut candidates = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(file));
    }
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        candidates.push(exe_dir.join(file));
    }
    candidates.into_iter().find(|candidate| candidate.exists())
}

impl ResourceFactory for ResourceFilesFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let scratch = state
            .scratch_dir
            .clone()
            .ok_or_else(|| ProvisionError::failed(RESOURCE, "copy", "no scratch directory"))?;
        let mut copied = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let copy_result = locate(file)
                .ok_or_else(|| ProvisionError::failed(RESOURCE, "locate", format!("{} not found", file.display())))
                .and_then(|source| {
                    let name = source
                        .file_name()
                        .ok_or_else(|| ProvisionError::failed(RESOURCE, "copy", "file has no name"))?;
                    let target = scratch.join(name);
                    fs::copy(&source, &target)
                        .map_err(|err| ProvisionError::failed(RESOURCE, format!("copy {}", source.display()), err))?;
                    Ok(target)
                });
            match copy_result {
                Ok(target) => copied.push(target),
                Err(err) => {
                    for target in &copied {
                        let _ = fs::remove_file(target);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Box::new(CopiedFiles {
            copied,
        }))
    }
}

/// Files copied into the scratch directory.
struct CopiedFiles {
    /// Copies, in copy order.
    copied: Vec<PathBuf>,
}

impl Resource for CopiedFiles {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::ResourceFiles(self.copied.clone())
    }

    fn release(self: Box<Self>, _state: &mut ProvisionState) -> Result<(), ProvisionError> {
        for target in self.copied.iter().rev() {
            match fs::remove_file(target) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(ProvisionError::failed(RESOURCE, format!("remove {}", target.display()), err));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
