// crates/kconform-core/src/provision/cgroup.rs
// ============================================================================
// Module: Control Groups
// Description: Mount discovery and per-test cgroup creation.
// Purpose: Put a test under a dedicated cgroup with the controllers it needs.
// Dependencies: nix
// ============================================================================

//! ## Overview
//! Hierarchies are discovered from `/proc/self/mounts`. The test cgroup is
//! `<root>/kconform/test-<pid>` with a sibling `drain` group that receives
//! leftover processes before the test group is removed.
//! Invariants:
//! - Only directories created by this factory are removed on release.
//! - The unified hierarchy is preferred when either version is acceptable.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use nix::unistd::getpid;

use crate::descriptor::CgroupRequest;
use crate::descriptor::CgroupVersion;
use crate::provision::AcquiredResource;
use crate::provision::ProvisionError;
use crate::provision::ProvisionState;
use crate::provision::Resource;
use crate::provision::ResourceFactory;

/// Resource class label.
const RESOURCE: &str = "cgroup";
/// Directory shared by all runs.
const BASE_DIR: &str = "kconform";
/// Group that holds processes evicted from the test group.
const DRAIN_DIR: &str = "drain";
/// Controller names recognised in v1 mount options.
const V1_CONTROLLERS: &[&str] = &[
    "blkio",
    "cpu",
    "cpuacct",
    "cpuset",
    "devices",
    "freezer",
    "hugetlb",
    "memory",
    "misc",
    "net_cls",
    "net_prio",
    "perf_event",
    "pids",
    "rdma",
];

// ============================================================================
// SECTION: Mount Discovery
// ============================================================================

/// A v1 hierarchy and the controllers bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Hierarchy {
    /// Mount point.
    pub root: PathBuf,
    /// Controllers listed in the mount options.
    pub controllers: Vec<String>,
}

/// Cgroup hierarchies mounted on the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CgroupMounts {
    /// Unified hierarchy mount point.
    pub unified: Option<PathBuf>,
    /// Legacy hierarchies.
    pub legacy: Vec<V1Hierarchy>,
}

/// Hierarchy roots chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupRoot {
    /// Unified hierarchy root.
    V2(PathBuf),
    /// One root per distinct legacy hierarchy, in controller order.
    V1(Vec<PathBuf>),
}

impl CgroupRoot {
    /// Returns the roots a test group is created under.
    #[must_use]
    pub fn roots(&self) -> Vec<PathBuf> {
        match self {
            Self::V2(root) => vec![root.clone()],
            Self::V1(roots) => roots.clone(),
        }
    }
}

impl CgroupMounts {
    /// Parses the contents of `/proc/self/mounts`.
    #[must_use]
    pub fn parse(mounts: &str) -> Self {
        let mut parsed = Self::default();
        for line in mounts.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [_, target, fs_type, options, ..] = fields.as_slice() else {
                continue;
            };
            match *fs_type {
                "cgroup2" if parsed.unified.is_none() => parsed.unified = Some(PathBuf::from(target)),
                "cgroup" => {
                    let controllers = options
                        .split(',')
                        .filter(|option| V1_CONTROLLERS.contains(option))
                        .map(str::to_string)
                        .collect();
                    parsed.legacy.push(V1Hierarchy {
                        root: PathBuf::from(target),
                        controllers,
                    });
                }
                _ => {}
            }
        }
        parsed
    }

    /// Picks hierarchies providing `controllers` under `version`.
    #[must_use]
    pub fn select(&self, version: CgroupVersion, controllers: &[String]) -> Option<CgroupRoot> {
        match version {
            CgroupVersion::V2 => self.select_unified(controllers),
            CgroupVersion::V1 => self.select_legacy(controllers),
            CgroupVersion::Any => {
                self.select_unified(controllers).or_else(|| self.select_legacy(controllers))
            }
        }
    }

    /// Unified root when its `cgroup.controllers` lists every controller.
    fn select_unified(&self, controllers: &[String]) -> Option<CgroupRoot> {
        let root = self.unified.as_ref()?;
        if !controllers.is_empty() {
            let available = fs::read_to_string(root.join("cgroup.controllers")).ok()?;
            let available: BTreeSet<&str> = available.split_whitespace().collect();
            if !controllers.iter().all(|controller| available.contains(controller.as_str())) {
                return None;
            }
        }
        Some(CgroupRoot::V2(root.clone()))
    }

    /// Legacy roots covering every controller.
    fn select_legacy(&self, controllers: &[String]) -> Option<CgroupRoot> {
        if controllers.is_empty() {
            return self.legacy.first().map(|hierarchy| CgroupRoot::V1(vec![hierarchy.root.clone()]));
        }
        let mut roots: Vec<PathBuf> = Vec::new();
        for controller in controllers {
            let hierarchy = self.legacy.iter().find(|hierarchy| hierarchy.controllers.contains(controller))?;
            if !roots.contains(&hierarchy.root) {
                roots.push(hierarchy.root.clone());
            }
        }
        Some(CgroupRoot::V1(roots))
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Creates the per-test cgroup.
#[derive(Debug, Clone)]
pub struct CgroupFactory {
    /// Procfs root used to discover mounts.
    proc_root: PathBuf,
    /// Requested version and controllers.
    request: CgroupRequest,
}

impl CgroupFactory {
    /// Creates a factory reading mounts from `<proc_root>/self/mounts`.
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>, request: CgroupRequest) -> Self {
        Self {
            proc_root: proc_root.into(),
            request,
        }
    }
}

/// Creates `dir` and reports whether this call created it.
fn ensure_dir(dir: &Path) -> Result<bool, ProvisionError> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(ProvisionError::failed(RESOURCE, format!("mkdir {}", dir.display()), err)),
    }
}

/// Enables `controllers` for children of `dir` (unified hierarchy only).
fn enable_controllers(dir: &Path, controllers: &[String]) -> Result<(), ProvisionError> {
    let control = dir.join("cgroup.subtree_control");
    for controller in controllers {
        fs::write(&control, format!("+{controller}")).map_err(|err| {
            ProvisionError::failed(RESOURCE, format!("enable {controller} in {}", dir.display()), err)
        })?;
    }
    Ok(())
}

impl ResourceFactory for CgroupFactory {
    fn acquire(&self, state: &mut ProvisionState) -> Result<Box<dyn Resource>, ProvisionError> {
        let mounts_path = self.proc_root.join("self/mounts");
        let mounts = fs::read_to_string(&mounts_path).map_err(|err| {
            ProvisionError::failed(RESOURCE, format!("read {}", mounts_path.display()), err)
        })?;
        let selected = CgroupMounts::parse(&mounts)
            .select(self.request.version, &self.request.controllers)
            .ok_or_else(|| {
                ProvisionError::unavailable(
                    RESOURCE,
                    format!("no hierarchy provides [{}]", self.request.controllers.join(", ")),
                )
            })?;
        let unified = matches!(selected, CgroupRoot::V2(_));
        let mut group = TestGroup {
            created: Vec::new(),
            groups: Vec::new(),
        };
        for root in selected.roots() {
            if let Err(err) = group.create_under(&root, unified, &self.request.controllers) {
                let _ = group.remove();
                return Err(err);
            }
        }
        state.cgroup_dir = group.groups.first().map(|(test_dir, _)| test_dir.clone());
        Ok(Box::new(group))
    }
}

/// Test cgroups created under each selected root.
struct TestGroup {
    /// Directories created by this run, in creation order.
    created: Vec<PathBuf>,
    /// (test group, drain group) per root.
    groups: Vec<(PathBuf, PathBuf)>,
}

impl TestGroup {
    /// Creates the base, drain, and test groups under `root`.
    fn create_under(&mut self, root: &Path, unified: bool, controllers: &[String]) -> Result<(), ProvisionError> {
        let base = root.join(BASE_DIR);
        if unified {
            enable_controllers(root, controllers)?;
        }
        if ensure_dir(&base)? {
            self.created.push(base.clone());
        }
        if unified {
            enable_controllers(&base, controllers)?;
        }
        let drain = base.join(DRAIN_DIR);
        if ensure_dir(&drain)? {
            self.created.push(drain.clone());
        }
        let test_dir = base.join(format!("test-{}", getpid()));
        if !ensure_dir(&test_dir)? {
            return Err(ProvisionError::failed(RESOURCE, format!("mkdir {}", test_dir.display()), "already exists"));
        }
        self.created.push(test_dir.clone());
        self.groups.push((test_dir, drain));
        Ok(())
    }

    /// Moves leftover processes out and removes created directories.
    fn remove(&mut self) -> Option<ProvisionError> {
        let mut first_error = None;
        for (test_dir, drain) in &self.groups {
            let procs = fs::read_to_string(test_dir.join("cgroup.procs")).unwrap_or_default();
            for pid in procs.split_whitespace() {
                if let Err(err) = fs::write(drain.join("cgroup.procs"), pid) {
                    first_error.get_or_insert_with(|| {
                        ProvisionError::failed(RESOURCE, format!("drain pid {pid}"), err)
                    });
                }
            }
        }
        for dir in self.created.drain(..).rev() {
            let shared = dir.file_name().is_some_and(|name| name == BASE_DIR || name == DRAIN_DIR);
            match fs::remove_dir(&dir) {
                Err(err) if !shared => {
                    first_error
                        .get_or_insert_with(|| ProvisionError::failed(RESOURCE, format!("rmdir {}", dir.display()), err));
                }
                _ => {}
            }
        }
        self.groups.clear();
        first_error
    }
}

impl Resource for TestGroup {
    fn acquired(&self) -> AcquiredResource {
        AcquiredResource::Cgroup {
            test_dir: self.groups.first().map(|(test_dir, _)| test_dir.clone()).unwrap_or_default(),
        }
    }

    fn release(mut self: Box<Self>, state: &mut ProvisionState) -> Result<(), ProvisionError> {
        state.cgroup_dir = None;
        self.remove().map_or(Ok(()), Err)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
