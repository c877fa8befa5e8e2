//! Linux control-group backend.
//!
//! Supports both the unified (v2) hierarchy and the legacy per-controller (v1)
//! layout. Every group lives directly under the mount root: nested groups are
//! not supported.
use crate::limiter::{Limiter, ResourceGroup};
use crate::limits::{validate_name, LimiterConfig, ResourceLimits};
use crate::types::{LimitError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default cgroup filesystem mount point
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// v1 controllers a group is created in
const V1_CONTROLLERS: [&str; 2] = ["cpu", "memory"];

/// Layout of the cgroup filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// One hierarchy per controller
    V1,
    /// Unified hierarchy
    V2,
}

impl CgroupVersion {
    /// Detect the layout mounted at `root`
    pub fn detect(root: &Path) -> Self {
        if root.join("cgroup.controllers").exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }
}

/// A control group with CPU and memory limits applied
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    version: CgroupVersion,
    limits: ResourceLimits,
    /// v2: the group directory; v1: one directory per controller
    dirs: Vec<PathBuf>,
}

impl Cgroup {
    /// Create a cgroup under the default mount point
    pub fn create(config: &LimiterConfig) -> Result<Self> {
        Self::create_in(CGROUP_ROOT, config)
    }

    /// Create a cgroup under `root` and apply every configured limit
    ///
    /// If any step fails the directories created so far are removed again.
    pub fn create_in(root: impl AsRef<Path>, config: &LimiterConfig) -> Result<Self> {
        Self::create_with(root.as_ref(), config, write_control)
    }

    /// Create with `write` used for every control-file write
    fn create_with<W>(root: &Path, config: &LimiterConfig, write: W) -> Result<Self>
    where
        W: Fn(&Path, &str, &str) -> io::Result<()>,
    {
        let (name, limits) = config.resolve()?;
        let version = CgroupVersion::detect(root);

        let mut cgroup = Self {
            dirs: Vec::new(),
            name,
            version,
            limits,
        };

        if let Err(source) = cgroup.build(root, &write) {
            cgroup.rollback();
            return Err(LimitError::Create {
                name: cgroup.name,
                source,
            });
        }

        log::info!(
            "Created {:?} cgroup '{}' with limits {:?}",
            cgroup.version,
            cgroup.name,
            cgroup.limits
        );
        Ok(cgroup)
    }

    /// Open a cgroup that already exists under the default mount point
    pub fn open(name: &str) -> Result<Self> {
        Self::open_in(CGROUP_ROOT, name)
    }

    /// Open a cgroup that already exists under `root`. Limits are left untouched.
    pub fn open_in(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        let root = root.as_ref();
        validate_name(name)?;
        let version = CgroupVersion::detect(root);
        let dirs = Self::group_dirs(root, version, name);

        if let Some(missing) = dirs.iter().find(|dir| !dir.is_dir()) {
            return Err(LimitError::Open {
                name: name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", missing.display()),
                ),
            });
        }

        log::debug!("Opened {:?} cgroup '{}'", version, name);
        Ok(Self {
            name: name.to_string(),
            version,
            limits: ResourceLimits::default(),
            dirs,
        })
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Directories backing this group
    pub fn paths(&self) -> &[PathBuf] {
        &self.dirs
    }

    fn group_dirs(root: &Path, version: CgroupVersion, name: &str) -> Vec<PathBuf> {
        match version {
            CgroupVersion::V2 => vec![root.join(name)],
            CgroupVersion::V1 => V1_CONTROLLERS
                .iter()
                .map(|controller| root.join(controller).join(name))
                .collect(),
        }
    }

    fn build<W>(&mut self, root: &Path, write: &W) -> io::Result<()>
    where
        W: Fn(&Path, &str, &str) -> io::Result<()>,
    {
        if self.version == CgroupVersion::V2 {
            Self::enable_controllers(root);
        }

        for dir in Self::group_dirs(root, self.version, &self.name) {
            // Non-recursive: an existing group is a name collision
            fs::create_dir(&dir)?;
            log::debug!("Created cgroup directory {}", dir.display());
            self.dirs.push(dir);
        }

        match self.version {
            CgroupVersion::V2 => self.apply_v2(write),
            CgroupVersion::V1 => self.apply_v1(write),
        }
    }

    /// Ask the root to delegate cpu and memory to its children
    fn enable_controllers(root: &Path) {
        let subtree = root.join("cgroup.subtree_control");
        for controller in ["+cpu", "+memory"] {
            if let Err(e) = fs::write(&subtree, controller) {
                log::warn!(
                    "Failed to enable {} in {}: {}",
                    controller,
                    subtree.display(),
                    e
                );
            }
        }
    }

    fn apply_v2<W>(&self, write: &W) -> io::Result<()>
    where
        W: Fn(&Path, &str, &str) -> io::Result<()>,
    {
        let dir = &self.dirs[0];
        if let Some((quota, period)) = self.limits.cfs_quota() {
            write(dir, "cpu.max", &format!("{} {}", quota, period))?;
        }
        if let Some(bytes) = self.limits.memory_bytes {
            write(dir, "memory.max", &bytes.to_string())?;
        }
        Ok(())
    }

    fn apply_v1<W>(&self, write: &W) -> io::Result<()>
    where
        W: Fn(&Path, &str, &str) -> io::Result<()>,
    {
        let cpu_dir = &self.dirs[0];
        let memory_dir = &self.dirs[1];
        if let Some((quota, period)) = self.limits.cfs_quota() {
            // Period first: the kernel validates quota against the current period
            write(cpu_dir, "cpu.cfs_period_us", &period.to_string())?;
            write(cpu_dir, "cpu.cfs_quota_us", &quota.to_string())?;
        }
        if let Some(bytes) = self.limits.memory_bytes {
            write(memory_dir, "memory.limit_in_bytes", &bytes.to_string())?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        for dir in self.dirs.drain(..).rev() {
            if let Err(e) = fs::remove_dir(&dir) {
                log::warn!(
                    "Failed to roll back cgroup directory {}: {}",
                    dir.display(),
                    e
                );
            }
        }
    }
}

fn write_control(dir: &Path, file: &str, value: &str) -> io::Result<()> {
    fs::write(dir.join(file), value).map_err(|e| {
        io::Error::new(e.kind(), format!("failed to write {}: {}", file, e))
    })?;
    log::debug!("Set {} = {} in {}", file, value, dir.display());
    Ok(())
}

impl Limiter for Cgroup {
    fn limit(&self, pid: u32) -> Result<()> {
        let attach_error = |source: io::Error| LimitError::Attach {
            name: self.name.clone(),
            pid,
            source,
        };

        if pid == 0 {
            return Err(attach_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "must provide a valid pid",
            )));
        }

        for dir in &self.dirs {
            write_control(dir, "cgroup.procs", &pid.to_string()).map_err(attach_error)?;
        }
        log::debug!("Added process {} to cgroup '{}'", pid, self.name);
        Ok(())
    }
}

impl ResourceGroup for Cgroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Remove the group directories. The kernel refuses while processes remain inside.
    fn close(self) -> Result<()> {
        for dir in &self.dirs {
            if dir.exists() {
                fs::remove_dir(dir).map_err(|source| LimitError::Close {
                    name: self.name.clone(),
                    source,
                })?;
            }
        }
        log::info!("Deleted cgroup '{}'", self.name);
        Ok(())
    }
}

/// Whether a cgroup filesystem appears to be mounted at the default location
pub fn cgroups_available() -> bool {
    Path::new("/proc/cgroups").exists() && Path::new(CGROUP_ROOT).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MEGABYTE;
    use tempfile::TempDir;

    fn fake_v2_root() -> TempDir {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(root.path().join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        root
    }

    fn fake_v1_root() -> TempDir {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        for controller in V1_CONTROLLERS {
            fs::create_dir(root.path().join(controller)).unwrap();
        }
        root
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).expect("control file should exist")
    }

    #[test]
    fn test_detect_version() {
        assert_eq!(CgroupVersion::detect(fake_v2_root().path()), CgroupVersion::V2);
        assert_eq!(CgroupVersion::detect(fake_v1_root().path()), CgroupVersion::V1);
    }

    #[test]
    fn test_create_v2_writes_limits() {
        let root = fake_v2_root();
        let config = LimiterConfig::new()
            .with_name("limited")
            .with_cpu_limit(50)
            .with_memory_limit(512 * MEGABYTE);

        let cgroup = Cgroup::create_in(root.path(), &config).unwrap();
        let dir = root.path().join("limited");

        assert_eq!(cgroup.name(), "limited");
        assert_eq!(cgroup.version(), CgroupVersion::V2);
        assert_eq!(cgroup.paths(), &[dir.clone()]);
        assert_eq!(read(dir.join("cpu.max")), "50000 100000");
        assert_eq!(read(dir.join("memory.max")), (512 * MEGABYTE).to_string());
        assert_eq!(cgroup.limits(), &config.limits);
    }

    #[test]
    fn test_create_v1_writes_limits_per_controller() {
        let root = fake_v1_root();
        let config = LimiterConfig::new()
            .with_name("legacy")
            .with_cpu_limit(200)
            .with_memory_limit(1024);

        Cgroup::create_in(root.path(), &config).unwrap();
        let cpu = root.path().join("cpu/legacy");
        let memory = root.path().join("memory/legacy");

        assert_eq!(read(cpu.join("cpu.cfs_period_us")), "100000");
        assert_eq!(read(cpu.join("cpu.cfs_quota_us")), "200000");
        assert_eq!(read(memory.join("memory.limit_in_bytes")), "1024");
        assert!(!memory.join("cpu.cfs_quota_us").exists());
    }

    #[test]
    fn test_create_without_name_uses_uuid() {
        let root = fake_v2_root();
        let cgroup = Cgroup::create_in(root.path(), &LimiterConfig::new()).unwrap();

        assert!(uuid::Uuid::parse_str(cgroup.name()).is_ok());
        assert!(root.path().join(cgroup.name()).is_dir());
        cgroup.close().unwrap();
    }

    #[test]
    fn test_create_rejects_name_collision() {
        let root = fake_v2_root();
        fs::create_dir(root.path().join("taken")).unwrap();

        let err = Cgroup::create_in(root.path(), &LimiterConfig::new().with_name("taken"))
            .unwrap_err();
        assert!(matches!(err, LimitError::Create { ref name, .. } if name == "taken"));
    }

    #[test]
    fn test_create_rolls_back_on_partial_failure() {
        let root = fake_v1_root();
        // Second controller directory cannot be created
        fs::remove_dir(root.path().join("memory")).unwrap();

        let err = Cgroup::create_in(root.path(), &LimiterConfig::new().with_name("partial"))
            .unwrap_err();
        assert!(matches!(err, LimitError::Create { .. }));
        assert!(!root.path().join("cpu/partial").exists());
    }

    #[test]
    fn test_create_rolls_back_when_a_limit_cannot_be_written() {
        let root = fake_v1_root();
        let config = LimiterConfig::new()
            .with_name("half-limited")
            .with_cpu_limit(50)
            .with_memory_limit(1024);
        // Control files are virtual in cgroupfs, so record writes instead of creating files
        let written = std::cell::RefCell::new(Vec::new());
        let refuse_memory = |_dir: &Path, file: &str, _value: &str| {
            if file == "memory.limit_in_bytes" {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            written.borrow_mut().push(file.to_string());
            Ok(())
        };

        let err = Cgroup::create_with(root.path(), &config, refuse_memory).unwrap_err();
        assert!(matches!(err, LimitError::Create { ref name, .. } if name == "half-limited"));
        assert_eq!(
            written.into_inner(),
            ["cpu.cfs_period_us", "cpu.cfs_quota_us"]
        );
        assert!(!root.path().join("cpu/half-limited").exists());
        assert!(!root.path().join("memory/half-limited").exists());
    }

    #[test]
    fn test_create_validates_before_touching_fs() {
        let root = fake_v2_root();
        let err = Cgroup::create_in(
            root.path(),
            &LimiterConfig::new().with_name("zero").with_memory_limit(0),
        )
        .unwrap_err();

        assert!(matches!(err, LimitError::Config(_)));
        assert!(!root.path().join("zero").exists());
    }

    #[test]
    fn test_attach_writes_pid_to_every_controller() {
        let root = fake_v1_root();
        let cgroup =
            Cgroup::create_in(root.path(), &LimiterConfig::new().with_name("attach")).unwrap();

        cgroup.limit(4321).unwrap();
        for controller in V1_CONTROLLERS {
            let procs = root.path().join(controller).join("attach/cgroup.procs");
            assert_eq!(read(procs), "4321");
        }
    }

    #[test]
    fn test_attach_rejects_pid_zero() {
        let root = fake_v2_root();
        let cgroup =
            Cgroup::create_in(root.path(), &LimiterConfig::new().with_name("zero-pid")).unwrap();

        let err = cgroup.limit(0).unwrap_err();
        assert!(matches!(err, LimitError::Attach { pid: 0, .. }));
        assert!(!root.path().join("zero-pid/cgroup.procs").exists());
    }

    #[test]
    fn test_open_existing_group() {
        let root = fake_v2_root();
        let created =
            Cgroup::create_in(root.path(), &LimiterConfig::new().with_name("shared").with_cpu_limit(10))
                .unwrap();

        let opened = Cgroup::open_in(root.path(), "shared").unwrap();
        assert_eq!(opened.name(), "shared");
        assert_eq!(opened.paths(), created.paths());
        assert!(opened.limits().is_empty());
        // Reopening must not rewrite limits
        assert_eq!(read(root.path().join("shared/cpu.max")), "10000 100000");
    }

    #[test]
    fn test_open_missing_group_fails() {
        let root = fake_v1_root();
        fs::create_dir(root.path().join("cpu/half")).unwrap();

        let err = Cgroup::open_in(root.path(), "half").unwrap_err();
        assert!(matches!(err, LimitError::Open { .. }));
    }

    #[test]
    fn test_close_removes_directories() {
        let root = fake_v1_root();
        let cgroup =
            Cgroup::create_in(root.path(), &LimiterConfig::new().with_name("gone")).unwrap();
        cgroup.close().unwrap();

        assert!(!root.path().join("cpu/gone").exists());
        assert!(!root.path().join("memory/gone").exists());
    }
}
