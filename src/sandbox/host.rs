//! Snapshots of the host that plan building depends on.
//!
//! Plan building never reads the process environment or the filesystem
//! directly. It goes through a [`HostContext`] (environment, home directory,
//! uid) and a [`HostFs`] probe, so tests can describe an arbitrary host.

use std::collections::BTreeMap;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Directory permissions: owner read/write/execute only (0700).
const PRIVATE_DIR_PERMISSIONS: u32 = 0o700;

/// Environment and identity of the invoking user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Environment variables of the invoking process.
    pub env: BTreeMap<String, String>,
    /// Home directory of the invoking user.
    pub home: PathBuf,
    /// Real user id of the invoking user.
    pub uid: u32,
}

impl HostContext {
    /// Captures the environment and identity of the current process.
    #[must_use]
    pub fn from_process() -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let home = env
            .get("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));

        Self {
            env,
            home,
            uid: nix::unistd::getuid().as_raw(),
        }
    }

    /// Creates a context from explicit parts.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>, uid: u32) -> Self {
        Self {
            env: BTreeMap::new(),
            home: home.into(),
            uid,
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Looks up an environment variable.
    #[must_use]
    pub fn var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

/// Filesystem probes used while building a plan.
pub trait HostFs {
    /// Whether `path` exists (following symlinks).
    fn exists(&self, path: &Path) -> bool;

    /// The raw link target if `path` itself is a symlink.
    fn symlink_target(&self, path: &Path) -> Option<PathBuf>;

    /// `path` with all symlinks resolved; unresolvable paths come back as given.
    fn real_path(&self, path: &Path) -> PathBuf;

    /// Creates `path` and missing parents with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn create_private_dir(&self, path: &Path) -> io::Result<()>;
}

/// [`HostFs`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl HostFs for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn symlink_target(&self, path: &Path) -> Option<PathBuf> {
        if path.is_symlink() {
            std::fs::read_link(path).ok()
        } else {
            None
        }
    }

    fn real_path(&self, path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn create_private_dir(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_PERMISSIONS)
            .create(path)
    }
}
