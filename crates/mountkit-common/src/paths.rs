//! Standard filesystem paths for mountkit.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Default static mount table.
pub static FSTAB_PATH: Lazy<PathBuf> = Lazy::new(|| env_path("MOUNTKIT_FSTAB", "/etc/fstab"));

/// Default live mount table of the calling process.
pub static MOUNTINFO_PATH: Lazy<PathBuf> =
    Lazy::new(|| env_path("MOUNTKIT_MOUNTINFO", "/proc/self/mountinfo"));

/// Default userspace mount table.
pub static UTAB_PATH: Lazy<PathBuf> = Lazy::new(|| env_path("MOUNTKIT_UTAB", "/run/mount/utab"));

/// Default directory holding the `by-uuid`, `by-label`, ... symlink trees.
pub static TAG_DIR: Lazy<PathBuf> = Lazy::new(|| env_path("MOUNTKIT_TAG_DIR", "/dev/disk"));

/// Default colon-separated search path for `mount.<type>` helpers.
pub static HELPER_SEARCH_PATH: Lazy<String> = Lazy::new(|| {
    std::env::var("MOUNTKIT_HELPER_PATH").unwrap_or_else(|_| "/sbin:/sbin/fs.d:/sbin/fs".into())
});

/// Default user database, used to resolve login names.
pub static PASSWD_PATH: Lazy<PathBuf> = Lazy::new(|| env_path("MOUNTKIT_PASSWD", "/etc/passwd"));

/// Default engine configuration file.
pub static CONFIG_PATH: Lazy<PathBuf> =
    Lazy::new(|| env_path("MOUNTKIT_CONFIG", "/etc/mountkit.toml"));

/// Standard paths used by the mount engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountPaths {
    /// Static mount table (default: /etc/fstab).
    pub fstab: PathBuf,
    /// Live mount table (default: /proc/self/mountinfo).
    pub mountinfo: PathBuf,
    /// Userspace mount table (default: /run/mount/utab).
    pub utab: PathBuf,
    /// Device tag directory (default: /dev/disk).
    pub tag_dir: PathBuf,
    /// Helper search path, colon separated.
    pub helper_search_path: String,
    /// Lists of filesystem types tried when no type is given.
    pub filesystems: Vec<PathBuf>,
}

impl MountPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths relocated under `root`, e.g. for a test sandbox.
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            fstab: root.join("etc/fstab"),
            mountinfo: root.join("proc/self/mountinfo"),
            utab: root.join("run/mount/utab"),
            tag_dir: root.join("dev/disk"),
            helper_search_path: root.join("sbin").to_string_lossy().into_owned(),
            filesystems: vec![root.join("etc/filesystems"), root.join("proc/filesystems")],
        }
    }

    /// Lock file guarding the userspace mount table.
    #[must_use]
    pub fn utab_lock(&self) -> PathBuf {
        sibling(&self.utab, "lock")
    }

    /// Event file touched after each userspace mount table update.
    #[must_use]
    pub fn utab_event(&self) -> PathBuf {
        sibling(&self.utab, "event")
    }

    /// Directories of the helper search path, in order.
    pub fn helper_dirs(&self) -> impl Iterator<Item = &Path> {
        self.helper_search_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(Path::new)
    }
}

/// `<path>.<suffix>`, keeping the original file name.
#[must_use]
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

impl Default for MountPaths {
    fn default() -> Self {
        Self {
            fstab: FSTAB_PATH.clone(),
            mountinfo: MOUNTINFO_PATH.clone(),
            utab: UTAB_PATH.clone(),
            tag_dir: TAG_DIR.clone(),
            helper_search_path: HELPER_SEARCH_PATH.clone(),
            filesystems: vec![
                PathBuf::from("/etc/filesystems"),
                PathBuf::from("/proc/filesystems"),
            ],
        }
    }
}
