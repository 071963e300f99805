//! Filesystem description.

use serde::{Deserialize, Serialize};

use crate::options::match_options;

/// Device tags accepted as `NAME=value` sources.
pub const TAGS: &[&str] = &["UUID", "LABEL", "PARTUUID", "PARTLABEL", "ID"];

const PSEUDO_FS: &[&str] = &[
    "anon_inodefs", "autofs", "bdev", "binder", "binfmt_misc", "bpf", "cgroup", "cgroup2",
    "configfs", "cpuset", "debugfs", "devfs", "devpts", "devtmpfs", "dlmfs", "efivarfs",
    "fuse", "fuse.portal", "fusectl", "hugetlbfs", "mqueue", "nfsd", "none", "nsfs",
    "overlay", "pipefs", "proc", "pstore", "ramfs", "resctrl", "rootfs", "rpc_pipefs",
    "securityfs", "selinuxfs", "smackfs", "sockfs", "spufs", "sysfs", "tmpfs", "tracefs",
];

const NET_FS: &[&str] = &[
    "9p", "afs", "ceph", "cifs", "glusterfs", "ncpfs", "nfs", "nfs4", "smb3", "smbfs",
];

/// Filesystems whose source names a dataset rather than a path.
const DATASET_FS: &[&str] = &["zfs", "bcachefs"];

/// One mount's source, target, type and options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fs {
    /// Mount ID (mountinfo only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Parent mount ID (mountinfo only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,
    /// Device, tag, path or pseudo source.
    pub source: Option<String>,
    /// Mountpoint.
    pub target: Option<String>,
    /// Filesystem type.
    pub fstype: Option<String>,
    /// Kernel and filesystem options.
    pub options: Option<String>,
    /// Userspace options recorded in utab.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_options: Option<String>,
    /// Root of the mount within the filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Source of a bind mount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindsrc: Option<String>,
    /// Extra utab attributes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<String>,
    /// fstab dump frequency.
    #[serde(default)]
    pub freq: i32,
    /// fstab fsck pass number.
    #[serde(default)]
    pub passno: i32,
}

impl Fs {
    /// Create an empty description.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the filesystem type.
    #[must_use]
    pub fn with_fstype(mut self, fstype: impl Into<String>) -> Self {
        self.fstype = Some(fstype.into());
        self
    }

    /// Set the options.
    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// `(name, value)` when the source is a device tag.
    #[must_use]
    pub fn tag(&self) -> Option<(&str, &str)> {
        parse_tag(self.source.as_deref()?)
    }

    /// The source when it is not a tag.
    #[must_use]
    pub fn srcpath(&self) -> Option<&str> {
        if self.tag().is_some() {
            None
        } else {
            self.source.as_deref()
        }
    }

    /// Whether this entry describes swap space.
    #[must_use]
    pub fn is_swaparea(&self) -> bool {
        self.fstype.as_deref() == Some("swap")
    }

    /// Whether this is a pseudo filesystem without a backing device.
    #[must_use]
    pub fn is_pseudofs(&self) -> bool {
        self.fstype
            .as_deref()
            .is_some_and(|fstype| PSEUDO_FS.contains(&fstype))
    }

    /// Whether this is a network filesystem or the source is `host:path`
    /// or `//host/path` shaped.
    #[must_use]
    pub fn is_netfs(&self) -> bool {
        if let Some(fstype) = self.fstype.as_deref() {
            return NET_FS.contains(&fstype);
        }
        self.source.as_deref().is_some_and(is_network_source)
    }

    /// Whether the source names a dataset, not a path.
    #[must_use]
    pub fn is_dataset(&self) -> bool {
        self.fstype
            .as_deref()
            .is_some_and(|fstype| DATASET_FS.contains(&fstype))
    }

    /// Kernel options and userspace options joined.
    #[must_use]
    pub fn all_options(&self) -> Option<String> {
        match (self.options.as_deref(), self.user_options.as_deref()) {
            (Some(o), Some(u)) if !o.is_empty() && !u.is_empty() => Some(format!("{o},{u}")),
            (Some(o), _) if !o.is_empty() => Some(o.to_string()),
            (_, Some(u)) if !u.is_empty() => Some(u.to_string()),
            _ => None,
        }
    }

    /// Whether the type matches a `nofoo,bar` style pattern.
    #[must_use]
    pub fn match_fstype(&self, pattern: Option<&str>) -> bool {
        match_fstype(self.fstype.as_deref(), pattern)
    }

    /// Whether the options match a `user,nonetdev` style pattern.
    #[must_use]
    pub fn match_options(&self, pattern: Option<&str>) -> bool {
        match_options(self.all_options().as_deref(), pattern)
    }
}

/// Split `NAME=value` into its parts when `NAME` is a known tag.
#[must_use]
pub fn parse_tag(spec: &str) -> Option<(&str, &str)> {
    let (name, value) = spec.split_once('=')?;
    if !TAGS.contains(&name) || value.is_empty() {
        return None;
    }
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((name, value))
}

/// `host:path` or `//host/path`.
#[must_use]
pub fn is_network_source(source: &str) -> bool {
    source.starts_with("//") || (!source.starts_with('/') && source.contains(':'))
}

/// Match a filesystem type against a comma-separated pattern.
///
/// A leading `no` negates the whole list (`nofoo,bar` == `nofoo,nobar`);
/// an individual `no` item excludes just that type.
#[must_use]
pub fn match_fstype(fstype: Option<&str>, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    let Some(fstype) = fstype else {
        return false;
    };
    let (negated, pattern) = match pattern.strip_prefix("no") {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };

    for item in pattern.split(',') {
        if item.strip_prefix("no") == Some(fstype) {
            return false;
        }
        if item == fstype {
            return !negated;
        }
    }
    negated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags() {
        let fs = Fs::new().with_source("UUID=1234-abcd");
        assert_eq!(fs.tag(), Some(("UUID", "1234-abcd")));
        assert_eq!(fs.srcpath(), None);

        let fs = Fs::new().with_source("LABEL=\"my disk\"");
        assert_eq!(fs.tag(), Some(("LABEL", "my disk")));

        let fs = Fs::new().with_source("/dev/sda1");
        assert_eq!(fs.tag(), None);
        assert_eq!(fs.srcpath(), Some("/dev/sda1"));

        assert_eq!(parse_tag("FOO=bar"), None);
    }

    #[test]
    fn classification() {
        assert!(Fs::new().with_fstype("swap").is_swaparea());
        assert!(Fs::new().with_fstype("tmpfs").is_pseudofs());
        assert!(!Fs::new().with_fstype("ext4").is_pseudofs());
        assert!(Fs::new().with_fstype("nfs4").is_netfs());
        assert!(Fs::new().with_source("server:/export").is_netfs());
        assert!(Fs::new().with_source("//server/share").is_netfs());
        assert!(!Fs::new().with_source("/dev/sda1").is_netfs());
        assert!(Fs::new().with_fstype("zfs").is_dataset());
    }

    #[test]
    fn fstype_patterns() {
        assert!(match_fstype(Some("ext4"), None));
        assert!(match_fstype(Some("ext4"), Some("ext4,xfs")));
        assert!(!match_fstype(Some("vfat"), Some("ext4,xfs")));
        assert!(!match_fstype(Some("nfs"), Some("nonfs,ext4")));
        assert!(match_fstype(Some("ext4"), Some("nonfs,xfs")));
        assert!(!match_fstype(Some("xfs"), Some("nonfs,xfs")));
        assert!(!match_fstype(None, Some("ext4")));
    }

    #[test]
    fn options_joined() {
        let mut fs = Fs::new().with_options("rw,relatime");
        fs.user_options = Some("user=kay".into());
        assert_eq!(fs.all_options().as_deref(), Some("rw,relatime,user=kay"));
        assert!(fs.match_options(Some("user")));
        assert!(!fs.match_options(Some("ro")));
    }
}
