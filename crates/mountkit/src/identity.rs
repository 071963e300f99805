//! Caller credentials and login names.

use std::fs;
use std::path::Path;

/// Real and effective ids of the calling process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Real user id.
    pub uid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Real group id.
    pub gid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
}

impl Credentials {
    /// Credentials of the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            euid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            groups: supplementary_groups(),
        }
    }

    /// Whether the caller must be treated as unprivileged: anything but a
    /// genuine root without setuid elevation.
    #[must_use]
    pub const fn is_restricted(&self) -> bool {
        !(self.uid == 0 && self.uid == self.euid)
    }

    /// Whether the caller is a member of `gid`.
    #[must_use]
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

#[allow(unsafe_code)]
fn supplementary_groups() -> Vec<u32> {
    let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    let Ok(len) = usize::try_from(count) else {
        return Vec::new();
    };
    let mut groups: Vec<libc::gid_t> = vec![0; len];
    let count = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
    groups.truncate(usize::try_from(count).unwrap_or(0));
    groups
}

/// Login name of `uid` from the user database at `passwd`, or the numeric
/// id when there is no entry.
#[must_use]
pub fn username(uid: u32, passwd: &Path) -> String {
    let content = fs::read_to_string(passwd).unwrap_or_default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[2].parse::<u32>() == Ok(uid) {
            return parts[0].to_string();
        }
    }

    uid.to_string()
}
