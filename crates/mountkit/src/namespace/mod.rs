#![allow(unsafe_code)]
//! Mount namespace handles.
//!
//! A handle is an open `nsfs` file (e.g. `/proc/<pid>/ns/mnt`) plus the
//! path cache valid inside that namespace.

mod manager;

pub use manager::NamespaceManager;

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{Cache, SharedCache};

/// Namespace file of the calling process.
pub const SELF_MNT_NS: &str = "/proc/self/ns/mnt";

/// Which of the two tracked namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    /// The namespace the process started in.
    Origin,
    /// The namespace the operation should happen in.
    Target,
}

/// Enters a mount namespace.
pub trait NsSwitcher: Send + Sync + fmt::Debug {
    /// Move the calling thread into the namespace referred to by `ns`.
    fn enter(&self, ns: BorrowedFd<'_>) -> io::Result<()>;
}

/// Enters namespaces with `setns(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetnsSwitcher;

impl NsSwitcher for SetnsSwitcher {
    #[cfg(target_os = "linux")]
    fn enter(&self, ns: BorrowedFd<'_>) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        if unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNS) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn enter(&self, _ns: BorrowedFd<'_>) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// An optional open namespace plus its cache.
#[derive(Debug, Default)]
pub struct NsHandle {
    fd: Option<OwnedFd>,
    path: Option<PathBuf>,
    cache: Option<SharedCache>,
}

impl NsHandle {
    /// Open the namespace file at `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self {
            fd: Some(OwnedFd::from(file)),
            path: Some(path.to_path_buf()),
            cache: None,
        })
    }

    /// Whether a namespace is open.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.fd.is_some()
    }

    /// Path the namespace was opened from.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Borrow the namespace descriptor.
    #[must_use]
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    /// The cache of this namespace, created on first use.
    pub fn cache(&mut self, tag_dir: &Path) -> SharedCache {
        Arc::clone(
            self.cache
                .get_or_insert_with(|| Cache::new(tag_dir).shared()),
        )
    }

    /// Replace the cache.
    pub fn set_cache(&mut self, cache: Option<SharedCache>) {
        self.cache = cache;
    }

    /// Duplicate the descriptor; the cache is shared.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.as_ref().map(OwnedFd::try_clone).transpose()?,
            path: self.path.clone(),
            cache: self.cache.clone(),
        })
    }
}
