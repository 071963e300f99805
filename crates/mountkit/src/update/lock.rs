#![allow(unsafe_code)]
//! Exclusive lock guarding the userspace mount table.
//!
//! The lock is an `flock(2)` on `<table>.lock`. While it is held, all
//! signals except `SIGTRAP` and `SIGALRM` are blocked so that the table is
//! never abandoned half-written.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use mountkit_common::{MountError, MountResult};
use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;

/// Lock file permissions.
const LOCK_MODE: u32 = 0o600;

/// A cooperative, signal-safe exclusive lock.
pub struct Lock {
    lockfile: PathBuf,
    block_signals: bool,
    file: Option<File>,
    saved_mask: Option<libc::sigset_t>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("lockfile", &self.lockfile)
            .field("block_signals", &self.block_signals)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Lock {
    /// Create a lock for `datafile`; the lock file is `<datafile>.lock`.
    #[must_use]
    pub fn new(datafile: &Path) -> Self {
        Self::with_lockfile(mountkit_common::paths::sibling(datafile, "lock"))
    }

    /// Create a lock on an explicit lock file.
    #[must_use]
    pub fn with_lockfile(lockfile: impl Into<PathBuf>) -> Self {
        Self {
            lockfile: lockfile.into(),
            block_signals: true,
            file: None,
            saved_mask: None,
        }
    }

    /// Whether to block signals while locked (default: yes).
    ///
    /// A caller that disables blocking is responsible for removing a stale
    /// lock file after an interruption.
    pub fn block_signals(&mut self, enable: bool) {
        self.block_signals = enable;
    }

    /// Path of the lock file.
    #[must_use]
    pub fn lockfile(&self) -> &Path {
        &self.lockfile
    }

    /// Whether the lock is held.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    fn lock_error(&self, source: std::io::Error) -> MountError {
        MountError::Lock {
            path: self.lockfile.clone(),
            source,
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&mut self) -> MountResult<()> {
        if self.is_locked() {
            return Ok(());
        }
        tracing::debug!(lockfile = %self.lockfile.display(), "Locking");

        if self.block_signals {
            self.saved_mask = Some(block_signals()?);
        }
        match self.acquire() {
            Ok(file) => {
                self.file = Some(file);
                Ok(())
            }
            Err(err) => {
                self.restore_signals();
                Err(err)
            }
        }
    }

    fn acquire(&self) -> MountResult<File> {
        if let Some(dir) = self.lockfile.parent() {
            std::fs::create_dir_all(dir).map_err(|e| self.lock_error(e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_MODE)
            .open(&self.lockfile)
            .map_err(|e| self.lock_error(e))?;

        let metadata = file.metadata().map_err(|e| self.lock_error(e))?;
        if metadata.permissions().mode() & 0o7777 != LOCK_MODE {
            file.set_permissions(std::fs::Permissions::from_mode(LOCK_MODE))
                .map_err(|e| self.lock_error(e))?;
        }

        loop {
            match flock(&file, FlockOperation::LockExclusive) {
                Ok(()) => return Ok(file),
                Err(Errno::INTR | Errno::AGAIN) => continue,
                Err(errno) => return Err(self.lock_error(errno.into())),
            }
        }
    }

    /// Release the lock and restore the signal mask.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            tracing::debug!(lockfile = %self.lockfile.display(), "Unlocking");
            // Closing the descriptor drops the flock.
            drop(file);
        }
        self.restore_signals();
    }

    fn restore_signals(&mut self) {
        if let Some(mask) = self.saved_mask.take() {
            unsafe {
                libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
            }
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Block everything but the timer/trap signals, returning the old mask.
fn block_signals() -> MountResult<libc::sigset_t> {
    unsafe {
        let mut blocked: libc::sigset_t = std::mem::zeroed();
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut blocked);
        libc::sigdelset(&mut blocked, libc::SIGTRAP);
        libc::sigdelset(&mut blocked, libc::SIGALRM);
        if libc::sigprocmask(libc::SIG_BLOCK, &blocked, &mut old) != 0 {
            return Err(MountError::Io(std::io::Error::last_os_error()));
        }
        Ok(old)
    }
}
