//! Translation of an operation outcome into a process exit code.
//!
//! The numeric values are the traditional mount(8)/umount(8) exit codes and
//! must not change.

use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use mountkit_common::{MountError, MountResult};

use super::{Action, Context};
use crate::options::{MapId, ms, user};

/// Success.
pub const SUCCESS: i32 = 0;
/// Bad invocation or insufficient permissions.
pub const USAGE: i32 = 1;
/// Out of memory, cannot fork, namespace switch failure.
pub const SYSERR: i32 = 2;
/// Internal bug.
pub const SOFTWARE: i32 = 4;
/// User interrupt.
pub const USER: i32 = 8;
/// Problem writing or locking the userspace mount table.
pub const FILEIO: i32 = 16;
/// Mount or unmount failure.
pub const FAIL: i32 = 32;
/// Mount-all: some mounts succeeded.
pub const SOMEOK: i32 = 64;

/// An exit code with an optional diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excode {
    /// Process exit code.
    pub code: i32,
    /// Human-readable diagnostic.
    pub message: Option<String>,
}

impl Excode {
    const fn new(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Whether the code reports success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == SUCCESS
    }
}

/// Error text of `errno` without the numeric suffix.
fn strerror(errno: i32) -> String {
    let text = std::io::Error::from_raw_os_error(errno).to_string();
    match text.find(" (os error") {
        Some(end) => text[..end].to_string(),
        None => text,
    }
}

/// Exit code for library errors without a dedicated entry.
fn generic(err: &MountError, message: String) -> Excode {
    let code = match -err.errno() {
        libc::EPERM | libc::EINVAL => USAGE,
        libc::ENOMEM => SYSERR,
        _ => FAIL,
    };
    Excode::with_message(code, message)
}

fn is_dir(path: &str) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_dir())
}

impl Context {
    /// Exit code and diagnostic for `result`, the return value of the last
    /// driver call, combined with the recorded syscall and helper outcome.
    ///
    /// A helper's own exit status is passed through unchanged.
    pub fn get_excode(&mut self, result: &MountResult<()>) -> Excode {
        let excode = match self.action {
            Some(Action::Umount) => self.umount_excode(result),
            _ => self.mount_excode(result),
        };
        tracing::debug!(code = excode.code, message = ?excode.message, "Exit code");
        excode
    }

    fn mount_excode(&mut self, result: &MountResult<()>) -> Excode {
        let Err(err) = result else {
            if self.is_forced_rdonly() {
                return Excode::with_message(
                    SUCCESS,
                    "WARNING: source write-protected, mounted read-only",
                );
            }
            return Excode::new(SUCCESS);
        };

        if let Some(status) = self.helper_status {
            if matches!(err, MountError::ApplyFlags { .. }) {
                return Excode::with_message(status, "WARNING: failed to apply propagation flags");
            }
            return Excode::new(status);
        }

        let src = self.source().map(String::from);
        let src_name = src.clone().unwrap_or_default();
        let tgt = self.target().map(String::from);
        let nofail = self.get_flags(MapId::Userspace) & user::NOFAIL != 0;

        match self.syscall_status {
            None => self.mount_prepare_excode(err, src.as_deref(), tgt.as_deref(), nofail),
            Some(0) => match err {
                MountError::Lock { .. } => Excode::with_message(
                    FILEIO,
                    "filesystem was mounted, but failed to update userspace mount table",
                ),
                MountError::Namespace { .. } => Excode::with_message(
                    SYSERR,
                    "filesystem was mounted, but failed to switch namespace back",
                ),
                MountError::ApplyFlags { .. } => Excode::with_message(
                    FAIL,
                    format!("filesystem was mounted, but failed to apply flags: {err}"),
                ),
                err => generic(
                    err,
                    format!("filesystem was mounted, but any subsequent operation failed: {err}"),
                ),
            },
            Some(status) => {
                self.mount_syscall_excode(-status, err, &src_name, tgt.as_deref(), nofail)
            }
        }
    }

    fn mount_prepare_excode(
        &self,
        err: &MountError,
        src: Option<&str>,
        tgt: Option<&str>,
        nofail: bool,
    ) -> Excode {
        let src_name = src.unwrap_or_default();
        let fstab = self.config.paths.fstab.display();
        let message = match err {
            MountError::PermissionDenied { .. } => "operation permitted for root only".to_string(),
            MountError::Busy { .. } => format!("{src_name} is already mounted"),
            MountError::NotInFstab { .. } => {
                if self.is_swapmatch() {
                    format!("can't find in {fstab}")
                } else if tgt.is_some() {
                    format!("can't find mount point in {fstab}")
                } else {
                    format!("can't find mount source {src_name} in {fstab}")
                }
            }
            MountError::AmbiguousFilesystem { .. } => {
                format!("more filesystems detected on {src_name}; use -t <type> or wipefs(8)")
            }
            MountError::NoFilesystemType => {
                if self.restricted {
                    "failed to determine filesystem type".to_string()
                } else {
                    "no filesystem type specified".to_string()
                }
            }
            MountError::NoSource { .. } => {
                if nofail {
                    return Excode::new(SUCCESS);
                }
                match src {
                    Some(src) => format!("can't find {src}"),
                    None => "no mount source specified".to_string(),
                }
            }
            MountError::MountOptions { message } => {
                format!("failed to parse mount options: {message}")
            }
            MountError::SourcePreparation { message } => {
                return Excode::with_message(
                    FAIL,
                    format!("failed to set up source {src_name}: {message}"),
                );
            }
            MountError::Lock { .. } => return Excode::with_message(FILEIO, "locking failed"),
            MountError::Namespace { .. } => {
                return Excode::with_message(SYSERR, "failed to switch namespace");
            }
            err => return generic(err, format!("mount failed: {err}")),
        };
        Excode::with_message(USAGE, message)
    }

    fn mount_syscall_excode(
        &mut self,
        errno: i32,
        err: &MountError,
        src: &str,
        tgt: Option<&str>,
        nofail: bool,
    ) -> Excode {
        let mflags = self.get_flags(MapId::Linux);
        let tgt_name = tgt.unwrap_or_default();
        let failed = || format!("mount(2) system call failed: {}", strerror(errno));
        let src_is_path = Path::new(src).exists();

        let message = match errno {
            libc::EPERM => {
                if self.credentials.euid == 0 {
                    if tgt.is_some_and(is_dir) {
                        "permission denied".to_string()
                    } else {
                        "mount point is not a directory".to_string()
                    }
                } else {
                    "must be superuser to use mount".to_string()
                }
            }
            libc::EBUSY => {
                if mflags & ms::REMOUNT != 0 {
                    "mount point is busy".to_string()
                } else if let Some(mounted_on) = self
                    .already_mounted_source()
                    .and_then(|fs| fs.target.clone())
                {
                    format!("{src} already mounted on {mounted_on}")
                } else {
                    format!("{src} already mounted or mount point busy")
                }
            }
            libc::ENOENT => {
                if tgt.is_some_and(|t| std::fs::symlink_metadata(t).is_err()) {
                    "mount point does not exist".to_string()
                } else if tgt.is_some_and(|t| std::fs::metadata(t).is_err()) {
                    "mount point is a symbolic link to nowhere".to_string()
                } else if !src.is_empty() && !src_is_path {
                    if nofail {
                        return Excode::new(SUCCESS);
                    }
                    format!("special device {src} does not exist")
                } else {
                    failed()
                }
            }
            libc::ENOTDIR => {
                if !tgt.is_some_and(is_dir) {
                    "mount point is not a directory".to_string()
                } else if !src.is_empty() && !src_is_path {
                    if nofail {
                        return Excode::new(SUCCESS);
                    }
                    format!("special device {src} does not exist (a path prefix is not a directory)")
                } else {
                    failed()
                }
            }
            libc::EINVAL => {
                if mflags & ms::REMOUNT != 0 {
                    "mount point not mounted or bad option".to_string()
                } else if matches!(err, MountError::ApplyFlags { .. }) {
                    "not mount point or bad option".to_string()
                } else if self.fs.is_netfs() {
                    "bad option; for several filesystems (e.g. nfs, cifs) you might need a \
                     /sbin/mount.<type> helper program"
                        .to_string()
                } else {
                    format!(
                        "wrong fs type, bad option, bad superblock on {src}, missing codepage \
                         or helper program, or other error"
                    )
                }
            }
            libc::EMFILE => "mount table full".to_string(),
            libc::EIO => format!("can't read superblock on {src}"),
            libc::ENODEV => match self.fstype() {
                Some(fstype) => format!("unknown filesystem type '{fstype}'"),
                None => "unknown filesystem type".to_string(),
            },
            libc::ENOTBLK => {
                if nofail {
                    return Excode::new(SUCCESS);
                }
                match std::fs::metadata(src) {
                    Err(_) => format!("{src} is not a block device, and stat(2) fails?"),
                    Ok(meta) if meta.file_type().is_block_device() => format!(
                        "the kernel does not recognize {src} as a block device; \
                         maybe \"modprobe driver\" is necessary"
                    ),
                    Ok(meta) if meta.is_file() => {
                        format!("{src} is not a block device; try \"-o loop\"")
                    }
                    Ok(_) => format!("{src} is not a block device"),
                }
            }
            libc::ENXIO => {
                if nofail {
                    return Excode::new(SUCCESS);
                }
                format!("{src} is not a valid block device")
            }
            libc::EACCES | libc::EROFS => {
                if mflags & ms::RDONLY != 0 {
                    format!("cannot mount {src} read-only")
                } else if self.progress.rwonly_mount {
                    format!("{src} is write-protected but explicit read-write mode requested")
                } else if mflags & ms::REMOUNT != 0 {
                    format!("cannot remount {src} read-write, is write-protected")
                } else if mflags & ms::BIND != 0 {
                    format!("bind {src} failed")
                } else {
                    failed()
                }
            }
            libc::ENOMEDIUM => {
                if nofail {
                    return Excode::new(SUCCESS);
                }
                format!("no medium found on {src}")
            }
            libc::EBADMSG if std::fs::metadata(src).is_ok_and(|meta| {
                meta.is_file() || meta.file_type().is_block_device()
            }) =>
            {
                format!("cannot mount; probably corrupted filesystem on {src}")
            }
            _ => failed(),
        };
        tracing::debug!(errno, target = tgt_name, "Mount failed");
        Excode::with_message(FAIL, message)
    }

    fn umount_excode(&self, result: &MountResult<()>) -> Excode {
        let Err(err) = result else {
            return Excode::new(SUCCESS);
        };
        if let Some(status) = self.helper_status {
            return Excode::new(status);
        }

        match self.syscall_status {
            None => match err {
                MountError::PermissionDenied { .. } if !self.progress.tab_applied => {
                    Excode::with_message(USAGE, "not mounted")
                }
                MountError::Lock { .. } => Excode::with_message(FILEIO, "locking failed"),
                MountError::Namespace { .. } => {
                    Excode::with_message(SYSERR, "failed to switch namespace")
                }
                err => generic(err, format!("umount failed: {err}")),
            },
            Some(0) => match err {
                MountError::Lock { .. } => Excode::with_message(
                    FILEIO,
                    "filesystem was unmounted, but failed to update userspace mount table",
                ),
                MountError::Namespace { .. } => Excode::with_message(
                    SYSERR,
                    "filesystem was unmounted, but failed to switch namespace back",
                ),
                err => generic(
                    err,
                    format!("filesystem was unmounted, but any subsequent operation failed: {err}"),
                ),
            },
            Some(status) => {
                let errno = -status;
                let message = match errno {
                    libc::ENXIO => "invalid block device".to_string(),
                    libc::EINVAL => "not mounted".to_string(),
                    libc::EIO => "can't write superblock".to_string(),
                    libc::EBUSY => "target is busy".to_string(),
                    libc::ENOENT => "no mount point specified".to_string(),
                    libc::EPERM => "must be superuser to unmount".to_string(),
                    libc::EACCES => "block devices are not permitted on filesystem".to_string(),
                    _ => format!("umount(2) system call failed: {}", strerror(errno)),
                };
                Excode::with_message(FAIL, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tab::Fs;
    use crate::testing::{self, Sandbox};

    fn syscall_failure(errno: i32) -> MountResult<()> {
        Err(MountError::Syscall {
            syscall: "mount".into(),
            errno,
        })
    }

    fn mount_context() -> Context {
        let mut cxt = testing::context();
        cxt.action = Some(Action::Mount);
        cxt.set_source(Some("/dev/sdb1"));
        cxt.set_target(Some("/data"));
        cxt
    }

    #[test]
    fn success_is_success_whatever_was_recorded() {
        let mut cxt = mount_context();
        cxt.set_syscall_status(-libc::EBUSY);
        cxt.set_helper_status(32);
        assert_eq!(cxt.get_excode(&Ok(())), Excode::new(SUCCESS));

        let mut cxt = mount_context();
        cxt.progress.forced_rdonly = true;
        let excode = cxt.get_excode(&Ok(()));
        assert!(excode.is_success());
        assert!(excode.message.unwrap().contains("write-protected"));
    }

    #[test]
    fn permission_denied_is_a_usage_error() {
        let mut cxt = mount_context();
        let excode = cxt.get_excode(&Err(MountError::permission("mount")));
        assert_eq!(excode.code, USAGE);
        assert_eq!(excode.message.as_deref(), Some("operation permitted for root only"));
        assert_ne!(excode.code, SYSERR);
    }

    #[test]
    fn helper_status_passes_through() {
        let mut cxt = mount_context();
        cxt.set_helper_status(17);
        let result = Err(MountError::HelperFailed {
            helper: "/sbin/mount.nfs".into(),
            status: 17,
        });
        assert_eq!(cxt.get_excode(&result), Excode::new(17));

        let mut cxt = mount_context();
        cxt.set_helper_status(0);
        let excode = cxt.get_excode(&Err(MountError::ApplyFlags {
            target: "/data".into(),
        }));
        assert_eq!(excode.code, 0);
        assert!(excode.message.unwrap().contains("propagation"));
    }

    #[test]
    fn prepare_failures() {
        let mut cxt = mount_context();
        let excode = cxt.get_excode(&Err(MountError::NotInFstab {
            spec: "/data".into(),
        }));
        assert_eq!(excode.code, USAGE);
        assert!(excode.message.unwrap().starts_with("can't find in "));

        let mut cxt = mount_context();
        cxt.behavior_mut().noswapmatch = true;
        let excode = cxt.get_excode(&Err(MountError::NotInFstab {
            spec: "/data".into(),
        }));
        assert!(excode.message.unwrap().starts_with("can't find mount point in "));

        let mut cxt = mount_context();
        let excode = cxt.get_excode(&Err(MountError::Lock {
            path: "/run/mount/utab.lock".into(),
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        }));
        assert_eq!(excode, Excode::with_message(FILEIO, "locking failed"));

        let mut cxt = mount_context();
        let excode = cxt.get_excode(&Err(MountError::Namespace {
            message: "setns".into(),
        }));
        assert_eq!(excode.code, SYSERR);

        let mut cxt = mount_context();
        let excode = cxt.get_excode(&Err(MountError::AmbiguousFilesystem {
            device: "/dev/sdb1".into(),
        }));
        assert_eq!(excode.code, USAGE);
        assert!(excode.message.unwrap().contains("wipefs"));
    }

    #[test]
    fn missing_source_respects_nofail() {
        let mut cxt = mount_context();
        let err = Err(MountError::NoSource {
            spec: "/dev/sdb1".into(),
        });
        assert_eq!(
            cxt.get_excode(&err),
            Excode::with_message(USAGE, "can't find /dev/sdb1")
        );

        cxt.set_options(Some("nofail")).unwrap();
        assert!(cxt.get_excode(&err).is_success());

        let mut cxt = mount_context();
        cxt.set_source(None);
        assert_eq!(
            cxt.get_excode(&err).message.as_deref(),
            Some("no mount source specified")
        );
    }

    #[test]
    fn restricted_missing_type() {
        let mut cxt = mount_context();
        cxt.force_restricted();
        let excode = cxt.get_excode(&Err(MountError::NoFilesystemType));
        assert_eq!(
            excode,
            Excode::with_message(USAGE, "failed to determine filesystem type")
        );
    }

    #[test]
    fn generic_fallback() {
        let mut cxt = mount_context();
        assert_eq!(cxt.get_excode(&Err(MountError::invalid("bad"))).code, USAGE);
        let io = MountError::Io(std::io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(cxt.get_excode(&Err(io)).code, SYSERR);
        let io = MountError::Io(std::io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(cxt.get_excode(&Err(io)).code, FAIL);
    }

    #[test]
    fn mounted_but_bookkeeping_failed() {
        let mut cxt = mount_context();
        cxt.set_syscall_status(0);
        let excode = cxt.get_excode(&Err(MountError::Lock {
            path: "/run/mount/utab.lock".into(),
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        }));
        assert_eq!(excode.code, FILEIO);
        assert!(excode.message.unwrap().starts_with("filesystem was mounted"));
    }

    #[test]
    fn syscall_errors() {
        let sandbox = Sandbox::new();
        let target = sandbox.mkdir("data");
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Mount);
        cxt.set_source(Some("/dev/sdb1"));
        cxt.set_target(Some(&target));

        cxt.set_syscall_status(-libc::EPERM);
        let excode = cxt.get_excode(&syscall_failure(libc::EPERM));
        assert_eq!(excode, Excode::with_message(FAIL, "permission denied"));

        cxt.set_syscall_status(-libc::ENODEV);
        cxt.set_fstype(Some("bogusfs"));
        let excode = cxt.get_excode(&syscall_failure(libc::ENODEV));
        assert_eq!(excode.message.as_deref(), Some("unknown filesystem type 'bogusfs'"));

        cxt.set_syscall_status(-libc::EIO);
        let excode = cxt.get_excode(&syscall_failure(libc::EIO));
        assert_eq!(excode.message.as_deref(), Some("can't read superblock on /dev/sdb1"));

        cxt.set_syscall_status(-libc::ENOENT);
        cxt.set_target(Some(&sandbox.path("missing")));
        let excode = cxt.get_excode(&syscall_failure(libc::ENOENT));
        assert_eq!(excode.message.as_deref(), Some("mount point does not exist"));
    }

    #[test]
    fn write_protected_sources() {
        let mut cxt = mount_context();
        cxt.set_syscall_status(-libc::EROFS);
        cxt.set_options(Some("ro")).unwrap();
        let excode = cxt.get_excode(&syscall_failure(libc::EROFS));
        assert_eq!(excode.message.as_deref(), Some("cannot mount /dev/sdb1 read-only"));

        let mut cxt = mount_context();
        cxt.set_syscall_status(-libc::EACCES);
        cxt.enable_rwonly_mount(true);
        let excode = cxt.get_excode(&syscall_failure(libc::EACCES));
        assert!(excode.message.unwrap().contains("explicit read-write"));
    }

    #[test]
    fn busy_source_names_its_mountpoint() {
        let sandbox = Sandbox::new();
        sandbox
            .tables
            .set_mountinfo([Fs::new().with_source("/dev/sdb1").with_target("/srv")]);
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Mount);
        cxt.set_source(Some("/dev/sdb1"));
        cxt.set_target(Some("/data"));
        cxt.set_syscall_status(-libc::EBUSY);
        let excode = cxt.get_excode(&syscall_failure(libc::EBUSY));
        assert_eq!(
            excode,
            Excode::with_message(FAIL, "/dev/sdb1 already mounted on /srv")
        );
    }

    #[test]
    fn umount_codes() {
        let mut cxt = testing::context();
        cxt.action = Some(Action::Umount);
        cxt.set_target(Some("/data"));
        assert!(cxt.get_excode(&Ok(())).is_success());

        let excode = cxt.get_excode(&Err(MountError::permission("umount")));
        assert_eq!(excode, Excode::with_message(USAGE, "not mounted"));

        cxt.set_syscall_status(-libc::EBUSY);
        let result = Err(MountError::Syscall {
            syscall: "umount".into(),
            errno: libc::EBUSY,
        });
        assert_eq!(
            cxt.get_excode(&result),
            Excode::with_message(FAIL, "target is busy")
        );

        cxt.reset_status();
        cxt.set_helper_status(2);
        assert_eq!(cxt.get_excode(&result), Excode::new(2));
    }

    #[test]
    fn strerror_drops_os_error_suffix() {
        assert_eq!(strerror(libc::ENOENT), "No such file or directory");
    }
}
