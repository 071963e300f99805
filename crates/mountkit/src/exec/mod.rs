//! Mount execution: the kernel call wrappers and external helpers.

pub mod helper;

use std::fmt;
use std::io;

pub use helper::{HelperRequest, HelperRunner, ProcessRunner, find_helper};

/// Final arguments of one `mount(2)` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountRequest {
    /// Source; `"none"` when the filesystem has none.
    pub source: String,
    /// Mountpoint.
    pub target: String,
    /// Filesystem type, if any.
    pub fstype: Option<String>,
    /// Kernel mount flags.
    pub flags: u64,
    /// Filesystem-specific data string.
    pub data: Option<String>,
}

/// `umount2(2)` behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UmountFlags {
    /// Detach now, clean up when no longer busy.
    pub lazy: bool,
    /// Force the unmount (network filesystems).
    pub force: bool,
}

/// Performs privileged mount and unmount calls.
///
/// The engine records whatever outcome is returned; an error's raw OS code
/// becomes the syscall status.
pub trait MountExecutor: Send + Sync + fmt::Debug {
    /// Mount according to `request`.
    fn mount(&self, request: &MountRequest) -> io::Result<()>;

    /// Unmount `target`.
    fn umount(&self, target: &str, flags: UmountFlags) -> io::Result<()>;
}

/// Calls into the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelExecutor;

#[cfg(target_os = "linux")]
mod kernel {
    use std::ffi::CString;
    use std::io;

    use rustix::mount::{MountFlags, UnmountFlags, mount, unmount};

    use super::{KernelExecutor, MountExecutor, MountRequest, UmountFlags};

    impl MountExecutor for KernelExecutor {
        fn mount(&self, request: &MountRequest) -> io::Result<()> {
            let bits = u32::try_from(request.flags)
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            let data = request
                .data
                .as_deref()
                .map(CString::new)
                .transpose()
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

            tracing::debug!(
                source = %request.source,
                target = %request.target,
                fstype = ?request.fstype,
                flags = format_args!("{:#x}", request.flags),
                data = ?request.data,
                "mount(2)"
            );
            mount(
                request.source.as_str(),
                request.target.as_str(),
                request.fstype.as_deref().unwrap_or(""),
                MountFlags::from_bits_retain(bits),
                data.as_deref(),
            )
            .map_err(io::Error::from)
        }

        fn umount(&self, target: &str, flags: UmountFlags) -> io::Result<()> {
            let mut umount_flags = UnmountFlags::empty();
            if flags.lazy {
                umount_flags |= UnmountFlags::DETACH;
            }
            if flags.force {
                umount_flags |= UnmountFlags::FORCE;
            }
            tracing::debug!(target, ?flags, "umount2(2)");
            unmount(target, umount_flags).map_err(io::Error::from)
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl MountExecutor for KernelExecutor {
    fn mount(&self, _request: &MountRequest) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn umount(&self, _target: &str, _flags: UmountFlags) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let request = MountRequest::default();
        assert!(request.fstype.is_none());
        assert_eq!(request.flags, 0);
        assert_eq!(UmountFlags::default(), UmountFlags { lazy: false, force: false });
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kernel_rejects_interior_nul() {
        let request = MountRequest {
            source: "bad\0source".into(),
            target: "/mnt".into(),
            ..MountRequest::default()
        };
        let err = KernelExecutor.mount(&request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kernel_rejects_flags_beyond_mount_bits() {
        let request = MountRequest {
            source: "/dev/sdb1".into(),
            target: "/mnt".into(),
            flags: 1 << 40,
            ..MountRequest::default()
        };
        let err = KernelExecutor.mount(&request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
