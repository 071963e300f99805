//! Common error types for the mountkit engine.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`MountError`].
pub type MountResult<T> = Result<T, MountError>;

/// Errors raised while preparing, executing or recording a mount operation.
///
/// A failed `mount(2)`/`umount(2)` call or a failed helper is recorded on the
/// context first; only the top-level drivers report it as [`Syscall`] or
/// [`HelperFailed`].
///
/// [`Syscall`]: MountError::Syscall
/// [`HelperFailed`]: MountError::HelperFailed
#[derive(Error, Diagnostic, Debug)]
pub enum MountError {
    /// Invalid argument or context state.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(mountkit::invalid))]
    Invalid {
        /// What was wrong.
        message: String,
    },

    /// No matching entry in fstab or in the live mount table.
    #[error("can't find {spec} in fstab")]
    #[diagnostic(
        code(mountkit::lookup::not_found),
        help("Specify both the source and the target, or add an entry to fstab")
    )]
    NotInFstab {
        /// The source or target that was looked up.
        spec: String,
    },

    /// Source (device tag or path) cannot be resolved.
    #[error("can't find {spec}")]
    #[diagnostic(code(mountkit::resolve::no_source))]
    NoSource {
        /// The unresolved source.
        spec: String,
    },

    /// More than one filesystem signature on the source.
    #[error("more filesystems detected on {device}")]
    #[diagnostic(
        code(mountkit::resolve::ambiguous),
        help("Use -t <type> or wipefs(8)")
    )]
    AmbiguousFilesystem {
        /// The probed device.
        device: String,
    },

    /// The auto-detected filesystem type is not allowed.
    #[error("filesystem type {fstype} is not allowed by {allowed}")]
    #[diagnostic(code(mountkit::resolve::disallowed))]
    DisallowedFilesystem {
        /// The detected type.
        fstype: String,
        /// The allow-list pattern.
        allowed: String,
    },

    /// Filesystem type not specified and impossible to detect.
    #[error("filesystem type not specified")]
    #[diagnostic(code(mountkit::resolve::no_fstype), help("Use -t <type>"))]
    NoFilesystemType,

    /// Malformed or conflicting mount options.
    #[error("failed to parse mount options: {message}")]
    #[diagnostic(code(mountkit::options))]
    MountOptions {
        /// The error message.
        message: String,
    },

    /// Failed to open or enter a mount namespace.
    #[error("failed to switch namespace: {message}")]
    #[diagnostic(code(mountkit::namespace))]
    Namespace {
        /// The error message.
        message: String,
    },

    /// Failed to lock the userspace mount table.
    #[error("locking failed: {path}: {source}")]
    #[diagnostic(code(mountkit::lock))]
    Lock {
        /// The lock file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(mountkit::permission_denied),
        help("The operation is permitted for root only, or needs a user/users entry in fstab")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Target already mounted or busy.
    #[error("{target} is already mounted")]
    #[diagnostic(code(mountkit::busy))]
    Busy {
        /// The busy target.
        target: String,
    },

    /// Source preparation (loop device, verity device, ...) failed.
    #[error("failed to prepare source: {message}")]
    #[diagnostic(code(mountkit::source_preparation))]
    SourcePreparation {
        /// The error message.
        message: String,
    },

    /// Failed to execute an external helper.
    #[error("failed to execute {}: {message}", .helper.display())]
    #[diagnostic(code(mountkit::helper))]
    Helper {
        /// The helper path.
        helper: PathBuf,
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(mountkit::unsupported),
        help("Mount namespaces and the mount syscalls require Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(mountkit::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// The mount or umount system call failed; the errno is also recorded
    /// on the context.
    #[error("{syscall}(2) system call failed: {}", strerror(.errno))]
    #[diagnostic(code(mountkit::syscall))]
    Syscall {
        /// Name of the system call.
        syscall: String,
        /// Positive errno.
        errno: i32,
    },

    /// An external helper ran and exited with a non-zero status.
    #[error("{} exited with status {status}", .helper.display())]
    #[diagnostic(code(mountkit::helper::status))]
    HelperFailed {
        /// The helper path.
        helper: PathBuf,
        /// The helper exit status.
        status: i32,
    },

    /// The mount succeeded but propagation flags could not be applied.
    #[error("failed to apply propagation flags on {target}")]
    #[diagnostic(code(mountkit::propagation))]
    ApplyFlags {
        /// The mountpoint.
        target: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(mountkit::io))]
    Io(#[from] std::io::Error),
}

fn strerror(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

impl MountError {
    /// Shorthand for [`MountError::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Shorthand for [`MountError::PermissionDenied`].
    pub fn permission(operation: impl Into<String>) -> Self {
        Self::PermissionDenied {
            operation: operation.into(),
        }
    }

    /// Raw OS error code carried by an I/O error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) | Self::Lock { source: err, .. } => err.raw_os_error(),
            Self::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// The equivalent negative errno.
    #[must_use]
    pub fn errno(&self) -> i32 {
        let errno = match self {
            Self::Io(err) | Self::Lock { source: err, .. } => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::Syscall { errno, .. } => *errno,
            Self::PermissionDenied { .. } => libc::EPERM,
            Self::Busy { .. } => libc::EBUSY,
            Self::Unsupported { .. } => libc::ENOSYS,
            Self::NotInFstab { .. } | Self::NoSource { .. } => libc::ENOENT,
            _ => libc::EINVAL,
        };
        -errno
    }
}
