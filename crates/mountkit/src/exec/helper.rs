//! External `mount.<type>` / `umount.<type>` helpers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use mountkit_common::{MountError, MountResult};

/// Command line of one helper invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperRequest {
    /// Absolute helper path.
    pub helper: PathBuf,
    /// Arguments, not including the program name.
    pub args: Vec<String>,
}

impl HelperRequest {
    /// Start a command line for `helper`.
    #[must_use]
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `arg` when `enabled`.
    #[must_use]
    pub fn flag(self, enabled: bool, arg: &str) -> Self {
        if enabled { self.arg(arg) } else { self }
    }

    /// Append `option value` when `value` is set.
    #[must_use]
    pub fn option(self, option: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.arg(option).arg(value),
            None => self,
        }
    }
}

impl fmt::Display for HelperRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.helper.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs helpers and reports their exit status.
pub trait HelperRunner: Send + Sync + fmt::Debug {
    /// Run `request` to completion. The status is the exit code, or `-1`
    /// when the helper was killed by a signal.
    fn run(&self, request: &HelperRequest) -> MountResult<i32>;
}

/// Spawns helpers as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl HelperRunner for ProcessRunner {
    fn run(&self, request: &HelperRequest) -> MountResult<i32> {
        tracing::debug!(command = %request, "Executing helper");
        let status = Command::new(&request.helper)
            .args(&request.args)
            .status()
            .map_err(|e| MountError::Helper {
                helper: request.helper.clone(),
                message: e.to_string(),
            })?;

        let code = status.code().unwrap_or(-1);
        tracing::debug!(helper = %request.helper.display(), code, "Helper finished");
        Ok(code)
    }
}

/// Find `<name>.<fstype>` in `dirs`; a dotted type falls back to its
/// primary part (`fuse.sshfs` tries `mount.fuse.sshfs`, then `mount.fuse`).
pub fn find_helper<'a>(
    dirs: impl IntoIterator<Item = &'a Path>,
    name: &str,
    fstype: &str,
) -> Option<PathBuf> {
    for dir in dirs {
        let mut candidate_type = fstype;
        loop {
            let path = dir.join(format!("{name}.{candidate_type}"));
            match std::fs::metadata(&path) {
                Ok(_) => {
                    tracing::debug!(helper = %path.display(), "Found helper");
                    return Some(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    match candidate_type.rsplit_once('.') {
                        Some((primary, _)) => candidate_type = primary,
                        None => break,
                    }
                }
                Err(_) => break,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn builds_command_line() {
        let request = HelperRequest::new("/sbin/mount.nfs")
            .arg("srv:/export")
            .arg("/mnt")
            .flag(true, "-n")
            .flag(false, "-v")
            .option("-o", Some("ro"))
            .option("-t", None);
        assert_eq!(request.to_string(), "/sbin/mount.nfs srv:/export /mnt -n -o ro");
    }

    #[test]
    fn finds_helper_with_subtype_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let fuse = script(dir.path(), "mount.fuse", "exit 0");
        let nfs = script(dir.path(), "mount.nfs", "exit 0");
        let dirs = [Path::new("/nonexistent"), dir.path()];

        assert_eq!(find_helper(dirs, "mount", "nfs"), Some(nfs));
        assert_eq!(find_helper(dirs, "mount", "fuse.sshfs"), Some(fuse));
        assert_eq!(find_helper(dirs, "mount", "ext4"), None);
        assert_eq!(find_helper(dirs, "umount", "nfs"), None);
    }

    #[test]
    fn runner_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let ok = script(dir.path(), "ok", "exit 0");
        let fail = script(dir.path(), "fail", "exit 32");
        let killed = script(dir.path(), "killed", "kill -9 $$");

        assert_eq!(ProcessRunner.run(&HelperRequest::new(ok)).unwrap(), 0);
        assert_eq!(ProcessRunner.run(&HelperRequest::new(fail)).unwrap(), 32);
        assert_eq!(ProcessRunner.run(&HelperRequest::new(killed)).unwrap(), -1);
        assert!(matches!(
            ProcessRunner.run(&HelperRequest::new(dir.path().join("missing"))),
            Err(MountError::Helper { .. })
        ));
    }
}
