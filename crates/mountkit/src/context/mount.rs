//! The mount pipeline: prepare, execute, finalize.

use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{Action, Context};
use crate::exec::{HelperRequest, MountRequest};
use crate::namespace::NsKind;
use crate::options::{Filter, MapId, ms, user};
use crate::tab::fs::match_fstype;
use crate::tab::{Direction, Fs};

/// Flags a bind mount only gets through a second, remounting call.
const BIND_SETTABLE: u64 = ms::NOSUID
    | ms::NODEV
    | ms::NOEXEC
    | ms::NOATIME
    | ms::NODIRATIME
    | ms::RELATIME
    | ms::RDONLY
    | ms::NOSYMFOLLOW;

impl Context {
    /// Prepare the context for mounting. Not needed before [`mount`].
    ///
    /// [`mount`]: Context::mount
    pub fn prepare_mount(&mut self) -> MountResult<()> {
        if self.fs.is_swaparea() {
            return Err(MountError::invalid("swap areas cannot be mounted"));
        }
        if self.source().is_none() && self.target().is_none() {
            return Err(MountError::invalid("no source or mountpoint specified"));
        }
        if self.progress.prepared {
            return Ok(());
        }
        self.action = Some(Action::Mount);
        tracing::debug!(source = ?self.source(), target = ?self.target(), "Preparing mount");

        self.in_namespace(NsKind::Target, |ctx| {
            ctx.apply_fstab()?;
            ctx.merge_flags();
            ctx.evaluate_mount_permissions()?;
            ctx.fix_opts()?;
            ctx.prepare_srcpath()?;
            ctx.require_source()?;
            ctx.guess_fstype()?;
            ctx.prepare_target()?;
            ctx.prepare_helper("mount", None)
        })?;
        self.progress.prepared = true;
        Ok(())
    }

    fn require_source(&self) -> MountResult<()> {
        if self.fs.source.is_some()
            || self.is_propagation_only()
            || self.mountflags & ms::REMOUNT != 0
        {
            return Ok(());
        }
        Err(MountError::NoSource {
            spec: self.target().unwrap_or_default().to_string(),
        })
    }

    /// Decide whether the caller may perform this mount. Root always may;
    /// anybody else needs an fstab entry that allows it.
    fn evaluate_mount_permissions(&mut self) -> MountResult<()> {
        let requested = self.user_mountflags;
        if !self.restricted {
            self.user_mountflags &= !(user::OWNER | user::GROUP);
            return Ok(());
        }
        if !self.progress.tab_applied {
            tracing::debug!("fstab not applied, user mount refused");
            return Err(MountError::permission("mount"));
        }

        // A name given by the caller is not trusted.
        if self.user_mountflags & user::USER != 0
            && self.named_value("user").is_some_and(|name| !name.is_empty())
        {
            tracing::debug!("Ignoring user=<name>");
            self.user_mountflags &= !user::USER;
        }

        if requested & (user::OWNER | user::GROUP) != 0 {
            let srcpath = match self.fs.srcpath() {
                Some(path) => Some(path.to_string()),
                None => match self.fs.source.clone() {
                    Some(spec) => self.get_cache().lock().resolve_spec(&spec),
                    None => None,
                },
            };
            let Some(srcpath) = srcpath else {
                return Err(MountError::permission("mount without source"));
            };
            if srcpath.starts_with("/dev/") {
                if let Ok(meta) = std::fs::metadata(&srcpath) {
                    let owner = requested & user::OWNER != 0 && meta.uid() == self.credentials.uid;
                    let group = requested & user::GROUP != 0 && self.credentials.in_group(meta.gid());
                    if owner || group {
                        self.user_mountflags |= user::USER;
                    }
                }
            }
        }

        if self.user_mountflags & (user::USER | user::USERS) == 0 {
            tracing::debug!("No user or users option, user mount refused");
            return Err(MountError::permission("mount"));
        }
        Ok(())
    }

    /// Bring the option list in line with the evaluated flags and plan the
    /// additional flag-changing calls.
    fn fix_opts(&mut self) -> MountResult<()> {
        if self.progress.opts_fixed {
            return Ok(());
        }
        self.progress.opts_fixed = true;

        if self.user_mountflags & user::USER != 0 {
            self.progress.saved_user = Some(self.named_value("user").unwrap_or_default());
        }
        self.sync_flags(MapId::Linux, self.mountflags);
        self.sync_flags(MapId::Userspace, self.user_mountflags);

        if self.mountflags & ms::PROPAGATION != 0 {
            self.init_propagation();
        }
        if self.mountflags & ms::BIND != 0
            && self.mountflags & BIND_SETTABLE != 0
            && self.mountflags & ms::REMOUNT == 0
        {
            self.addmounts.push(self.mountflags | ms::REMOUNT | ms::BIND);
        }

        if self.restricted && self.user_mountflags & user::USER != 0 {
            let name = self.in_namespace(NsKind::Origin, |ctx| Ok(ctx.username()))?;
            self.optlist.set_value("user", Some(name));
        }
        tracing::debug!(
            options = %self.optlist,
            addmounts = self.addmounts.len(),
            "Options fixed"
        );
        Ok(())
    }

    fn sync_flags(&mut self, map: MapId, flags: u64) {
        let listed = self.optlist.get_flags(map);
        let removed = listed & !flags;
        if removed != 0 {
            self.optlist.remove_flags(removed, map);
        }
        let added = flags & !listed;
        if added != 0 {
            self.optlist.append_flags(added, map);
        }
    }

    /// Move propagation flags out of the main call, one extra call each.
    fn init_propagation(&mut self) {
        let ids: Vec<u64> = self
            .optlist
            .iter()
            .filter(|opt| opt.map() == Some(MapId::Linux))
            .filter_map(|opt| opt.entry().map(|entry| entry.id))
            .collect();

        let mut recursive = 0_i32;
        for id in ids {
            if id & ms::REC != 0 {
                recursive += 1;
            }
            if id & ms::PROPAGATION == 0 {
                continue;
            }
            tracing::debug!(flags = format_args!("{id:#x}"), "Extra propagation call");
            self.addmounts.push(id);
            self.mountflags &= !id;
            if id & ms::REC != 0 {
                recursive -= 1;
            }
        }
        // rbind still needs MS_REC
        if recursive > 0 {
            self.mountflags |= ms::REC;
        }
    }

    /// Options for a `mount.<type>` helper.
    fn helper_optstr(&self) -> MountResult<Option<String>> {
        let mut list = self.optlist.clone();
        if self.user_mountflags & (user::USER | user::USERS) != 0 {
            let implied = [
                (ms::NOEXEC, "exec"),
                (ms::NOSUID, "suid"),
                (ms::NODEV, "dev"),
                (ms::NOSYMFOLLOW, "symfollow"),
            ];
            for (flag, name) in implied {
                if self.mountflags & flag == 0 {
                    list.append_optstr(name)?;
                }
            }
        }
        if let Some(saved) = &self.progress.saved_user {
            list.set_value("user", Some(saved.clone()).filter(|name| !name.is_empty()));
        }
        let optstr = list.to_optstr(Filter::Helpers);
        Ok((!optstr.is_empty()).then_some(optstr))
    }

    fn mount_helper_request(&self, helper: &Path) -> MountResult<HelperRequest> {
        let helper_name = helper.to_string_lossy();
        let fstype = self
            .fstype()
            .filter(|fstype| fstype.contains('.') && !helper_name.ends_with(fstype));
        let namespace = self
            .namespaces
            .handle(NsKind::Target)
            .fd()
            .map(|fd| format!("/proc/{}/fd/{}", std::process::id(), fd.as_raw_fd()));
        let optstr = self.helper_optstr()?;

        Ok(HelperRequest::new(helper)
            .arg(self.fs.srcpath().or(self.source()).unwrap_or("none"))
            .arg(self.target().unwrap_or_default())
            .flag(self.behavior.sloppy, "-s")
            .flag(self.behavior.fake, "-f")
            .flag(self.behavior.nomtab, "-n")
            .flag(self.behavior.verbose, "-v")
            .option("-o", optstr.as_deref())
            .option("-t", fstype)
            .option("-N", namespace.as_deref()))
    }

    fn mount_data(&self) -> Option<String> {
        self.mountdata.clone().or_else(|| {
            let data = self.optlist.to_optstr(Filter::FsData);
            (!data.is_empty()).then_some(data)
        })
    }

    /// Run the extra flag-changing calls. Returns the errno of the first
    /// failing call.
    fn mount_additional(&self, target: &str, flags: u64) -> Result<(), i32> {
        for &addflags in &self.addmounts {
            let request = MountRequest {
                source: "none".to_string(),
                target: target.to_string(),
                fstype: None,
                flags: addflags | (flags & ms::SILENT),
                data: None,
            };
            tracing::debug!(
                target,
                flags = format_args!("{:#x}", request.flags),
                recursive = addflags & ms::REC != 0,
                "Changing mount flags"
            );
            if let Err(err) = self.executor.mount(&request) {
                tracing::debug!(%err, "Changing mount flags failed");
                return Err(err.raw_os_error().unwrap_or(libc::EIO));
            }
        }
        Ok(())
    }

    /// One mount attempt, optionally with a type other than the prepared
    /// one. The outcome is recorded on the context.
    fn mount_once(&mut self, try_type: Option<&str>) -> MountResult<()> {
        if let Some(fstype) = try_type {
            if self.helper.is_none() {
                self.prepare_helper("mount", Some(fstype))?;
            }
        }
        let mut flags = self.mountflags;
        let target = self.require_target()?;

        if let Some(helper) = self.helper.clone() {
            let request = self.mount_helper_request(&helper)?;
            self.exec_helper(&request)?;
            if self.helper_status == Some(0)
                && !self.addmounts.is_empty()
                && self.mount_additional(&target, flags).is_err()
            {
                return Err(MountError::ApplyFlags { target });
            }
            return Ok(());
        }

        let source = self
            .fs
            .srcpath()
            .or(self.source())
            .unwrap_or("none")
            .to_string();
        let fstype = try_type.map(String::from).or_else(|| self.fs.fstype.clone());
        if try_type.is_some() {
            flags |= ms::SILENT;
        }

        if self.behavior.fake {
            tracing::debug!(source, target, ?fstype, "Fake mount");
            self.set_syscall_status(0);
        } else if self.is_propagation_only() {
            if let Err(errno) = self.mount_additional(&target, flags) {
                self.set_syscall_status(-errno);
                return Err(MountError::ApplyFlags { target });
            }
            self.set_syscall_status(0);
        } else {
            let request = MountRequest {
                source,
                target: target.clone(),
                fstype,
                flags,
                data: self.mount_data(),
            };
            if let Err(err) = self.executor.mount(&request) {
                tracing::debug!(%err, "mount(2) failed");
                self.set_syscall_status(-err.raw_os_error().unwrap_or(libc::EIO));
                return Ok(());
            }
            self.set_syscall_status(0);
            if !self.addmounts.is_empty() && self.mount_additional(&target, flags).is_err() {
                return Err(MountError::ApplyFlags { target });
            }
        }

        if let (Some(fstype), Some(update)) = (try_type, self.update.as_mut()) {
            update.set_fstype(fstype);
        }
        Ok(())
    }

    /// Try each type of a comma-separated list until one mounts.
    fn mount_by_types(&mut self, types: &str) -> MountResult<()> {
        tracing::debug!(types, "Trying filesystem type list");
        for fstype in types.split(',').filter(|t| !t.is_empty()) {
            let fstype = if fstype == "auto" {
                match self.guess_srcpath_fstype()? {
                    Some(guessed) => guessed,
                    None => continue,
                }
            } else {
                fstype.to_string()
            };
            self.mount_once(Some(&fstype))?;
            if self.is_success() || self.helper_executed() {
                break;
            }
        }
        Ok(())
    }

    /// Try the configured filesystem lists. A positive pattern is used as
    /// the list itself; a `no...` pattern filters the lists.
    fn mount_by_pattern(&mut self, pattern: Option<&str>) -> MountResult<()> {
        let negated = pattern.is_some_and(|p| p.starts_with("no"));
        if let Some(types) = pattern.filter(|_| !negated) {
            return self.mount_by_types(types);
        }

        let files = self.config.paths.filesystems.clone();
        let filesystems =
            self.in_namespace(NsKind::Origin, |_| Ok(filesystem_list(&files, pattern)))?;
        if filesystems.is_empty() {
            return Err(MountError::NoFilesystemType);
        }
        tracing::debug!(count = filesystems.len(), ?pattern, "Trying known filesystems");

        for fstype in &filesystems {
            self.mount_once(Some(fstype))?;
            if self.is_success() || self.helper_executed() {
                break;
            }
            if !matches!(self.syscall_errno(), Some(libc::EINVAL | libc::ENODEV)) {
                break;
            }
        }
        Ok(())
    }

    /// Call `mount(2)` or the helper. Not needed after [`mount`].
    ///
    /// Callable once per prepared operation; use
    /// [`reset_status`](Context::reset_status) before trying again.
    ///
    /// [`mount`]: Context::mount
    pub fn do_mount(&mut self) -> MountResult<()> {
        if !self.progress.prepared {
            return Err(MountError::invalid("mount is not prepared"));
        }
        if self.syscall_called() || self.helper_executed() {
            return Err(MountError::invalid("mount already attempted"));
        }

        self.in_namespace(NsKind::Target, |ctx| match ctx.fs.fstype.clone() {
            Some(types) if types.contains(',') => ctx.mount_by_types(&types),
            Some(_) => ctx.mount_once(None),
            None => {
                let pattern = ctx.fstype_pattern.clone();
                ctx.mount_by_pattern(pattern.as_deref())
            }
        })?;

        if !self.syscall_called() && !self.helper_executed() {
            return Err(MountError::NoFilesystemType);
        }
        self.outcome("mount")
    }

    /// The recorded outcome as a driver result.
    pub(super) fn outcome(&self, syscall: &str) -> MountResult<()> {
        if self.is_success() {
            return Ok(());
        }
        if let Some(status) = self.helper_status {
            return Err(MountError::HelperFailed {
                helper: self.helper.clone().unwrap_or_default(),
                status,
            });
        }
        match self.syscall_errno() {
            Some(errno) => Err(MountError::Syscall {
                syscall: syscall.to_string(),
                errno,
            }),
            None => Err(MountError::invalid(format!("{syscall} was not attempted"))),
        }
    }

    /// Record the mount in utab. Not needed after [`mount`].
    ///
    /// [`mount`]: Context::mount
    pub fn finalize_mount(&mut self) -> MountResult<()> {
        self.prepare_update()?;
        self.update_tabs()
    }

    /// Mount the described filesystem: prepare, call `mount(2)` or a
    /// helper, update utab.
    ///
    /// A write-protected source is retried read-only unless read-write was
    /// requested explicitly or the mount is a remount or bind.
    pub fn mount(&mut self) -> MountResult<()> {
        self.in_namespace(NsKind::Target, |ctx| {
            loop {
                let result = ctx.mount_attempt();
                if !ctx.should_retry_rdonly() {
                    if result.is_ok() {
                        tracing::info!(
                            source = ?ctx.source(),
                            target = ?ctx.target(),
                            fstype = ?ctx.fstype(),
                            "Mounted"
                        );
                    }
                    return result;
                }
                tracing::info!(source = ?ctx.source(), "Source is write-protected, mounting read-only");
                ctx.reset_status();
                ctx.mountflags |= ms::RDONLY;
                ctx.optlist.append_flags(ms::RDONLY, MapId::Linux);
                ctx.progress.forced_rdonly = true;
            }
        })
    }

    fn mount_attempt(&mut self) -> MountResult<()> {
        self.prepare_mount()?;
        self.prepare_update()?;
        self.do_mount()?;
        self.update_tabs()
    }

    fn should_retry_rdonly(&mut self) -> bool {
        let write_protected = match self.syscall_errno() {
            Some(libc::EROFS | libc::EACCES) => true,
            Some(libc::EBUSY) => self.is_source_already_rdonly(),
            _ => false,
        };
        write_protected
            && self.get_flags(MapId::Linux) & (ms::RDONLY | ms::REMOUNT | ms::BIND) == 0
            && !self.progress.rwonly_mount
    }

    /// Live table entry already mounting the source, if any.
    pub(super) fn already_mounted_source(&mut self) -> Option<Arc<Fs>> {
        let src = self.fs.srcpath()?.to_string();
        let table = self.get_mountinfo().ok()?;
        table
            .iter(Direction::Forward)
            .find(|fs| fs.target.is_some() && fs.srcpath() == Some(src.as_str()))
            .cloned()
    }

    fn is_source_already_rdonly(&mut self) -> bool {
        self.already_mounted_source()
            .and_then(|fs| fs.options.clone())
            .is_some_and(|options| options.split(',').any(|opt| opt == "ro"))
    }
}

/// Filesystem types listed in `files`, filtered by a `no...` pattern.
///
/// Later files are read only while the earlier ones are missing or end
/// with a `*` line.
fn filesystem_list(files: &[PathBuf], pattern: Option<&str>) -> Vec<String> {
    let mut list: Vec<String> = Vec::new();
    for path in files {
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        let mut more = false;
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with("nodev") {
                continue;
            }
            let Some(name) = line.split_whitespace().last() else {
                continue;
            };
            if name == "*" {
                more = true;
                continue;
            }
            if list.iter().any(|known| known == name)
                || (pattern.is_some() && !match_fstype(Some(name), pattern))
            {
                continue;
            }
            list.push(name.to_string());
        }
        if !more {
            break;
        }
    }
    list
}
