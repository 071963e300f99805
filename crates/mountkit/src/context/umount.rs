//! The unmount pipeline.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{Action, Context};
use crate::exec::{HelperRequest, MountRequest, UmountFlags};
use crate::namespace::NsKind;
use crate::options::{MapId, OptionList, ms, user};
use crate::tab::{Direction, Fs, Table};

fn is_fuse(fstype: &str) -> bool {
    matches!(fstype, "fuse" | "fuseblk") || fstype.starts_with("fuse.") || fstype.starts_with("fuseblk.")
}

impl Context {
    /// Prepare the context for unmounting. Not needed before [`umount`].
    ///
    /// [`umount`]: Context::umount
    pub fn prepare_umount(&mut self) -> MountResult<()> {
        if self.fs.is_swaparea() {
            return Err(MountError::invalid("swap areas cannot be unmounted"));
        }
        if self.source().is_none() && self.target().is_none() {
            return Err(MountError::invalid("no mountpoint specified"));
        }
        if self.progress.prepared {
            return Ok(());
        }
        self.helper = None;
        self.action = Some(Action::Umount);
        tracing::debug!(target = ?self.target(), "Preparing umount");

        self.in_namespace(NsKind::Target, |ctx| {
            ctx.lookup_umount_fs()?;
            ctx.merge_flags();
            ctx.evaluate_umount_permissions()?;
            if !ctx.behavior.nohelpers && ctx.helper.is_none() {
                ctx.helper_from_option("helper")?;
                if ctx.helper.is_none() {
                    ctx.prepare_helper("umount", None)?;
                }
            }
            Ok(())
        })?;
        self.progress.prepared = true;
        Ok(())
    }

    /// Replace the description with the live table entry for the target.
    /// Finding nothing is not an error here.
    fn lookup_umount_fs(&mut self) -> MountResult<()> {
        let target = match self.fs.target.clone() {
            Some(target) => target,
            None => self
                .fs
                .source
                .clone()
                .ok_or_else(|| MountError::invalid("no mountpoint specified"))?,
        };
        let table = if self.behavior.nocanonicalize && target.starts_with('/') {
            self.get_mountinfo_for_target(&target)?
        } else {
            self.get_mountinfo()?
        };
        if table.is_empty() {
            tracing::debug!("mountinfo empty");
            return Ok(());
        }

        let Some(found) = self.find_umount_fs(&table, &target)? else {
            tracing::debug!(target, "Not found in mountinfo");
            return Ok(());
        };
        if !Arc::ptr_eq(&found, &self.fs) {
            self.fs = found;
        }
        self.progress.tab_applied = true;
        let options = self.fs.all_options();
        self.optlist.set_optstr(options.as_deref())?;
        tracing::debug!(target = ?self.target(), source = ?self.source(), "mountinfo applied");
        Ok(())
    }

    fn find_umount_fs(&self, table: &Table, target: &str) -> MountResult<Option<Arc<Fs>>> {
        if let Some(fs) = table.find_target(target, Direction::Backward) {
            return Ok(Some(fs));
        }
        if !self.is_swapmatch() {
            return Ok(None);
        }
        // "umount /dev/sda1"
        let Some(fs) = table.find_source(target, Direction::Backward) else {
            return Ok(None);
        };
        let top = fs
            .target
            .as_deref()
            .and_then(|mountpoint| table.find_target(mountpoint, Direction::Backward))
            .ok_or_else(|| MountError::invalid("inconsistent mountinfo"))?;
        if !Arc::ptr_eq(&top, &fs) {
            return Err(MountError::invalid(format!(
                "{target}: {} is mounted over it on the same point",
                top.source.as_deref().unwrap_or("none")
            )));
        }
        Ok(Some(fs))
    }

    /// Select `umount.<value>` from a `helper=` or `uhelper=` option.
    fn helper_from_option(&mut self, name: &str) -> MountResult<()> {
        match self.named_value(name).filter(|value| !value.is_empty()) {
            Some(suffix) => {
                tracing::debug!(option = name, suffix, "Helper requested by option");
                self.prepare_helper("umount", Some(&suffix))
            }
            None => Ok(()),
        }
    }

    fn is_fuse_usermount(&self) -> bool {
        if !self.fstype().is_some_and(is_fuse) {
            return false;
        }
        self.optlist
            .get_named("user_id")
            .filter(|opt| opt.map().is_none())
            .and_then(|opt| opt.value())
            .and_then(|value| value.parse::<u32>().ok())
            .is_some_and(|uid| uid == self.credentials.uid)
    }

    /// Restricted callers may unmount what fstab lets them mount, as
    /// recorded in the live table. Root always may.
    fn evaluate_umount_permissions(&mut self) -> MountResult<()> {
        if !self.restricted {
            return Ok(());
        }
        if !self.progress.tab_applied {
            tracing::debug!(target = ?self.target(), "Not in mountinfo, user umount refused");
            return Err(MountError::permission("umount"));
        }
        if !self.behavior.nohelpers {
            self.helper_from_option("uhelper")?;
            if self.helper.is_some() {
                return Ok(());
            }
        }
        if self.is_fuse_usermount() {
            tracing::debug!("FUSE mount of the caller");
            return Ok(());
        }

        let fstab = self.get_fstab()?;
        let target = self.require_target()?;
        let source = self
            .fs
            .bindsrc
            .clone()
            .or_else(|| self.fs.source.clone())
            .unwrap_or_default();
        let Some(entry) = fstab.find_pair(&source, &target, Direction::Forward) else {
            tracing::debug!(target, "mountinfo disagrees with fstab");
            return Err(MountError::permission("umount"));
        };

        let fstab_flags = entry
            .all_options()
            .and_then(|options| OptionList::parse(&options).ok())
            .map_or(0, |list| list.get_flags(MapId::Userspace));
        if fstab_flags & user::USERS != 0 {
            return Ok(());
        }
        if fstab_flags & (user::USER | user::OWNER | user::GROUP) != 0 {
            let name = self.in_namespace(NsKind::Origin, |ctx| Ok(ctx.username()))?;
            if self.named_value("user").is_some_and(|mounted_by| mounted_by == name) {
                return Ok(());
            }
        }
        tracing::debug!(target, "User umount refused");
        Err(MountError::permission("umount"))
    }

    fn umount_helper_request(&self, helper: &Path) -> MountResult<HelperRequest> {
        let helper_name = helper.to_string_lossy();
        let fstype = self
            .fstype()
            .filter(|fstype| fstype.contains('.') && !helper_name.ends_with(fstype));
        let namespace = self
            .namespaces
            .handle(NsKind::Target)
            .fd()
            .map(|fd| format!("/proc/{}/fd/{}", std::process::id(), fd.as_raw_fd()));

        Ok(HelperRequest::new(helper)
            .arg(self.require_target()?)
            .flag(self.behavior.nomtab, "-n")
            .flag(self.behavior.lazy, "-l")
            .flag(self.behavior.force, "-f")
            .flag(self.behavior.verbose, "-v")
            .flag(self.behavior.rdonly_umount, "-r")
            .option("-t", fstype)
            .option("-N", namespace.as_deref()))
    }

    fn umount_once(&mut self) -> MountResult<()> {
        if let Some(helper) = self.helper.clone() {
            let request = self.umount_helper_request(&helper)?;
            return self.exec_helper(&request);
        }

        let target = self.require_target()?;
        let flags = UmountFlags {
            lazy: self.behavior.lazy,
            force: self.behavior.force,
        };
        if self.behavior.fake {
            tracing::debug!(target, ?flags, "Fake umount");
            self.set_syscall_status(0);
            return Ok(());
        }

        let Err(err) = self.executor.umount(&target, flags) else {
            self.set_syscall_status(0);
            return Ok(());
        };
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        tracing::debug!(target, %err, "umount(2) failed");
        self.set_syscall_status(-errno);

        if errno == libc::EBUSY && self.behavior.rdonly_umount {
            if let Some(source) = self.fs.srcpath().map(String::from) {
                self.remount_rdonly(source, target)?;
            }
        }
        Ok(())
    }

    fn remount_rdonly(&mut self, source: String, target: String) -> MountResult<()> {
        let flags = ms::REMOUNT | ms::RDONLY;
        self.mountflags |= flags;
        self.optlist.append_flags(flags, MapId::Linux);
        tracing::debug!(target, "Target busy, remounting read-only");

        let request = MountRequest {
            source,
            target,
            fstype: None,
            flags,
            data: None,
        };
        if let Err(err) = self.executor.mount(&request) {
            tracing::debug!(%err, "Read-only remount failed");
            self.set_syscall_status(-err.raw_os_error().unwrap_or(libc::EIO));
            return Ok(());
        }
        self.set_syscall_status(0);
        tracing::info!(target = request.target, "Remounted read-only");

        if self.update.take().is_some() {
            self.prepare_update()?;
        }
        Ok(())
    }

    /// Call `umount(2)` or the helper. Not needed after [`umount`].
    ///
    /// [`umount`]: Context::umount
    pub fn do_umount(&mut self) -> MountResult<()> {
        if !self.progress.prepared {
            return Err(MountError::invalid("umount is not prepared"));
        }
        if self.syscall_called() || self.helper_executed() {
            return Err(MountError::invalid("umount already attempted"));
        }
        self.in_namespace(NsKind::Target, Self::umount_once)?;
        self.outcome("umount")
    }

    /// Remove the utab entry. Not needed after [`umount`].
    ///
    /// [`umount`]: Context::umount
    pub fn finalize_umount(&mut self) -> MountResult<()> {
        self.prepare_update()?;
        self.update_tabs()
    }

    /// Unmount the described filesystem: look it up, check permissions,
    /// call `umount(2)` or a helper, update utab.
    pub fn umount(&mut self) -> MountResult<()> {
        self.in_namespace(NsKind::Target, |ctx| {
            ctx.prepare_umount()?;
            ctx.prepare_update()?;
            ctx.do_umount()?;
            ctx.update_tabs()?;
            tracing::info!(target = ?ctx.target(), "Unmounted");
            Ok(())
        })
    }
}
