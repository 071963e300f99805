//! Userspace mount table bookkeeping.

use mountkit_common::MountResult;

use super::{Action, Context};
use crate::events::{self, MountEvent};
use crate::namespace::NsKind;
use crate::options::{Filter, MapId, ms};
use crate::tab::Fs;
use crate::update::{Change, Lock, Update};

impl Context {
    fn utab_is_writable(&mut self) -> bool {
        if !self.progress.tabpaths_checked {
            self.progress.utab_writable = self.config.utab_writable();
            self.progress.tabpaths_checked = true;
        }
        self.progress.utab_writable
    }

    /// The mount as recorded in utab: userspace options only.
    fn utab_entry(&self) -> Fs {
        let mut fs = Fs::clone(&self.fs);
        let user_options = self.optlist.to_optstr(Filter::Utab);
        fs.user_options = (!user_options.is_empty()).then_some(user_options);
        fs.options = None;
        if self.get_flags(MapId::Linux) & ms::BIND != 0 {
            fs.bindsrc.clone_from(&fs.source);
        }
        fs
    }

    /// Stage the utab change for this operation.
    ///
    /// Returns `false` when nothing has to be recorded.
    pub fn prepare_update(&mut self) -> MountResult<bool> {
        if self.is_propagation_only() {
            return Ok(false);
        }
        if self.action == Some(Action::Umount) && self.target() == Some("/") {
            tracing::debug!("Unmounting root, utab not updated");
            self.behavior.nomtab = true;
        }
        if self.behavior.nomtab || !self.utab_is_writable() {
            return Ok(false);
        }
        if self.syscall_status.is_some_and(|status| status != 0) {
            return Ok(false);
        }

        let utab = self.config.paths.utab.clone();
        if self.action == Some(Action::Umount)
            && std::fs::metadata(&utab).map_or(true, |meta| meta.len() == 0)
        {
            return Ok(false);
        }

        let mountflags = self.get_flags(MapId::Linux);
        let staged = match self.action {
            // A read-only remount fallback is recorded as a remount.
            Some(Action::Umount) if mountflags & ms::REMOUNT == 0 => {
                let target = self.require_target()?;
                let update = self.update.get_or_insert_with(|| Update::new(&utab));
                update.set_fs(mountflags, Some(&target), None)?
            }
            _ => {
                let entry = self.utab_entry();
                let update = self.update.get_or_insert_with(|| Update::new(&utab));
                update.set_fs(mountflags, None, Some(&entry))?
            }
        };
        Ok(staged)
    }

    /// Write the staged change under the utab lock and announce it.
    pub fn update_tabs(&mut self) -> MountResult<()> {
        if self.behavior.nomtab {
            return Ok(());
        }
        let Some(update) = self.update.take().filter(Update::is_ready) else {
            return Ok(());
        };

        let helper_ok = self.helper_status == Some(0);
        if self.helper.is_some() && helper_ok && self.utab_is_writable() {
            if update.already_done()? {
                tracing::debug!("Helper already updated utab");
                self.emit_event(&update);
                return Ok(());
            }
        } else if self.helper.is_some() {
            tracing::debug!("Helper is responsible for utab");
            return Ok(());
        }
        if self.syscall_status != Some(0) && !helper_ok {
            tracing::debug!(status = ?self.syscall_status, "Operation failed, utab not updated");
            return Ok(());
        }

        let mut lock = Lock::new(update.path());
        lock.block_signals(self.config.block_signals);
        let result = self.in_namespace(NsKind::Target, |ctx| {
            let lock = ctx.lock.insert(lock);
            lock.lock()?;
            let committed = update.commit(lock);
            lock.unlock();
            committed
        });
        self.lock = None;
        result?;

        self.emit_event(&update);
        Ok(())
    }

    fn emit_event(&self, update: &Update) {
        if self.progress.helper_mode {
            return;
        }
        let timestamp = events::now();
        let event = match update.change() {
            Some(Change::Add(fs)) => MountEvent::Mounted {
                source: fs.source.clone(),
                target: fs.target.clone().unwrap_or_default(),
                timestamp,
            },
            Some(Change::Remove { target }) => MountEvent::Unmounted {
                target: target.clone(),
                timestamp,
            },
            Some(Change::Remount { target, .. }) => MountEvent::Remounted {
                target: target.clone(),
                timestamp,
            },
            Some(Change::Move { from, to }) => MountEvent::Moved {
                from: from.clone(),
                target: to.clone(),
                timestamp,
            },
            None => return,
        };
        events::touch_event_file(&self.config.paths.utab_event());
        self.events.publish(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tab::parse::parse_utab;
    use crate::tab::Direction;
    use crate::testing::{self, Sandbox};

    fn utab(sandbox: &Sandbox) -> crate::tab::Table {
        let text = std::fs::read_to_string(sandbox.root.join("run/mount/utab")).unwrap_or_default();
        parse_utab(&text)
    }

    fn mount_context(sandbox: &Sandbox) -> Context {
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Mount);
        cxt.set_source(Some("/dev/sdb1"));
        cxt.set_target(Some("/data"));
        cxt.set_options(Some("ro,x-gvfs-show,noauto")).unwrap();
        cxt.merge_flags();
        cxt
    }

    #[test]
    fn umount_of_root_forces_nomtab() {
        let sandbox = Sandbox::new();
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Umount);
        cxt.set_target(Some("/"));
        assert!(!cxt.behavior().nomtab);
        assert!(!cxt.prepare_update().unwrap());
        assert!(cxt.behavior().nomtab);
    }

    #[test]
    fn failed_syscall_stages_nothing() {
        let sandbox = Sandbox::new();
        let mut cxt = mount_context(&sandbox);
        cxt.set_syscall_status(-libc::EINVAL);
        assert!(!cxt.prepare_update().unwrap());
    }

    #[test]
    fn mount_is_recorded_and_announced() {
        let sandbox = Sandbox::new();
        let mut cxt = mount_context(&sandbox);
        let events = cxt.events().subscribe();

        assert!(cxt.prepare_update().unwrap());
        cxt.set_syscall_status(0);
        cxt.update_tabs().unwrap();

        let table = utab(&sandbox);
        let entry = table.find_target("/data", Direction::Backward).unwrap();
        assert_eq!(entry.user_options.as_deref(), Some("x-gvfs-show"));
        assert!(sandbox.root.join("run/mount/utab.event").exists());
        assert!(matches!(
            events.try_recv().unwrap(),
            MountEvent::Mounted { ref target, .. } if target == "/data"
        ));
        assert!(cxt.lock.is_none() && cxt.update.is_none());
    }

    #[test]
    fn nothing_to_record_without_user_options() {
        let sandbox = Sandbox::new();
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Mount);
        cxt.set_source(Some("/dev/sdb1"));
        cxt.set_target(Some("/data"));
        cxt.set_options(Some("ro")).unwrap();
        assert!(!cxt.prepare_update().unwrap());
    }

    #[test]
    fn failed_operation_is_not_written() {
        let sandbox = Sandbox::new();
        let mut cxt = mount_context(&sandbox);
        cxt.prepare_update().unwrap();
        cxt.set_syscall_status(-libc::EBUSY);
        cxt.update_tabs().unwrap();
        assert!(utab(&sandbox).is_empty());
    }

    #[test]
    fn helper_runs_own_bookkeeping() {
        let sandbox = Sandbox::new();
        let mut cxt = mount_context(&sandbox);
        cxt.helper = Some("/sbin/mount.nfs".into());
        cxt.prepare_update().unwrap();
        // helper not executed: it owns the table
        cxt.update_tabs().unwrap();
        assert!(utab(&sandbox).is_empty());

        let mut cxt = mount_context(&sandbox);
        cxt.helper = Some("/sbin/mount.nfs".into());
        cxt.prepare_update().unwrap();
        cxt.set_helper_status(0);
        cxt.update_tabs().unwrap();
        assert_eq!(utab(&sandbox).len(), 1);
    }

    #[test]
    fn umount_removes_entry() {
        let sandbox = Sandbox::new();
        let mut cxt = mount_context(&sandbox);
        cxt.prepare_update().unwrap();
        cxt.set_syscall_status(0);
        cxt.update_tabs().unwrap();

        let mut cxt = sandbox.context();
        let events = cxt.events().subscribe();
        cxt.action = Some(Action::Umount);
        cxt.set_target(Some("/data"));
        assert!(cxt.prepare_update().unwrap());
        cxt.set_syscall_status(0);
        cxt.update_tabs().unwrap();
        assert!(utab(&sandbox).is_empty());
        assert!(matches!(events.try_recv().unwrap(), MountEvent::Unmounted { .. }));
    }

    #[test]
    fn umount_without_utab_stages_nothing() {
        let sandbox = Sandbox::new();
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Umount);
        cxt.set_target(Some("/data"));
        assert!(!cxt.prepare_update().unwrap());
    }

    #[test]
    fn helper_mode_is_silent() {
        let sandbox = Sandbox::new();
        let mut cxt = mount_context(&sandbox);
        cxt.init_helper(Action::Mount);
        let events = cxt.events().subscribe();
        cxt.prepare_update().unwrap();
        cxt.set_syscall_status(0);
        cxt.update_tabs().unwrap();
        assert_eq!(utab(&sandbox).len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn nomtab_skips_everything() {
        let mut cxt = testing::context();
        cxt.action = Some(Action::Mount);
        cxt.set_target(Some("/data"));
        cxt.set_options(Some("x-foo")).unwrap();
        assert!(!cxt.prepare_update().unwrap());
        cxt.update_tabs().unwrap();
    }
}
