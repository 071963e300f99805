//! Option handling and application of fstab or live table entries.

use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{Action, Context, OptsMode};
use crate::options::{MapId, ms};
use crate::tab::{Direction, Fs, Table};

impl Context {
    /// Replace the option string. Flag-generated options are kept.
    pub fn set_options(&mut self, optstr: Option<&str>) -> MountResult<()> {
        self.optlist.set_optstr(optstr)
    }

    /// Append options; later options win.
    pub fn append_options(&mut self, optstr: &str) -> MountResult<()> {
        self.optlist.append_optstr(optstr)
    }

    /// Prepend options.
    pub fn prepend_options(&mut self, optstr: &str) -> MountResult<()> {
        self.optlist.prepend_optstr(optstr)
    }

    /// Replace the flag-generated options of `map` with `flags`.
    pub fn set_flags(&mut self, flags: u64, map: MapId) {
        self.optlist.set_flags(flags, map);
    }

    /// Flags of `map`; the frozen values once merged.
    #[must_use]
    pub fn get_flags(&self, map: MapId) -> u64 {
        match (map, self.progress.flags_merged) {
            (MapId::Linux, true) => self.mountflags,
            (MapId::Userspace, true) => self.user_mountflags,
            (map, false) => self.optlist.get_flags(map),
        }
    }

    /// Freeze kernel and userspace flags. Idempotent until the next reset.
    pub fn merge_flags(&mut self) {
        if self.progress.flags_merged {
            return;
        }
        self.mountflags = self.optlist.kernel_flags();
        self.user_mountflags = self.optlist.get_flags(MapId::Userspace);
        self.progress.flags_merged = true;
        tracing::debug!(
            mountflags = format_args!("{:#x}", self.mountflags),
            user_mountflags = format_args!("{:#x}", self.user_mountflags),
            "Flags merged"
        );
    }

    /// Whether the operation only changes mount propagation.
    #[must_use]
    pub fn is_propagation_only(&self) -> bool {
        if self.action != Some(Action::Mount) {
            return false;
        }
        let is_none = |value: Option<&str>| value.is_none_or(|v| v == "none");
        if !is_none(self.fstype()) || !is_none(self.source()) {
            return false;
        }
        if self.progress.opts_fixed {
            !self.addmounts.is_empty() && self.mountflags & !ms::SILENT == 0
        } else {
            self.optlist.is_propagation_only()
        }
    }

    /// Complete the description from fstab, or from the live table for
    /// remounts and unmounts.
    pub fn apply_fstab(&mut self) -> MountResult<()> {
        if self.progress.tab_applied {
            return Ok(());
        }
        if self.restricted {
            self.optsmode = OptsMode::USER;
        } else if self.optsmode.is_empty() {
            self.optsmode = OptsMode::AUTO;
        }
        let mut mode = self.optsmode;
        if mode.contains(OptsMode::NOTAB) {
            mode.remove(OptsMode::FSTAB);
            mode.remove(OptsMode::MTAB);
            mode.remove(OptsMode::FORCE);
        }

        let source = self.fs.source.clone();
        let target = self.fs.target.clone();
        match (&source, &target) {
            (Some(_), Some(_)) if !mode.contains(OptsMode::FORCE) => {
                tracing::debug!("Source and target given, table not required");
                return Ok(());
            }
            (None, None) => return Ok(()),
            (None, Some(_)) if !mode.contains(OptsMode::FSTAB) && !mode.contains(OptsMode::MTAB) => {
                tracing::debug!("Only target given and tables disabled");
                return Ok(());
            }
            _ => {}
        }

        let isremount = self.optlist.is_remount();
        let had_bind = self.optlist.get_flags(MapId::Linux) & ms::BIND != 0;

        let mut found = None;
        if mode.contains(OptsMode::FSTAB) {
            match self.get_fstab() {
                Ok(fstab) => found = self.lookup_entry(&fstab, Direction::Forward),
                Err(err) => tracing::debug!(%err, "Cannot read fstab"),
            }
        }
        if found.is_none()
            && mode.contains(OptsMode::MTAB)
            && (isremount || self.action == Some(Action::Umount))
        {
            let mountinfo = match target.as_deref() {
                Some(target) => self.get_mountinfo_for_target(target),
                None => self.get_mountinfo(),
            };
            match mountinfo {
                Ok(table) => found = self.lookup_entry(&table, Direction::Backward),
                Err(err) => tracing::debug!(%err, "Cannot read mountinfo"),
            }
        }

        let Some(entry) = found else {
            if !self.restricted && target.is_some() && source.is_none() && isremount {
                tracing::debug!("Remount without table entry, continuing");
                return Ok(());
            }
            return Err(MountError::NotInFstab {
                spec: source.or(target).unwrap_or_default(),
            });
        };

        self.apply_entry(&entry, self.optsmode)?;
        if isremount && !had_bind {
            self.optlist.remove_flags(ms::BIND, MapId::Linux);
        }
        Ok(())
    }

    /// Complete the description from `table`.
    pub fn apply_table(&mut self, table: &Table, direction: Direction) -> MountResult<()> {
        match self.lookup_entry(table, direction) {
            Some(entry) => self.apply_entry(&entry, self.optsmode),
            None => Err(MountError::NotInFstab {
                spec: self
                    .fs
                    .source
                    .clone()
                    .or_else(|| self.fs.target.clone())
                    .unwrap_or_default(),
            }),
        }
    }

    fn lookup_entry(&self, table: &Table, direction: Direction) -> Option<Arc<Fs>> {
        let swapmatch = self.is_swapmatch();
        match (self.source(), self.target()) {
            (Some(source), Some(target)) => table.find_pair(source, target, direction),
            (Some(source), None) => table.find_source(source, direction).or_else(|| {
                let untagged = crate::tab::fs::parse_tag(source).is_none();
                (swapmatch && untagged)
                    .then(|| table.find_target(source, direction))
                    .flatten()
            }),
            (None, Some(target)) => table
                .find_target(target, direction)
                .or_else(|| swapmatch.then(|| table.find_source(target, direction)).flatten()),
            (None, None) => None,
        }
    }

    pub(super) fn apply_entry(&mut self, entry: &Fs, mode: OptsMode) -> MountResult<()> {
        tracing::debug!(
            source = ?entry.source,
            target = ?entry.target,
            ?mode,
            "Applying table entry"
        );
        {
            let fs = self.fs_mut();
            if entry.source.is_some() {
                fs.source.clone_from(&entry.source);
            }
            if entry.target.is_some() {
                fs.target.clone_from(&entry.target);
            }
            if fs.fstype.is_none() {
                fs.fstype.clone_from(&entry.fstype);
            }
            if fs.root.is_none() {
                fs.root.clone_from(&entry.root);
            }
        }

        let options = entry.all_options();
        if mode.contains(OptsMode::IGNORE) {
            // caller options only
        } else if mode.contains(OptsMode::REPLACE) {
            let rdonly =
                self.restricted && self.optlist.get_flags(MapId::Linux) & ms::RDONLY != 0;
            self.optlist.set_optstr(options.as_deref())?;
            if rdonly {
                self.optlist.append_optstr("ro")?;
            }
        } else if let Some(options) = options.as_deref() {
            if mode.contains(OptsMode::APPEND) {
                self.optlist.append_optstr(options)?;
            } else if mode.contains(OptsMode::PREPEND) {
                self.optlist.prepend_optstr(options)?;
            }
        }

        self.progress.tab_applied = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::user;
    use crate::testing::{self, Sandbox};

    fn sandbox_with_fstab(entries: Vec<Fs>) -> Sandbox {
        let sandbox = Sandbox::new();
        sandbox.tables.set_fstab(entries);
        sandbox
    }

    fn data_entry() -> Fs {
        Fs::new()
            .with_source("/dev/sdb1")
            .with_target("/data")
            .with_fstype("ext4")
            .with_options("noatime,user")
    }

    #[test]
    fn merge_is_idempotent() {
        let mut cxt = testing::context();
        cxt.set_options(Some("ro,user,noexec")).unwrap();
        cxt.merge_flags();
        let once = (cxt.mountflags, cxt.user_mountflags);

        cxt.append_options("rw").unwrap();
        cxt.merge_flags();
        assert_eq!((cxt.mountflags, cxt.user_mountflags), once);
        assert_eq!(cxt.get_flags(MapId::Linux), once.0);
        assert!(once.0 & ms::NOSUID != 0);
        assert_eq!(once.1, user::USER);
    }

    #[test]
    fn options_round_trip() {
        let mut cxt = testing::context();
        cxt.set_options(Some("a,b=1")).unwrap();
        let optstr = cxt.optlist().to_string();
        let mut items: Vec<&str> = optstr.split(',').collect();
        items.sort_unstable();
        assert_eq!(items, ["a", "b=1"]);
    }

    #[test]
    fn restricted_callers_always_use_user_mode() {
        let sandbox = sandbox_with_fstab(vec![data_entry()]);
        let mut cxt = sandbox.context();
        cxt.set_credentials(testing::user(1000));
        cxt.set_optsmode(OptsMode::IGNORE | OptsMode::NOTAB);
        cxt.set_target(Some("/data"));
        cxt.set_options(Some("ro,nodev")).unwrap();

        cxt.apply_fstab().unwrap();
        assert_eq!(cxt.optsmode(), OptsMode::USER);
        // replaced by fstab options, ro kept
        assert_eq!(cxt.optlist().to_string(), "noatime,user,ro");
    }

    #[test]
    fn privileged_default_mode_prepends() {
        let sandbox = sandbox_with_fstab(vec![data_entry()]);
        let mut cxt = sandbox.context();
        cxt.set_target(Some("/data"));
        cxt.set_options(Some("ro")).unwrap();

        cxt.apply_fstab().unwrap();
        assert_eq!(cxt.optsmode(), OptsMode::AUTO);
        assert_eq!(cxt.source(), Some("/dev/sdb1"));
        assert_eq!(cxt.fstype(), Some("ext4"));
        assert_eq!(cxt.optlist().to_string(), "noatime,user,ro");
        assert!(cxt.progress().tab_applied);
    }

    #[test]
    fn swapmatch_retries_as_target() {
        let sandbox = sandbox_with_fstab(vec![data_entry()]);
        let mut cxt = sandbox.context();
        cxt.set_source(Some("/data"));

        cxt.apply_fstab().unwrap();
        assert_eq!(cxt.source(), Some("/dev/sdb1"));
        assert_eq!(cxt.target(), Some("/data"));

        let mut cxt = sandbox.context();
        cxt.behavior_mut().noswapmatch = true;
        cxt.set_source(Some("/data"));
        assert!(matches!(
            cxt.apply_fstab(),
            Err(MountError::NotInFstab { .. })
        ));
    }

    #[test]
    fn skipped_when_not_needed() {
        let sandbox = sandbox_with_fstab(vec![data_entry()]);
        let mut cxt = sandbox.context();
        cxt.set_source(Some("/dev/sdc1"));
        cxt.set_target(Some("/mnt"));
        cxt.apply_fstab().unwrap();
        assert!(!cxt.progress().tab_applied);

        let mut cxt = sandbox.context();
        cxt.apply_fstab().unwrap();
        assert!(!cxt.progress().tab_applied);

        let mut cxt = sandbox.context();
        cxt.set_optsmode(OptsMode::PREPEND);
        cxt.set_target(Some("/data"));
        cxt.apply_fstab().unwrap();
        assert!(cxt.source().is_none());
    }

    #[test]
    fn missing_entry_is_not_in_fstab() {
        let sandbox = sandbox_with_fstab(vec![]);
        let mut cxt = sandbox.context();
        cxt.set_target(Some("/nowhere"));
        let err = cxt.apply_fstab().unwrap_err();
        assert!(matches!(err, MountError::NotInFstab { ref spec } if spec == "/nowhere"));
    }

    #[test]
    fn remount_falls_back_to_mountinfo() {
        let sandbox = sandbox_with_fstab(vec![]);
        sandbox.tables.set_mountinfo(vec![
            Fs::new().with_source("/dev/sda1").with_target("/").with_fstype("ext4"),
            Fs::new().with_source("tmpfs").with_target("/run").with_fstype("tmpfs"),
        ]);
        let mut cxt = sandbox.context();
        cxt.action = Some(Action::Mount);
        cxt.set_target(Some("/run"));
        cxt.set_options(Some("remount,ro")).unwrap();

        cxt.apply_fstab().unwrap();
        assert_eq!(cxt.source(), Some("tmpfs"));
        assert_eq!(cxt.fstype(), Some("tmpfs"));
    }

    #[test]
    fn privileged_remount_without_entry_is_tolerated() {
        let sandbox = sandbox_with_fstab(vec![]);
        let mut cxt = sandbox.context();
        cxt.set_target(Some("/srv"));
        cxt.set_options(Some("remount,rw")).unwrap();
        cxt.apply_fstab().unwrap();
        assert!(!cxt.progress().tab_applied);

        let mut cxt = sandbox.context();
        cxt.set_credentials(testing::user(1000));
        cxt.set_target(Some("/srv"));
        cxt.set_options(Some("remount,rw")).unwrap();
        assert!(cxt.apply_fstab().is_err());
    }

    #[test]
    fn remount_strips_inherited_bind() {
        let sandbox = sandbox_with_fstab(vec![
            Fs::new()
                .with_source("/srv/export")
                .with_target("/export")
                .with_fstype("none")
                .with_options("bind,nosuid"),
        ]);
        let mut cxt = sandbox.context();
        cxt.set_target(Some("/export"));
        cxt.set_options(Some("remount,ro")).unwrap();

        cxt.apply_fstab().unwrap();
        assert!(!cxt.optlist().contains("bind"));
        assert!(cxt.optlist().contains("nosuid"));

        // explicit bind survives
        let mut cxt = sandbox.context();
        cxt.set_target(Some("/export"));
        cxt.set_options(Some("remount,bind,ro")).unwrap();
        cxt.apply_fstab().unwrap();
        assert!(cxt.optlist().contains("bind"));
    }

    #[test]
    fn table_options_modes() {
        let table = Table::from_entries([data_entry()]);
        for (mode, expected) in [
            (OptsMode::IGNORE, "ro"),
            (OptsMode::APPEND, "ro,noatime,user"),
            (OptsMode::PREPEND, "noatime,user,ro"),
            (OptsMode::REPLACE, "noatime,user"),
        ] {
            let mut cxt = testing::context();
            cxt.set_optsmode(mode);
            cxt.set_target(Some("/data"));
            cxt.set_options(Some("ro")).unwrap();
            cxt.apply_table(&table, Direction::Forward).unwrap();
            assert_eq!(cxt.optlist().to_string(), expected, "{mode:?}");
        }
    }

    #[test]
    fn replace_keeps_ro_for_restricted_callers() {
        let table = Table::from_entries([data_entry()]);
        let mut cxt = testing::context();
        cxt.set_credentials(testing::user(1000));
        cxt.set_optsmode(OptsMode::REPLACE);
        cxt.set_target(Some("/data"));
        cxt.set_options(Some("ro")).unwrap();
        cxt.apply_table(&table, Direction::Forward).unwrap();
        assert_eq!(cxt.optlist().to_string(), "noatime,user,ro");
    }

    #[test]
    fn explicit_type_is_kept() {
        let table = Table::from_entries([data_entry()]);
        let mut cxt = testing::context();
        cxt.set_optsmode(OptsMode::IGNORE);
        cxt.set_source(Some("/dev/sdb1"));
        cxt.set_fstype(Some("ext2"));
        cxt.apply_table(&table, Direction::Forward).unwrap();
        assert_eq!(cxt.fstype(), Some("ext2"));
        assert_eq!(cxt.target(), Some("/data"));
    }

    #[test]
    fn propagation_only_detection() {
        let mut cxt = testing::context();
        cxt.action = Some(Action::Mount);
        cxt.set_target(Some("/mnt"));
        cxt.set_options(Some("rprivate")).unwrap();
        assert!(cxt.is_propagation_only());

        cxt.set_source(Some("/dev/sdb1"));
        assert!(!cxt.is_propagation_only());
        cxt.set_source(Some("none"));
        assert!(cxt.is_propagation_only());

        cxt.action = Some(Action::Umount);
        assert!(!cxt.is_propagation_only());
    }
}
