//! Staged updates of the userspace mount table (utab).

pub mod lock;

use std::io::Write;
use std::path::{Path, PathBuf};

use mountkit_common::{MountError, MountResult};

pub use lock::Lock;

use crate::options::ms;
use crate::tab::parse::{format_utab_line, parse_utab};
use crate::tab::{Direction, Fs, Table};

/// The single change an [`Update`] carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Record a new mount.
    Add(Fs),
    /// Forget the mount at `target`.
    Remove {
        /// Mountpoint.
        target: String,
    },
    /// A mount moved from `from` to `to`.
    Move {
        /// Old mountpoint.
        from: String,
        /// New mountpoint.
        to: String,
    },
    /// Replace the userspace options of the mount at `target`.
    Remount {
        /// Mountpoint.
        target: String,
        /// New userspace options.
        options: Option<String>,
    },
}

impl Change {
    /// Mountpoint affected by the change.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Add(fs) => fs.target.as_deref(),
            Self::Remove { target } | Self::Remount { target, .. } => Some(target),
            Self::Move { to, .. } => Some(to),
        }
    }
}

/// One staged change against a table file.
#[derive(Debug, Clone)]
pub struct Update {
    path: PathBuf,
    change: Option<Change>,
}

impl Update {
    /// Create an empty update of `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            change: None,
        }
    }

    /// Table file this update writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The staged change.
    #[must_use]
    pub const fn change(&self) -> Option<&Change> {
        self.change.as_ref()
    }

    /// Whether a change is staged.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.change.is_some()
    }

    /// Stage a change.
    ///
    /// `target` alone stages an unmount. Otherwise `fs` describes the mount
    /// and its `user_options` are what gets recorded. Returns `false` when
    /// nothing needs to be recorded (propagation changes, mounts without
    /// userspace state).
    pub fn set_fs(&mut self, mountflags: u64, target: Option<&str>, fs: Option<&Fs>) -> MountResult<bool> {
        self.change = None;

        if mountflags & ms::PROPAGATION != 0 {
            return Ok(false);
        }
        let change = match (target, fs) {
            (Some(target), None) => Change::Remove {
                target: target.to_string(),
            },
            (_, Some(fs)) if mountflags & ms::MOVE != 0 => {
                let (Some(from), Some(to)) = (fs.source.clone(), fs.target.clone()) else {
                    return Err(MountError::invalid("move needs source and target"));
                };
                Change::Move { from, to }
            }
            (_, Some(fs)) if mountflags & ms::REMOUNT != 0 => {
                let Some(target) = fs.target.clone() else {
                    return Err(MountError::invalid("remount needs a target"));
                };
                Change::Remount {
                    target,
                    options: fs.user_options.clone().filter(|o| !o.is_empty()),
                }
            }
            (_, Some(fs)) => {
                let has_user_state = fs.user_options.as_deref().is_some_and(|o| !o.is_empty())
                    || fs.bindsrc.is_some();
                if !has_user_state {
                    return Ok(false);
                }
                if fs.target.is_none() {
                    return Err(MountError::invalid("mount needs a target"));
                }
                Change::Add(fs.clone())
            }
            (None, None) => return Err(MountError::invalid("nothing to update")),
        };

        tracing::debug!(path = %self.path.display(), ?change, "Staged table update");
        self.change = Some(change);
        Ok(true)
    }

    /// Record the filesystem type that was finally mounted.
    pub fn set_fstype(&mut self, fstype: &str) {
        if let Some(Change::Add(fs)) = &mut self.change {
            fs.fstype = Some(fstype.to_string());
        }
    }

    fn read(&self) -> MountResult<Table> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_utab(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether the table already reflects the staged change, e.g. because
    /// a helper recorded it itself.
    pub fn already_done(&self) -> MountResult<bool> {
        let table = self.read()?;
        Ok(match &self.change {
            Some(Change::Add(fs)) => {
                let target = fs.target.as_deref().unwrap_or_default();
                table.iter(Direction::Backward).any(|entry| {
                    entry.target.as_deref() == Some(target)
                        && (entry.source == fs.source
                            || (fs.bindsrc.is_some() && entry.bindsrc == fs.bindsrc))
                })
            }
            Some(Change::Remove { target }) => table.find_target(target, Direction::Backward).is_none(),
            _ => false,
        })
    }

    /// Apply the staged change to the table file. The caller holds `lock`.
    pub fn commit(&self, lock: &Lock) -> MountResult<()> {
        let Some(change) = &self.change else {
            return Ok(());
        };
        if !lock.is_locked() {
            return Err(MountError::invalid("table update without lock"));
        }

        let mut entries: Vec<Fs> = self
            .read()?
            .iter(Direction::Forward)
            .map(|fs| Fs::clone(fs))
            .collect();

        match change {
            Change::Add(fs) => entries.push(fs.clone()),
            Change::Remove { target } => {
                if let Some(pos) = entries
                    .iter()
                    .rposition(|fs| fs.target.as_deref() == Some(target))
                {
                    entries.remove(pos);
                }
            }
            Change::Move { from, to } => {
                if let Some(fs) = entries
                    .iter_mut()
                    .rev()
                    .find(|fs| fs.target.as_deref() == Some(from))
                {
                    fs.target = Some(to.clone());
                }
            }
            Change::Remount { target, options } => {
                if let Some(fs) = entries
                    .iter_mut()
                    .rev()
                    .find(|fs| fs.target.as_deref() == Some(target))
                {
                    fs.user_options.clone_from(options);
                }
            }
        }

        self.write(&entries)?;
        tracing::debug!(path = %self.path.display(), "Table updated");
        Ok(())
    }

    fn write(&self, entries: &[Fs]) -> MountResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| MountError::invalid("table path has no directory"))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".utab.")
            .tempfile_in(dir)?;
        for fs in entries {
            writeln!(tmp, "{}", format_utab_line(fs))?;
        }
        tmp.as_file().sync_all()?;
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        tmp.persist(&self.path).map_err(|e| MountError::Io(e.error))?;
        Ok(())
    }
}
