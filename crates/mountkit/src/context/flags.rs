//! Context mode switches and pipeline progress.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Caller-selected behavior. Survives a full reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Behavior {
    /// Do not update the userspace mount table.
    pub nomtab: bool,
    /// Do everything except the actual mount or unmount.
    pub fake: bool,
    /// Tolerate unknown filesystem options (`-s` for helpers).
    pub sloppy: bool,
    /// Verbose helpers.
    pub verbose: bool,
    /// Never call external helpers.
    pub nohelpers: bool,
    /// Free loop devices on unmount.
    pub loopdel: bool,
    /// Lazy unmount.
    pub lazy: bool,
    /// Forced unmount.
    pub force: bool,
    /// Mount-all runs every mount on its own worker.
    pub fork: bool,
    /// Never canonicalize paths.
    pub nocanonicalize: bool,
    /// Remount read-only when an unmount reports busy.
    pub rdonly_umount: bool,
    /// Do not retry table lookups with source and target swapped.
    pub noswapmatch: bool,
}

/// State accumulated by one pipeline run. Cleared by a full reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Progress {
    /// Never retry read-only.
    pub rwonly_mount: bool,
    /// Running as a mount helper.
    pub helper_mode: bool,
    /// A table entry was applied (or the entry came from a table).
    pub tab_applied: bool,
    /// Kernel and userspace flags are frozen.
    pub flags_merged: bool,
    /// The prepare stage finished.
    pub prepared: bool,
    /// Options were finalized for execution.
    pub opts_fixed: bool,
    /// The writable table path was checked.
    pub tabpaths_checked: bool,
    /// The utab is writable (valid when `tabpaths_checked`).
    pub utab_writable: bool,
    /// The mount was retried read-only.
    pub forced_rdonly: bool,
    /// Value of a `user=` option saved before it was rewritten.
    pub saved_user: Option<String>,
}

/// How table options are combined with the caller's options.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OptsMode(u16);

impl OptsMode {
    /// Ignore table options.
    pub const IGNORE: Self = Self(1 << 1);
    /// Append table options.
    pub const APPEND: Self = Self(1 << 2);
    /// Prepend table options.
    pub const PREPEND: Self = Self(1 << 3);
    /// Replace the caller's options with table options.
    pub const REPLACE: Self = Self(1 << 4);
    /// Read the table even when source and target are both known.
    pub const FORCE: Self = Self(1 << 5);
    /// Look up fstab.
    pub const FSTAB: Self = Self(1 << 10);
    /// Fall back to the live mount table.
    pub const MTAB: Self = Self(1 << 11);
    /// Never read tables.
    pub const NOTAB: Self = Self(1 << 12);

    /// Default for privileged callers.
    pub const AUTO: Self = Self(Self::PREPEND.0 | Self::FSTAB.0 | Self::MTAB.0);
    /// Mandatory for restricted callers.
    pub const USER: Self = Self(Self::REPLACE.0 | Self::FORCE.0 | Self::FSTAB.0);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::IGNORE, "ignore"),
        (Self::APPEND, "append"),
        (Self::PREPEND, "prepend"),
        (Self::REPLACE, "replace"),
        (Self::FORCE, "force"),
        (Self::FSTAB, "fstab"),
        (Self::MTAB, "mtab"),
        (Self::NOTAB, "notab"),
    ];

    /// No bits set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clear the bits of `other`.
    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Parse a mode name (`ignore`, `append`, `prepend`, `replace`) or a
    /// table source name (`fstab`, `mtab`, `notab`, `force`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(mode, _)| *mode)
    }
}

impl BitOr for OptsMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OptsMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OptsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(mode, _)| self.contains(*mode))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OptsMode({})", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_modes() {
        assert!(OptsMode::AUTO.contains(OptsMode::PREPEND | OptsMode::FSTAB));
        assert!(OptsMode::USER.contains(OptsMode::REPLACE));
        assert!(OptsMode::USER.contains(OptsMode::FORCE));
        assert!(!OptsMode::USER.contains(OptsMode::MTAB));
        assert_eq!(format!("{:?}", OptsMode::AUTO), "OptsMode(prepend|fstab|mtab)");
    }

    #[test]
    fn names_and_removal() {
        let mut mode = OptsMode::from_name("append").unwrap() | OptsMode::from_name("fstab").unwrap();
        assert!(mode.contains(OptsMode::FSTAB));
        mode.remove(OptsMode::FSTAB);
        assert_eq!(mode, OptsMode::APPEND);
        assert!(OptsMode::from_name("bogus").is_none());
        assert!(OptsMode::empty().is_empty());
    }
}
