//! Builtin option maps.
//!
//! The kernel map translates option names into `MS_*` mount flags, the
//! userspace map into `MNT_MS_*` flags that only mean something to mount
//! tooling. Both are immutable statics shared by every context.

/// Kernel mount flags (`mount(2)` ABI values).
#[allow(missing_docs)]
pub mod ms {
    pub const RDONLY: u64 = 1;
    pub const NOSUID: u64 = 1 << 1;
    pub const NODEV: u64 = 1 << 2;
    pub const NOEXEC: u64 = 1 << 3;
    pub const SYNCHRONOUS: u64 = 1 << 4;
    pub const REMOUNT: u64 = 1 << 5;
    pub const MANDLOCK: u64 = 1 << 6;
    pub const DIRSYNC: u64 = 1 << 7;
    pub const NOSYMFOLLOW: u64 = 1 << 8;
    pub const NOATIME: u64 = 1 << 10;
    pub const NODIRATIME: u64 = 1 << 11;
    pub const BIND: u64 = 1 << 12;
    pub const MOVE: u64 = 1 << 13;
    pub const REC: u64 = 1 << 14;
    pub const SILENT: u64 = 1 << 15;
    pub const UNBINDABLE: u64 = 1 << 17;
    pub const PRIVATE: u64 = 1 << 18;
    pub const SLAVE: u64 = 1 << 19;
    pub const SHARED: u64 = 1 << 20;
    pub const RELATIME: u64 = 1 << 21;
    pub const I_VERSION: u64 = 1 << 23;
    pub const STRICTATIME: u64 = 1 << 24;
    pub const LAZYTIME: u64 = 1 << 25;

    /// Any propagation change.
    pub const PROPAGATION: u64 = SHARED | SLAVE | UNBINDABLE | PRIVATE;
}

/// Userspace-only mount flags.
#[allow(missing_docs)]
pub mod user {
    pub const NOAUTO: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const USERS: u64 = 1 << 3;
    pub const OWNER: u64 = 1 << 4;
    pub const GROUP: u64 = 1 << 5;
    pub const NETDEV: u64 = 1 << 6;
    pub const COMMENT: u64 = 1 << 7;
    pub const LOOP: u64 = 1 << 8;
    pub const NOFAIL: u64 = 1 << 9;
    pub const UHELPER: u64 = 1 << 10;
    pub const HELPER: u64 = 1 << 11;
    pub const XCOMMENT: u64 = 1 << 12;
    pub const OFFSET: u64 = 1 << 13;
    pub const SIZELIMIT: u64 = 1 << 14;
    pub const ENCRYPTION: u64 = 1 << 15;
    pub const XFSTABCOMM: u64 = 1 << 16;
    pub const VERITY_HASH_DEVICE: u64 = 1 << 17;
    pub const VERITY_ROOT_HASH: u64 = 1 << 18;
}

/// Entry attribute: the option clears its id instead of setting it.
pub const INVERT: u32 = 1 << 1;
/// Entry attribute: never recorded in the userspace mount table.
pub const NOMTAB: u32 = 1 << 2;
/// Entry attribute: the name is a prefix (`x-`, `X-`).
pub const PREFIX: u32 = 1 << 3;
/// Entry attribute: never passed to mount helpers.
pub const NOHLPS: u32 = 1 << 4;

/// Which builtin map an option belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapId {
    /// Kernel mount flags.
    Linux,
    /// Userspace options.
    Userspace,
}

/// How an entry accepts a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSyntax {
    /// `name`
    None,
    /// `name[=value]`
    Optional,
    /// `name=value`
    Required,
}

/// One named option of a map.
#[derive(Debug, PartialEq, Eq)]
pub struct MapEntry {
    /// Option name, possibly suffixed with `=` or `[=]`.
    pub name: &'static str,
    /// Flag bits this option sets (or clears, for [`INVERT`] entries).
    pub id: u64,
    /// Entry attributes.
    pub mask: u32,
}

impl MapEntry {
    const fn new(name: &'static str, id: u64, mask: u32) -> Self {
        Self { name, id, mask }
    }

    /// The name without its value syntax suffix.
    #[must_use]
    pub fn base_name(&self) -> &'static str {
        self.name
            .strip_suffix("[=]")
            .or_else(|| self.name.strip_suffix('='))
            .unwrap_or(self.name)
    }

    /// Value syntax declared by the entry name.
    #[must_use]
    pub fn value_syntax(&self) -> ValueSyntax {
        if self.name.ends_with("[=]") {
            ValueSyntax::Optional
        } else if self.name.ends_with('=') {
            ValueSyntax::Required
        } else {
            ValueSyntax::None
        }
    }

    /// Whether the entry has the given attribute.
    #[must_use]
    pub const fn has(&self, mask: u32) -> bool {
        self.mask & mask != 0
    }

    fn matches(&self, name: &str) -> bool {
        if self.has(PREFIX) {
            name.starts_with(self.name)
        } else {
            self.base_name() == name
        }
    }
}

/// An immutable option map.
#[derive(Debug)]
pub struct OptionMap {
    /// Map identity.
    pub id: MapId,
    /// Entries in declaration order.
    pub entries: &'static [MapEntry],
}

impl OptionMap {
    /// Find the entry for an option name (without value).
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&'static MapEntry> {
        self.entries.iter().find(|entry| entry.matches(name))
    }
}

/// Kernel option map.
pub static LINUX_MAP: OptionMap = OptionMap {
    id: MapId::Linux,
    entries: &[
        MapEntry::new("defaults", 0, 0),
        MapEntry::new("ro", ms::RDONLY, 0),
        MapEntry::new("rw", ms::RDONLY, INVERT),
        MapEntry::new("exec", ms::NOEXEC, INVERT),
        MapEntry::new("noexec", ms::NOEXEC, 0),
        MapEntry::new("suid", ms::NOSUID, INVERT),
        MapEntry::new("nosuid", ms::NOSUID, 0),
        MapEntry::new("dev", ms::NODEV, INVERT),
        MapEntry::new("nodev", ms::NODEV, 0),
        MapEntry::new("sync", ms::SYNCHRONOUS, 0),
        MapEntry::new("async", ms::SYNCHRONOUS, INVERT),
        MapEntry::new("dirsync", ms::DIRSYNC, 0),
        MapEntry::new("remount", ms::REMOUNT, NOMTAB),
        MapEntry::new("bind", ms::BIND, 0),
        MapEntry::new("rbind", ms::BIND | ms::REC, 0),
        MapEntry::new("move", ms::MOVE, NOHLPS | NOMTAB),
        MapEntry::new("silent", ms::SILENT, 0),
        MapEntry::new("loud", ms::SILENT, INVERT),
        MapEntry::new("mand", ms::MANDLOCK, 0),
        MapEntry::new("nomand", ms::MANDLOCK, INVERT),
        MapEntry::new("atime", ms::NOATIME, INVERT),
        MapEntry::new("noatime", ms::NOATIME, 0),
        MapEntry::new("iversion", ms::I_VERSION, 0),
        MapEntry::new("noiversion", ms::I_VERSION, INVERT),
        MapEntry::new("diratime", ms::NODIRATIME, INVERT),
        MapEntry::new("nodiratime", ms::NODIRATIME, 0),
        MapEntry::new("relatime", ms::RELATIME, 0),
        MapEntry::new("norelatime", ms::RELATIME, INVERT),
        MapEntry::new("strictatime", ms::STRICTATIME, 0),
        MapEntry::new("nostrictatime", ms::STRICTATIME, INVERT),
        MapEntry::new("lazytime", ms::LAZYTIME, 0),
        MapEntry::new("nolazytime", ms::LAZYTIME, INVERT),
        MapEntry::new("symfollow", ms::NOSYMFOLLOW, INVERT),
        MapEntry::new("nosymfollow", ms::NOSYMFOLLOW, 0),
        MapEntry::new("unbindable", ms::UNBINDABLE, NOHLPS | NOMTAB),
        MapEntry::new("runbindable", ms::UNBINDABLE | ms::REC, NOHLPS | NOMTAB),
        MapEntry::new("private", ms::PRIVATE, NOHLPS | NOMTAB),
        MapEntry::new("rprivate", ms::PRIVATE | ms::REC, NOHLPS | NOMTAB),
        MapEntry::new("slave", ms::SLAVE, NOHLPS | NOMTAB),
        MapEntry::new("rslave", ms::SLAVE | ms::REC, NOHLPS | NOMTAB),
        MapEntry::new("shared", ms::SHARED, NOHLPS | NOMTAB),
        MapEntry::new("rshared", ms::SHARED | ms::REC, NOHLPS | NOMTAB),
    ],
};

/// Userspace option map.
pub static USERSPACE_MAP: OptionMap = OptionMap {
    id: MapId::Userspace,
    entries: &[
        MapEntry::new("auto", user::NOAUTO, NOHLPS | INVERT | NOMTAB),
        MapEntry::new("noauto", user::NOAUTO, NOHLPS | NOMTAB),
        MapEntry::new("user[=]", user::USER, 0),
        MapEntry::new("nouser", user::USER, INVERT | NOMTAB),
        MapEntry::new("users", user::USERS, NOMTAB),
        MapEntry::new("nousers", user::USERS, INVERT | NOMTAB),
        MapEntry::new("owner", user::OWNER, NOMTAB),
        MapEntry::new("noowner", user::OWNER, INVERT | NOMTAB),
        MapEntry::new("group", user::GROUP, NOMTAB),
        MapEntry::new("nogroup", user::GROUP, INVERT | NOMTAB),
        MapEntry::new("_netdev", user::NETDEV, 0),
        MapEntry::new("comment=", user::COMMENT, NOHLPS | NOMTAB),
        MapEntry::new("x-", user::XCOMMENT, NOHLPS | PREFIX),
        MapEntry::new("X-", user::XFSTABCOMM, NOHLPS | NOMTAB | PREFIX),
        MapEntry::new("loop[=]", user::LOOP, NOHLPS),
        MapEntry::new("offset=", user::OFFSET, NOHLPS),
        MapEntry::new("sizelimit=", user::SIZELIMIT, NOHLPS),
        MapEntry::new("encryption=", user::ENCRYPTION, NOHLPS),
        MapEntry::new("nofail", user::NOFAIL, NOMTAB),
        MapEntry::new("uhelper=", user::UHELPER, 0),
        MapEntry::new("helper=", user::HELPER, 0),
        MapEntry::new("verity.hashdevice=", user::VERITY_HASH_DEVICE, NOHLPS | NOMTAB),
        MapEntry::new("verity.roothash=", user::VERITY_ROOT_HASH, NOHLPS | NOMTAB),
    ],
};

/// The builtin map with the given identity.
#[must_use]
pub fn builtin(id: MapId) -> &'static OptionMap {
    match id {
        MapId::Linux => &LINUX_MAP,
        MapId::Userspace => &USERSPACE_MAP,
    }
}

/// Find an option in the builtin maps, kernel map first.
#[must_use]
pub fn resolve(name: &str) -> Option<(MapId, &'static MapEntry)> {
    [&LINUX_MAP, &USERSPACE_MAP]
        .into_iter()
        .find_map(|map| map.lookup(name).map(|entry| (map.id, entry)))
}
