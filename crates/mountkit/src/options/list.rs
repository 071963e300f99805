//! Ordered list of mount options.

use std::fmt;

use mountkit_common::{MountError, MountResult};

use super::map::{self, MapEntry, MapId, ValueSyntax, ms, user};

/// Where an option came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptSource {
    /// Parsed from an option string.
    String,
    /// Generated from a flag bitmask.
    Flags,
}

/// One option of an [`OptionList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opt {
    name: String,
    value: Option<String>,
    map: Option<MapId>,
    entry: Option<&'static MapEntry>,
    source: OptSource,
}

impl Opt {
    fn new(name: String, value: Option<String>, source: OptSource) -> Self {
        let (map, entry) = match map::resolve(&name) {
            Some((map, entry)) => (Some(map), Some(entry)),
            None => (None, None),
        };
        Self {
            name,
            value,
            map,
            entry,
            source,
        }
    }

    /// Option name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw option value, quotes included.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Option value with surrounding double quotes removed.
    #[must_use]
    pub fn unquoted_value(&self) -> Option<&str> {
        self.value.as_deref().map(|value| {
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
        })
    }

    /// Map that recognizes this option, if any.
    #[must_use]
    pub const fn map(&self) -> Option<MapId> {
        self.map
    }

    /// Map entry for this option, if any.
    #[must_use]
    pub const fn entry(&self) -> Option<&'static MapEntry> {
        self.entry
    }

    /// Where the option came from.
    #[must_use]
    pub const fn source(&self) -> OptSource {
        self.source
    }

    fn has(&self, mask: u32) -> bool {
        self.entry.is_some_and(|entry| entry.has(mask))
    }

    /// Key used for duplicate detection: options sharing an id override
    /// each other (`ro` vs `rw`), everything else is keyed by name.
    fn dedup_key(&self) -> (Option<MapId>, u64, &str) {
        match self.entry {
            Some(entry) if entry.id != 0 && !entry.has(map::PREFIX) => (self.map, entry.id, ""),
            _ => (self.map, 0, self.name.as_str()),
        }
    }
}

impl fmt::Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// Serialization filter for [`OptionList::to_optstr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Every option.
    All,
    /// Options unknown to both builtin maps (filesystem-specific data).
    FsData,
    /// Everything that may be passed to a mount helper.
    Helpers,
    /// Userspace options worth recording in utab.
    Utab,
}

/// An ordered set of options; later instances win over earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    opts: Vec<Opt>,
}

/// Split an option string into `(name, value)` pairs.
///
/// Commas inside double quotes do not separate options.
pub fn split_optstr(optstr: &str) -> MountResult<Vec<(String, Option<String>)>> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in optstr.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(MountError::MountOptions {
            message: format!("unterminated quote in '{optstr}'"),
        });
    }
    items.push(current);

    items
        .into_iter()
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some(("", _)) => Err(MountError::MountOptions {
                message: format!("option without name in '{optstr}'"),
            }),
            Some((name, value)) => Ok((name.to_string(), Some(value.to_string()))),
            None => Ok((item, None)),
        })
        .collect()
}

impl OptionList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from an option string.
    pub fn parse(optstr: &str) -> MountResult<Self> {
        let mut list = Self::new();
        list.append_optstr(optstr)?;
        Ok(list)
    }

    fn parsed(optstr: &str) -> MountResult<Vec<Opt>> {
        Ok(split_optstr(optstr)?
            .into_iter()
            .map(|(name, value)| Opt::new(name, value, OptSource::String))
            .collect())
    }

    /// Replace all string-sourced options with `optstr`.
    pub fn set_optstr(&mut self, optstr: Option<&str>) -> MountResult<()> {
        let parsed = optstr.map(Self::parsed).transpose()?.unwrap_or_default();
        self.opts.retain(|opt| opt.source != OptSource::String);
        self.opts.extend(parsed);
        Ok(())
    }

    /// Add options from `optstr` after the existing ones.
    pub fn append_optstr(&mut self, optstr: &str) -> MountResult<()> {
        let parsed = Self::parsed(optstr)?;
        self.opts.extend(parsed);
        Ok(())
    }

    /// Add options from `optstr` before the existing ones.
    pub fn prepend_optstr(&mut self, optstr: &str) -> MountResult<()> {
        let parsed = Self::parsed(optstr)?;
        self.opts.splice(0..0, parsed);
        Ok(())
    }

    /// Replace all flag-sourced options of `map` with options for `flags`.
    pub fn set_flags(&mut self, flags: u64, map: MapId) {
        self.opts
            .retain(|opt| !(opt.source == OptSource::Flags && opt.map == Some(map)));
        self.append_flags(flags, map);
    }

    /// Add one option per flag in `flags`.
    ///
    /// Entries that need a value and inverted entries are never generated;
    /// recursive entries (`rbind`, `rprivate`) are preferred over their
    /// plain counterparts.
    pub fn append_flags(&mut self, mut flags: u64, map: MapId) {
        let entries = map::builtin(map).entries;
        let recursive = entries.iter().filter(|e| e.id & ms::REC != 0);
        let plain = entries.iter().filter(|e| e.id & ms::REC == 0);

        for entry in recursive.chain(plain) {
            if entry.has(map::INVERT)
                || entry.has(map::PREFIX)
                || entry.id == 0
                || entry.value_syntax() == ValueSyntax::Required
                || flags & entry.id != entry.id
            {
                continue;
            }
            self.opts.push(Opt {
                name: entry.base_name().to_string(),
                value: None,
                map: Some(map),
                entry: Some(entry),
                source: OptSource::Flags,
            });
            flags &= !entry.id;
        }
    }

    /// Remove every non-inverted option of `map` that sets a bit of `flags`.
    pub fn remove_flags(&mut self, flags: u64, map: MapId) {
        self.opts.retain(|opt| match opt.entry {
            Some(entry) if opt.map == Some(map) && !entry.has(map::INVERT) => entry.id & flags == 0,
            _ => true,
        });
    }

    /// Remove all instances of the named option.
    pub fn remove_named(&mut self, name: &str) {
        self.opts.retain(|opt| opt.name != name);
    }

    /// Flag bitmask for `map`, evaluated in order (`ro,rw` is read-write).
    #[must_use]
    pub fn get_flags(&self, map: MapId) -> u64 {
        self.opts
            .iter()
            .filter(|opt| opt.map == Some(map))
            .filter_map(|opt| opt.entry)
            .fold(0, |flags, entry| {
                if entry.has(map::INVERT) {
                    flags & !entry.id
                } else {
                    flags | entry.id
                }
            })
    }

    /// Kernel flags as passed to `mount(2)`.
    ///
    /// Like [`get_flags`](Self::get_flags) for the kernel map, except that
    /// `user` (without a name), `users`, `owner` and `group` imply
    /// `noexec,nosuid,nodev` at their position in the list.
    #[must_use]
    pub fn kernel_flags(&self) -> u64 {
        const USER_LIKE: u64 = user::USER | user::USERS | user::OWNER | user::GROUP;
        const IMPLIED: u64 = ms::NOEXEC | ms::NOSUID | ms::NODEV;

        self.opts
            .iter()
            .filter_map(|opt| opt.entry.map(|entry| (opt, entry)))
            .fold(0, |flags, (opt, entry)| match opt.map {
                Some(MapId::Linux) if entry.has(map::INVERT) => flags & !entry.id,
                Some(MapId::Linux) => flags | entry.id,
                Some(MapId::Userspace)
                    if entry.id & USER_LIKE != 0
                        && !entry.has(map::INVERT)
                        && opt.value.as_deref().is_none_or(str::is_empty) =>
                {
                    flags | IMPLIED
                }
                _ => flags,
            })
    }

    /// Last instance of the named option.
    #[must_use]
    pub fn get_named(&self, name: &str) -> Option<&Opt> {
        self.opts.iter().rev().find(|opt| opt.name == name)
    }

    /// Whether the named option is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get_named(name).is_some()
    }

    /// Replace the value of the last instance of `name`.
    pub fn set_value(&mut self, name: &str, value: Option<String>) -> bool {
        match self.opts.iter_mut().rev().find(|opt| opt.name == name) {
            Some(opt) => {
                opt.value = value;
                true
            }
            None => false,
        }
    }

    /// Drop earlier duplicates so each option appears once, at the
    /// position of its last instance.
    pub fn dedup(&mut self) {
        let mut keep = vec![true; self.opts.len()];
        for (i, opt) in self.opts.iter().enumerate() {
            let key = opt.dedup_key();
            if self.opts[i + 1..].iter().any(|later| later.dedup_key() == key) {
                keep[i] = false;
            }
        }
        let mut keep = keep.into_iter();
        self.opts.retain(|_| keep.next().unwrap_or(true));
    }

    /// Serialize options accepted by `filter` as a comma-joined string.
    #[must_use]
    pub fn to_optstr(&self, filter: Filter) -> String {
        self.opts
            .iter()
            .filter(|opt| match filter {
                Filter::All => true,
                Filter::FsData => opt.map.is_none(),
                Filter::Helpers => !opt.has(map::NOHLPS),
                Filter::Utab => opt.map == Some(MapId::Userspace) && !opt.has(map::NOMTAB),
            })
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Propagation bits requested by the list (`REC` included).
    #[must_use]
    pub fn propagation(&self) -> u64 {
        let flags = self.get_flags(MapId::Linux);
        if flags & ms::PROPAGATION == 0 {
            0
        } else {
            flags & (ms::PROPAGATION | ms::REC)
        }
    }

    /// Whether `remount` is requested.
    #[must_use]
    pub fn is_remount(&self) -> bool {
        self.get_flags(MapId::Linux) & ms::REMOUNT != 0
    }

    /// Whether the list only changes mount propagation.
    #[must_use]
    pub fn is_propagation_only(&self) -> bool {
        let flags = self.get_flags(MapId::Linux);
        let rest = flags & !(ms::PROPAGATION | ms::REC);
        flags & ms::PROPAGATION != 0 && (rest == 0 || rest == ms::SILENT)
    }

    /// Iterate over the options in order.
    pub fn iter(&self) -> impl Iterator<Item = &Opt> {
        self.opts.iter()
    }

    /// Number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.opts.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opts.is_empty()
    }
}

impl fmt::Display for OptionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_optstr(Filter::All))
    }
}

/// Whether `optstr` satisfies `pattern`.
///
/// Each pattern item must be present (`foo`, `foo=bar`) or absent
/// (`nofoo`); a `+` prefix matches a literal `no...` option.
#[must_use]
pub fn match_options(optstr: Option<&str>, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    let Ok(items) = split_optstr(pattern) else {
        return false;
    };
    let opts = optstr
        .and_then(|s| split_optstr(s).ok())
        .unwrap_or_default();

    items.iter().all(|(name, value)| {
        let (negated, name) = match name.strip_prefix('+') {
            Some(literal) => (false, literal),
            None => match name.strip_prefix("no") {
                Some(rest) => (true, rest),
                None => (false, name.as_str()),
            },
        };
        let found = opts
            .iter()
            .any(|(n, v)| n == name && (value.is_none() || v == value));
        found != negated
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_simple() {
        let list = OptionList::parse("a,b=1").unwrap();
        assert_eq!(list.to_optstr(Filter::All), "a,b=1");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn quoted_values_keep_commas() {
        let list = OptionList::parse(r#"ro,X-mount.auto-fstypes="ext4,xfs",noexec"#).unwrap();
        assert_eq!(list.len(), 3);
        let opt = list.get_named("X-mount.auto-fstypes").unwrap();
        assert_eq!(opt.unquoted_value(), Some("ext4,xfs"));
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(matches!(
            OptionList::parse(r#"a="b,c"#),
            Err(MountError::MountOptions { .. })
        ));
        assert!(OptionList::parse("=x").is_err());
    }

    #[test]
    fn flags_follow_order() {
        let list = OptionList::parse("ro,noexec,rw").unwrap();
        assert_eq!(list.get_flags(MapId::Linux), ms::NOEXEC);
        let list = OptionList::parse("rw,nosuid,ro,user,noauto").unwrap();
        assert_eq!(list.get_flags(MapId::Linux), ms::NOSUID | ms::RDONLY);
        assert_eq!(
            list.get_flags(MapId::Userspace),
            user::USER | user::NOAUTO
        );
    }

    #[test]
    fn user_options_imply_restrictive_flags() {
        let list = OptionList::parse("user,exec").unwrap();
        assert_eq!(list.kernel_flags(), ms::NOSUID | ms::NODEV);
        let list = OptionList::parse("ro,users").unwrap();
        assert_eq!(
            list.kernel_flags(),
            ms::RDONLY | ms::NOEXEC | ms::NOSUID | ms::NODEV
        );
        // a recorded user=<name> grants nothing by itself
        let list = OptionList::parse("user=kay").unwrap();
        assert_eq!(list.kernel_flags(), 0);
        assert_eq!(OptionList::parse("nouser").unwrap().kernel_flags(), 0);
    }

    #[test]
    fn set_optstr_keeps_flag_options() {
        let mut list = OptionList::new();
        list.set_flags(ms::RDONLY | ms::NOSUID, MapId::Linux);
        list.set_optstr(Some("noexec")).unwrap();
        list.set_optstr(Some("nodev")).unwrap();
        assert_eq!(list.to_optstr(Filter::All), "ro,nosuid,nodev");
    }

    #[test]
    fn append_flags_prefers_recursive_entries() {
        let mut list = OptionList::new();
        list.append_flags(ms::BIND | ms::REC, MapId::Linux);
        assert_eq!(list.to_optstr(Filter::All), "rbind");

        let mut list = OptionList::new();
        list.append_flags(ms::PRIVATE | ms::REC | ms::NOATIME, MapId::Linux);
        assert_eq!(list.to_optstr(Filter::All), "rprivate,noatime");
    }

    #[test]
    fn remove_flags_drops_matching_options() {
        let mut list = OptionList::parse("bind,ro,rw,x-foo").unwrap();
        list.remove_flags(ms::BIND | ms::RDONLY, MapId::Linux);
        assert_eq!(list.to_optstr(Filter::All), "rw,x-foo");
    }

    #[test]
    fn dedup_keeps_last_instance() {
        let mut list = OptionList::parse("ro,a=1,noexec,rw,a=2,exec,x-a,x-b").unwrap();
        list.dedup();
        assert_eq!(list.to_optstr(Filter::All), "rw,a=2,exec,x-a,x-b");
    }

    #[test]
    fn filters() {
        let list =
            OptionList::parse("ro,noauto,user=kay,x-gvfs-show,X-mount.mkdir,private,errors=remount-ro,comment=foo")
                .unwrap();
        assert_eq!(list.to_optstr(Filter::FsData), "errors=remount-ro");
        assert_eq!(list.to_optstr(Filter::Utab), "user=kay,x-gvfs-show");
        assert_eq!(
            list.to_optstr(Filter::Helpers),
            "ro,user=kay,errors=remount-ro"
        );
    }

    #[test]
    fn propagation_only() {
        assert!(OptionList::parse("rprivate").unwrap().is_propagation_only());
        assert!(OptionList::parse("shared,silent").unwrap().is_propagation_only());
        assert!(!OptionList::parse("shared,ro").unwrap().is_propagation_only());
        assert!(!OptionList::parse("ro").unwrap().is_propagation_only());
        assert_eq!(
            OptionList::parse("rslave").unwrap().propagation(),
            ms::SLAVE | ms::REC
        );
        assert_eq!(OptionList::parse("rbind").unwrap().propagation(), 0);
    }

    #[test]
    fn pattern_matching() {
        assert!(match_options(Some("ro,user,_netdev"), Some("user,_netdev")));
        assert!(!match_options(Some("ro,user,_netdev"), Some("no_netdev")));
        assert!(match_options(Some("ro,user"), Some("nousers")));
        assert!(!match_options(Some("ro,users"), Some("nousers")));
        assert!(match_options(Some("ro,uid=1000"), Some("uid=1000")));
        assert!(!match_options(Some("ro,uid=1000"), Some("uid=0")));
        assert!(match_options(Some("noatime"), Some("+noatime")));
        assert!(match_options(None, None));
        assert!(!match_options(None, Some("ro")));
    }

    proptest! {
        #[test]
        fn parse_preserves_unknown_options(names in proptest::collection::btree_set("[a-z]{3,8}", 1..8)) {
            let optstr = names
                .iter()
                .map(|name| format!("fs_{name}"))
                .collect::<Vec<_>>()
                .join(",");
            let list = OptionList::parse(&optstr).unwrap();
            prop_assert_eq!(list.to_optstr(Filter::All), optstr.clone());
            prop_assert_eq!(list.to_optstr(Filter::FsData), optstr);
        }

        #[test]
        fn dedup_is_idempotent(opts in proptest::collection::vec(
            prop_oneof![Just("ro"), Just("rw"), Just("noexec"), Just("exec"), Just("x-a"), Just("foo=1"), Just("foo=2")],
            0..12,
        )) {
            let mut list = OptionList::parse(&opts.join(",")).unwrap();
            let flags = list.get_flags(MapId::Linux);
            list.dedup();
            let once = list.clone();
            list.dedup();
            prop_assert_eq!(&list, &once);
            prop_assert_eq!(list.get_flags(MapId::Linux), flags);
        }
    }
}
