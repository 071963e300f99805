//! Mount tables: fstab, mountinfo and utab.

pub mod fs;
pub mod parse;

use std::sync::Arc;

pub use fs::Fs;
pub use parse::{FileTableProvider, TableFilter, TableProvider};

use crate::cache::SharedCache;

/// Search direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First entry wins (fstab).
    Forward,
    /// Last entry wins (live mount table).
    Backward,
}

/// An ordered, read-mostly collection of [`Fs`] entries.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Arc<Fs>>,
    cache: Option<SharedCache>,
}

impl Table {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from entries.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = Fs>) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            cache: None,
        }
    }

    /// Append an entry.
    pub fn push(&mut self, fs: Fs) {
        self.entries.push(Arc::new(fs));
    }

    /// Attach a cache used for canonical comparisons.
    pub fn set_cache(&mut self, cache: Option<SharedCache>) {
        self.cache = cache;
    }

    /// The attached cache.
    #[must_use]
    pub fn cache(&self) -> Option<&SharedCache> {
        self.cache.as_ref()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index` in forward order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Fs>> {
        self.entries.get(index)
    }

    /// Iterate in the given direction.
    pub fn iter(&self, direction: Direction) -> Box<dyn Iterator<Item = &Arc<Fs>> + '_> {
        match direction {
            Direction::Forward => Box::new(self.entries.iter()),
            Direction::Backward => Box::new(self.entries.iter().rev()),
        }
    }

    fn canonical(&self, path: &str) -> Option<String> {
        self.cache
            .as_ref()
            .and_then(|cache| cache.lock().resolve_path(path))
    }

    fn same_path(&self, entry: Option<&str>, path: &str) -> bool {
        let Some(entry) = entry else {
            return false;
        };
        if entry == path {
            return true;
        }
        let Some(wanted) = self.canonical(path) else {
            return false;
        };
        entry == wanted || self.canonical(entry).is_some_and(|e| e == wanted)
    }

    fn same_source(&self, entry: &Fs, source: &str) -> bool {
        if entry.source.as_deref() == Some(source) {
            return true;
        }
        let Some(cache) = self.cache.as_ref() else {
            return false;
        };
        let wanted = cache.lock().resolve_spec(source);
        let have = entry
            .source
            .as_deref()
            .and_then(|s| cache.lock().resolve_spec(s));
        wanted.is_some() && wanted == have
    }

    /// Find by mountpoint.
    #[must_use]
    pub fn find_target(&self, target: &str, direction: Direction) -> Option<Arc<Fs>> {
        self.iter(direction)
            .find(|fs| fs.target.as_deref() == Some(target))
            .or_else(|| {
                self.iter(direction)
                    .find(|fs| !fs.is_swaparea() && self.same_path(fs.target.as_deref(), target))
            })
            .cloned()
    }

    /// Find by source path, device tag, or canonical device.
    #[must_use]
    pub fn find_source(&self, source: &str, direction: Direction) -> Option<Arc<Fs>> {
        if let Some((name, value)) = fs::parse_tag(source) {
            return self.find_tag(name, value, direction);
        }
        self.iter(direction)
            .find(|fs| fs.source.as_deref() == Some(source))
            .or_else(|| self.iter(direction).find(|fs| self.same_source(fs, source)))
            .cloned()
    }

    /// Find by device tag, falling back to the device the tag resolves to.
    #[must_use]
    pub fn find_tag(&self, name: &str, value: &str, direction: Direction) -> Option<Arc<Fs>> {
        if let Some(found) = self
            .iter(direction)
            .find(|fs| fs.tag() == Some((name, value)))
        {
            return Some(Arc::clone(found));
        }
        let device = self.cache.as_ref()?.lock().resolve_tag(name, value)?;
        self.find_source(&device, direction)
    }

    /// Find by `(source, target)`.
    #[must_use]
    pub fn find_pair(&self, source: &str, target: &str, direction: Direction) -> Option<Arc<Fs>> {
        self.iter(direction)
            .find(|fs| {
                self.same_path(fs.target.as_deref(), target) && self.same_source(fs, source)
            })
            .cloned()
    }

    /// Whether `fs` is already mounted according to this (live) table.
    #[must_use]
    pub fn is_fs_mounted(&self, fs: &Fs) -> bool {
        let Some(target) = fs.target.as_deref() else {
            return false;
        };
        self.iter(Direction::Backward).any(|entry| {
            self.same_path(entry.target.as_deref(), target)
                && fs.source.as_deref().is_none_or(|src| {
                    self.same_source(entry, src)
                        || (fs.is_pseudofs() && entry.fstype == fs.fstype)
                })
        })
    }

    /// Copy utab userspace options onto the matching live entries.
    pub fn merge_user_options(&mut self, utab: &Self) {
        for user in utab.iter(Direction::Forward) {
            let Some(target) = user.target.as_deref() else {
                continue;
            };
            let found = self.entries.iter_mut().rev().find(|fs| {
                fs.target.as_deref() == Some(target)
                    && (user.root.is_none() || fs.root == user.root)
            });
            if let Some(fs) = found {
                let fs = Arc::make_mut(fs);
                fs.user_options.clone_from(&user.user_options);
                fs.attrs.clone_from(&user.attrs);
                if user.bindsrc.is_some() {
                    fs.bindsrc.clone_from(&user.bindsrc);
                }
            }
        }
    }
}
